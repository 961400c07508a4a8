use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tpac::{
    RunStage, Source, SourceKind, Tester, TesterOptions,
    error::{ArtifactError, ArtifactKind},
    util,
};
use uuid::Uuid;

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("tpac-tester-{}", Uuid::new_v4()));
    fs::create_dir_all(&root).expect("create temp root");
    root
}

fn write(path: PathBuf, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(path, contents).expect("write file");
}

/// Runs git in `dir` with a throwaway identity and returns its stdout.
fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(["-c", "user.name=tpac-tests", "-c", "user.email=tests@tpac"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// A bare repository at `<root>/reports.git` whose `main` branch holds a
/// README.
fn bare_report_repo(root: &Path) -> PathBuf {
    let bare = root.join("reports.git");
    fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "--bare", "-b", "main"]);

    let seed = root.join("seed");
    write(seed.join("README.md"), "reports\n");
    git(&seed, &["init", "-b", "main"]);
    git(&seed, &["add", "."]);
    git(&seed, &["commit", "-m", "initial"]);
    git(&seed, &["remote", "add", "origin", &bare.to_string_lossy()]);
    git(&seed, &["push", "origin", "main"]);
    bare
}

/// A tester over a small project, set up in `<root>/report_dir`. The
/// environment directory is created beforehand so setup reuses it instead of
/// provisioning a real one.
async fn set_up_tester(root: &Path, options: TesterOptions) -> Tester {
    let project = root.join("project");
    write(project.join("src").join("pkg").join("a.py"), "def a():\n    return 1\n");
    write(project.join("src").join("pkg").join("b.py"), "def b():\n    return 2\n");
    write(
        project.join("tests").join("test_a.py"),
        "from pkg.a import a\n\n\ndef test_a():\n    assert a() == 1\n",
    );
    let report_dir = root.join("report_dir");
    fs::create_dir_all(report_dir.join("venv")).unwrap();

    let code = Source::local(SourceKind::Code, project.join("src")).unwrap();
    let tests = Source::local(SourceKind::Tests, project.join("tests")).unwrap();
    let options = TesterOptions {
        report_dir: Some(report_dir),
        ..options
    };
    let mut tester = Tester::new(code, tests, options).unwrap();
    tester.setup(false).await.expect("setup");
    tester
}

const COVERAGE: &str = r#"{
    "meta": {"version": "7.4.0", "branch_coverage": false},
    "files": {
        "src/pkg/a.py": {"summary": {"covered_lines": 4, "percent_covered": 80.0}},
        "src/pkg/b.py": {"summary": {"covered_lines": 3, "percent_covered": 60.0}},
        "tests/test_a.py": {"summary": {"covered_lines": 5, "percent_covered": 100.0}}
    },
    "totals": {"percent_covered": 80.0}
}"#;

#[tokio::test]
async fn coverage_is_the_mean_over_code_files() {
    let root = temp_root();
    let tester = set_up_tester(&root, TesterOptions::default()).await;
    assert!(tester.is_setup());
    assert_eq!(tester.stage(), RunStage::SourcesMaterialized);

    fs::write(tester.report_dir().join("coverage.json"), COVERAGE).unwrap();
    let coverage = tester.get_code_coverage().expect("coverage");
    assert!((coverage - 70.0).abs() < 1e-9);

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn zero_test_summary_uses_the_configured_ratio() {
    let root = temp_root();
    let summary = r#"{"created": 1.0, "summary": {"total": 0, "collected": 0}}"#;

    let strict = set_up_tester(&root.join("strict"), TesterOptions::default()).await;
    fs::write(strict.report_dir().join(".report.json"), summary).unwrap();
    let counts = strict.get_test_cases_summary().expect("summary");
    assert_eq!(counts.total, 0);
    assert_eq!(counts.percent_passed, 0.0);

    let lenient_options = TesterOptions::builder().zero_tests_ratio(1.0).build();
    let lenient = set_up_tester(&root.join("lenient"), lenient_options).await;
    fs::write(lenient.report_dir().join(".report.json"), summary).unwrap();
    let counts = lenient.get_test_cases_summary().expect("summary");
    assert_eq!(counts.percent_passed, 100.0);

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn missing_artifacts_are_named() {
    let root = temp_root();
    let tester = set_up_tester(&root, TesterOptions::default()).await;

    let err = tester.get_code_coverage().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::Missing {
            kind: ArtifactKind::Coverage,
            ..
        })
    ));
    let err = tester.get_test_cases_summary().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::Missing {
            kind: ArtifactKind::Summary,
            ..
        })
    ));

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn clearing_pytest_files_removes_artifacts_and_caches() {
    let root = temp_root();
    let tester = set_up_tester(&root, TesterOptions::default()).await;
    let report_dir = tester.report_dir().to_path_buf();

    for name in [".coverage", "coverage.json", "coverage.xml", ".report.json"] {
        write(report_dir.join(name), "{}");
    }
    write(report_dir.join("src").join("__pycache__").join("a.cpython-312.pyc"), "");
    write(report_dir.join("tests").join("stale.pyc"), "");
    write(report_dir.join(".pytest_cache").join("README.md"), "");

    tester.clear_pytest_temporary_files();

    for name in [".coverage", "coverage.json", "coverage.xml", ".report.json"] {
        assert!(!report_dir.join(name).exists(), "{name} left behind");
    }
    assert!(!report_dir.join("src").join("__pycache__").exists());
    assert!(!report_dir.join("tests").join("stale.pyc").exists());
    assert!(!report_dir.join(".pytest_cache").exists());
    assert!(report_dir.join("src").join("pkg").join("a.py").exists());

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn clearing_temporary_files_removes_sources_and_rm_report_dir_removes_all() {
    let root = temp_root();
    let mut tester = set_up_tester(&root, TesterOptions::default()).await;
    let report_dir = tester.report_dir().to_path_buf();

    tester.clear_temporary_files();
    assert_eq!(tester.stage(), RunStage::TemporaryFilesCleared);
    assert!(!report_dir.join("src").exists());
    assert!(!report_dir.join("tests").exists());
    assert!(!report_dir.join("venv").exists());
    assert!(root.join("project").join("src").join("pkg").join("a.py").exists());

    tester.rm_report_dir().expect("rm report dir");
    assert!(!report_dir.exists());
    // removing an absent directory is fine
    tester.rm_report_dir().expect("rm report dir again");

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn report_filepath_defaults_into_report_dir() {
    let root = temp_root();
    let tester = set_up_tester(&root, TesterOptions::default()).await;
    assert_eq!(
        tester.report_filepath(),
        tester.report_dir().join("report.json")
    );
    assert_eq!(tester.report().report_filepath(), Some(tester.report_filepath()));

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn report_is_pushed_to_an_explicit_repository() {
    if util::git_path().is_err() {
        eprintln!("skipping: git not found");
        return;
    }
    let root = temp_root();
    let bare = bare_report_repo(&root);
    let tester = set_up_tester(&root, TesterOptions::default()).await;
    fs::write(tester.report_filepath(), r#"{"grade": 87.5}"#).unwrap();

    tester
        .push_report_to(Some(bare.to_str().expect("utf-8 path")))
        .await
        .expect("push");

    assert_eq!(git(&bare, &["show", "main:report.json"]), r#"{"grade": 87.5}"#);
    assert!(git(&bare, &["show", "main:README.md"]).starts_with("reports"));
    assert!(!tester.report_dir().join("tmp_report_git").exists());

    // pushing the same report again has nothing to commit
    tester.push_report_to(Some(bare.to_str().unwrap())).await.expect("second push");
    assert_eq!(git(&bare, &["rev-list", "--count", "main"]).trim(), "2");

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn auto_push_targets_the_remote_of_the_code_checkout() {
    if util::git_path().is_err() {
        eprintln!("skipping: git not found");
        return;
    }
    let root = temp_root();
    let bare = bare_report_repo(&root);
    let tester = set_up_tester(&root, TesterOptions::default()).await;
    fs::write(tester.report_filepath(), "{}").unwrap();

    // the code lives in `project/src`, a sub-directory of the checkout
    let project = root.join("project");
    git(&project, &["init", "-b", "main"]);
    git(&project, &["remote", "add", "origin", &bare.to_string_lossy()]);

    tester.push_report_to(Some("auto")).await.expect("push");
    assert_eq!(git(&bare, &["show", "main:report.json"]), "{}");

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn auto_push_without_a_remote_is_skipped() {
    if util::git_path().is_err() {
        eprintln!("skipping: git not found");
        return;
    }
    let root = temp_root();
    let tester = set_up_tester(&root, TesterOptions::default()).await;
    fs::write(tester.report_filepath(), "{}").unwrap();

    tester.push_report_to(None).await.expect("auto detection failure is not an error");
    assert!(!tester.report_dir().join("tmp_report_git").exists());

    let _ = fs::remove_dir_all(root);
}
