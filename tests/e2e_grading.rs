use std::{fs, path::PathBuf};

use tpac::{
    RunOptions, RunStage, Source, SourceKind, Tester, TesterOptions,
    constants::{
        CODE_COVERAGE_KEY, GRADING_MODULES, MASTER_PERCENT_PASSED_KEY, PEP8_KEY,
        PERCENT_PASSED_KEY,
    },
    source::PythonEnv,
};
use uuid::Uuid;

/// Provisions the environment a run in `report_dir` will use and checks it
/// can import every grading tool. The run then reuses it.
async fn grading_env_ready(report_dir: &std::path::Path) -> bool {
    if fs::create_dir_all(report_dir).is_err() {
        return false;
    }
    let env = PythonEnv::new(report_dir.join("venv"));
    if let Err(e) = env.recreate(report_dir).await {
        eprintln!("cannot create the grading environment: {e:#}");
        return false;
    }
    match env.missing_modules(&GRADING_MODULES).await {
        Ok(missing) if missing.is_empty() => true,
        Ok(missing) => {
            eprintln!("grading environment lacks {}", missing.join(", "));
            false
        }
        Err(e) => {
            eprintln!("cannot inspect the grading environment: {e:#}");
            false
        }
    }
}

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("tpac-e2e-{}", Uuid::new_v4()));
    fs::create_dir_all(&root).expect("create temp root");
    root
}

fn write(path: PathBuf, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(path, contents).expect("write file");
}

/// Two functions, one PEP8 violation (`E225`), and a passing test for each.
fn write_project(root: &std::path::Path) {
    write(
        root.join("project").join("src").join("calc.py"),
        "def add(a, b):\n    total=a + b\n    return total\n\n\ndef sub(a, b):\n    return a - b\n",
    );
    write(
        root.join("project").join("tests").join("test_calc.py"),
        "from calc import add, sub\n\n\ndef test_add():\n    assert add(1, 2) == 3\n\n\ndef \
         test_sub():\n    assert sub(3, 2) == 1\n",
    );
}

#[tokio::test]
async fn grades_a_small_project() {
    let root = temp_root();
    if !grading_env_ready(&root.join("report_dir")).await {
        eprintln!("skipping: no environment with pytest, pytest-cov, pytest-json-report and pycodestyle");
        let _ = fs::remove_dir_all(root);
        return;
    }
    write_project(&root);
    let code = Source::local(SourceKind::Code, root.join("project").join("src")).unwrap();
    let tests = Source::local(SourceKind::Tests, root.join("project").join("tests")).unwrap();
    let options = TesterOptions::builder()
        .report_dir(root.join("report_dir"))
        .build();
    let mut tester = Tester::new(code, tests, options).unwrap();

    let report = tester
        .run(RunOptions::default())
        .await
        .expect("grading run")
        .clone();

    assert_eq!(report.value(PERCENT_PASSED_KEY), Some(100.0));
    assert_eq!(report.value(CODE_COVERAGE_KEY), Some(100.0));
    let pep8 = report.value(PEP8_KEY).expect("pep8 score");
    assert!(pep8 < 100.0, "pep8 = {pep8}");
    assert!(!report.contains(MASTER_PERCENT_PASSED_KEY));
    let grade = report.grade();
    assert!(grade > 0.0 && grade < 100.0, "grade = {grade}");

    assert_eq!(tester.stage(), RunStage::ReportSaved);
    assert!(tester.report_filepath().is_file());
    assert!(!tester.report_dir().join("coverage.json").exists());
    assert!(!tester.report_dir().join(".report.json").exists());

    let summary = tester.test_cases_summary().expect("summary");
    assert_eq!((summary.passed, summary.total), (2, 2));

    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn master_tests_are_scored_separately() {
    let root = temp_root();
    if !grading_env_ready(&root.join("report_dir")).await {
        eprintln!("skipping: no environment with pytest, pytest-cov, pytest-json-report and pycodestyle");
        let _ = fs::remove_dir_all(root);
        return;
    }
    write_project(&root);
    write(
        root.join("instructor").join("tests").join("test_calc.py"),
        "from calc import add\n\n\ndef test_add():\n    assert add(2, 2) == 4\n\n\ndef \
         test_add_floats():\n    assert add(0.1, 0.2) == 0.3\n",
    );

    let code = Source::local(SourceKind::Code, root.join("project").join("src")).unwrap();
    let tests = Source::local(SourceKind::Tests, root.join("project").join("tests")).unwrap();
    let master =
        Source::local(SourceKind::MasterTests, root.join("instructor").join("tests")).unwrap();
    let options = TesterOptions::builder()
        .report_dir(root.join("report_dir"))
        .build();
    let mut tester = Tester::new(code, tests, options)
        .unwrap()
        .with_master_tests(master);

    let run = RunOptions::builder().clear_temporary_files(true).build();
    let report = tester.run(run).await.expect("grading run").clone();

    assert_eq!(report.value(PERCENT_PASSED_KEY), Some(100.0));
    assert_eq!(report.value(MASTER_PERCENT_PASSED_KEY), Some(50.0));
    assert_eq!(tester.stage(), RunStage::TemporaryFilesCleared);
    assert!(tester.report_filepath().is_file());
    assert!(!tester.report_dir().join("master_tests").exists());

    let _ = fs::remove_dir_all(root);
}
