use std::{fs, path::PathBuf};

use tpac::{GradeScale, Report, error::ReportError, report::is_close};
use uuid::Uuid;

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("tpac-report-{}", Uuid::new_v4()));
    fs::create_dir_all(&root).expect("create temp root");
    root
}

fn sample() -> Report {
    let mut report = Report::new();
    report.add("code_coverage", 92.0, 1.0).unwrap();
    report.add("percent_passed", 100.0, 2.0).unwrap();
    report.add("PEP8", 97.5, 0.5).unwrap();
    report
}

#[test]
fn save_then_load_reproduces_data_and_grade() {
    let root = temp_root();
    let path = root.join("nested").join("report.json");

    let mut report = sample().with_scale(GradeScale::new(0.0, 50.0, 100.0).unwrap());
    let saved_to = report.save(Some(path.as_path())).expect("save");
    assert_eq!(saved_to, path);

    let mut loaded = Report::new();
    loaded.load(Some(path.as_path())).expect("load");

    assert_eq!(loaded.len(), report.len());
    for (name, entry) in report.iter() {
        assert_eq!(loaded.get(name), Some(entry));
    }
    assert!(is_close(loaded.grade(), report.grade()));
    assert_eq!(loaded.scale().grade_min_value(), 50.0);
    assert_eq!(loaded.report_filepath(), Some(path.as_path()));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn saved_document_is_self_describing() {
    let root = temp_root();
    let path = root.join("report.json");
    let mut report = sample().with_kwarg("student", "abc123");
    report.save(Some(path.as_path())).unwrap();

    let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert!(doc["grade"].is_f64());
    assert_eq!(doc["data"]["PEP8"]["value"], 97.5);
    assert_eq!(doc["data"]["percent_passed"]["weight"], 2.0);
    assert_eq!(doc["kwargs"]["grade_max"], 100.0);
    assert_eq!(doc["kwargs"]["student"], "abc123");
    assert!(doc["args"].as_array().is_some_and(Vec::is_empty));
    assert!(!root.join("report.json.tmp").exists());

    let loaded = Report::from_file(&path).unwrap();
    assert!(is_close(loaded.grade(), report.grade()));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn tampered_grade_fails_to_load() {
    let root = temp_root();
    let path = root.join("report.json");
    sample().save(Some(path.as_path())).unwrap();

    let mut doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    doc["grade"] = serde_json::json!(1.0);
    fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

    let err = Report::from_file(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ReportError>(),
        Some(ReportError::GradeMismatch { .. })
    ));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn configured_filepath_is_used_by_default() {
    let root = temp_root();
    let path = root.join("report.json");

    let mut report = sample().with_filepath(&path);
    report.save(None).expect("save to configured path");
    assert!(path.is_file());

    let mut loaded = Report::new().with_filepath(&path);
    loaded.load(None).expect("load from configured path");
    assert_eq!(loaded.len(), 3);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn table_lists_every_metric_and_the_grade() {
    let table = sample().table();
    for name in ["code_coverage", "percent_passed", "PEP8", "Grade:"] {
        assert!(table.contains(name), "missing {name} in\n{table}");
    }
}

#[test]
fn failed_load_leaves_the_report_untouched() {
    let root = temp_root();
    let good = root.join("report.json");
    let bad = root.join("broken.json");
    fs::write(&bad, "{ not json").unwrap();

    let mut report = sample().with_filepath(&good);
    let grade = report.grade();
    assert!(report.load(Some(bad.as_path())).is_err());
    assert!(report.load(Some(root.join("missing.json").as_path())).is_err());

    assert_eq!(report.report_filepath(), Some(good.as_path()));
    assert_eq!(report.len(), 3);
    assert!(is_close(report.grade(), grade));

    let _ = fs::remove_dir_all(root);
}
