#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! The two JSON files the test runner leaves behind, and what is derived from
//! them.
//!
//! * the coverage report (`pytest-cov --cov-report=json`), reduced to the mean
//!   `percent_covered` of the files lying under the code source;
//! * the test summary (`pytest-json-report --json-report-summary`), reduced to
//!   a [`TestCasesSummary`].

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ArtifactError, ArtifactKind},
    util,
};

/// Reads the artifact at `path`, failing with [`ArtifactError::Missing`] when
/// the runner did not write it.
fn read_artifact(kind: ArtifactKind, path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(ArtifactError::Missing {
            kind,
            searched: path.display().to_string(),
        }
        .into());
    }
    fs::read_to_string(path).map_err(|e| {
        ArtifactError::Malformed {
            kind,
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Per-file coverage numbers.
#[derive(Debug, Clone, Deserialize)]
struct FileSummary {
    /// Percentage of statements covered in the file.
    percent_covered: f64,
}

/// One entry of the coverage report's `files` map.
#[derive(Debug, Clone, Deserialize)]
struct CoveredFile {
    /// Coverage numbers of the file.
    summary: FileSummary,
}

/// A parsed JSON coverage report.
#[derive(Debug, Clone, Deserialize)]
pub struct CoverageArtifact {
    /// File path, as written by coverage.py, to its numbers.
    files: BTreeMap<String, CoveredFile>,
}

impl CoverageArtifact {
    /// Parses a coverage report; `path` is only used in errors.
    pub fn parse(json: &str, path: &Path) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            ArtifactError::Malformed {
                kind:   ArtifactKind::Coverage,
                path:   path.to_path_buf(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Reads and parses the coverage report at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = read_artifact(ArtifactKind::Coverage, path)?;
        Self::parse(&json, path)
    }

    /// Number of files in the report.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the report covers no file.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// `percent_covered` of every file lying under `code_root`.
    ///
    /// Relative paths in the report are resolved against `base_dir`, the
    /// directory the runner was started from.
    pub fn percents_under(&self, code_root: &Path, base_dir: &Path) -> Vec<f64> {
        let root = util::normalize_lexically(code_root);
        let canonical_root = fs::canonicalize(&root).ok();

        self.files
            .iter()
            .filter(|(file, _)| {
                let file = Path::new(file.as_str());
                let resolved = if file.is_absolute() {
                    util::normalize_lexically(file)
                } else {
                    util::normalize_lexically(&base_dir.join(file))
                };
                if resolved.starts_with(&root) {
                    return true;
                }
                match (&canonical_root, fs::canonicalize(&resolved)) {
                    (Some(canonical_root), Ok(canonical)) => canonical.starts_with(canonical_root),
                    _ => false,
                }
            })
            .map(|(_, covered)| covered.summary.percent_covered)
            .collect()
    }

    /// Mean `percent_covered` of the files under `code_root`, or
    /// `empty_percent` when none is.
    pub fn mean_percent_under(&self, code_root: &Path, base_dir: &Path, empty_percent: f64) -> f64 {
        let percents = self.percents_under(code_root, base_dir);
        if percents.is_empty() {
            tracing::warn!(
                "No covered file lies under {}, coverage defaults to {empty_percent}.",
                code_root.display()
            );
            return empty_percent;
        }
        percents.iter().sum::<f64>() / percents.len() as f64
    }
}

/// Counts found under the summary's `summary` key.
#[derive(Debug, Clone, Deserialize)]
struct SummaryCounts {
    /// Tests that passed.
    #[serde(default)]
    passed: u64,
    /// Tests that failed.
    #[serde(default)]
    failed: u64,
    /// Tests collected.
    total:  Option<u64>,
}

/// A parsed `pytest-json-report` file.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryArtifact {
    /// The counts; everything else in the report is ignored.
    summary: SummaryCounts,
}

impl SummaryArtifact {
    /// Parses a summary; `path` is only used in errors.
    pub fn parse(json: &str, path: &Path) -> Result<Self> {
        let artifact: Self = serde_json::from_str(json).map_err(|e| ArtifactError::Malformed {
            kind:   ArtifactKind::Summary,
            path:   path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if artifact.summary.total.is_none() {
            return Err(ArtifactError::MissingTotal(path.to_path_buf()).into());
        }
        Ok(artifact)
    }

    /// Reads and parses the summary at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = read_artifact(ArtifactKind::Summary, path)?;
        Self::parse(&json, path)
    }

    /// Reduces the counts, crediting `zero_tests_ratio` to an empty suite.
    pub fn to_summary(&self, zero_tests_ratio: f64) -> TestCasesSummary {
        let counts = &self.summary;
        TestCasesSummary::from_counts(
            counts.passed,
            counts.failed,
            counts.total.unwrap_or_default(),
            zero_tests_ratio,
        )
    }
}

/// Pass/fail numbers of one runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestCasesSummary {
    /// Tests that passed.
    pub passed:         u64,
    /// Tests that failed.
    pub failed:         u64,
    /// Tests collected.
    pub total:          u64,
    /// `passed / total`.
    pub ratio_passed:   f64,
    /// `failed / total`.
    pub ratio_failed:   f64,
    /// `100 × ratio_passed`.
    pub percent_passed: f64,
    /// `100 × ratio_failed`.
    pub percent_failed: f64,
}

impl TestCasesSummary {
    /// Computes the ratios. With `total == 0` the passed ratio is
    /// `zero_tests_ratio` and the failed ratio its complement.
    pub fn from_counts(passed: u64, failed: u64, total: u64, zero_tests_ratio: f64) -> Self {
        let (ratio_passed, ratio_failed) = if total > 0 {
            (passed as f64 / total as f64, failed as f64 / total as f64)
        } else {
            (zero_tests_ratio, 1.0 - zero_tests_ratio)
        };
        Self {
            passed,
            failed,
            total,
            ratio_passed,
            ratio_failed,
            percent_passed: 100.0 * ratio_passed,
            percent_failed: 100.0 * ratio_failed,
        }
    }
}

impl fmt::Display for TestCasesSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} passed ({:.2} %), {} failed",
            self.passed, self.total, self.percent_passed, self.failed
        )
    }
}

/// Where the runner artifacts of a report directory live.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    /// Raw coverage database.
    pub dot_coverage:  PathBuf,
    /// JSON coverage report.
    pub coverage_json: PathBuf,
    /// XML coverage report.
    pub coverage_xml:  PathBuf,
    /// JSON test summary.
    pub report_json:   PathBuf,
}

impl ArtifactPaths {
    /// Artifact locations inside `report_dir`.
    pub fn in_dir(report_dir: &Path) -> Self {
        use crate::constants::{COVERAGE_JSON, COVERAGE_XML, DOT_COVERAGE, DOT_REPORT_JSON};
        Self {
            dot_coverage:  report_dir.join(DOT_COVERAGE),
            coverage_json: report_dir.join(COVERAGE_JSON),
            coverage_xml:  report_dir.join(COVERAGE_XML),
            report_json:   report_dir.join(DOT_REPORT_JSON),
        }
    }

    /// Every path, in a fixed order.
    pub fn all(&self) -> [&Path; 4] {
        [
            &self.dot_coverage,
            &self.coverage_json,
            &self.coverage_xml,
            &self.report_json,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COVERAGE: &str = r#"{
        "meta": {"version": "7.4.0"},
        "files": {
            "pkg/a.py": {"summary": {"percent_covered": 80}},
            "pkg/b.py": {"summary": {"percent_covered": 60.0}},
            "elsewhere/c.py": {"summary": {"percent_covered": 0}}
        },
        "totals": {"percent_covered": 46.6}
    }"#;

    #[test]
    fn coverage_mean_only_counts_files_under_code_root() {
        let artifact = CoverageArtifact::parse(COVERAGE, Path::new("coverage.json")).unwrap();
        let base = Path::new("/work/report_dir");
        let mean = artifact.mean_percent_under(Path::new("/work/report_dir/pkg"), base, 0.0);
        assert!((mean - 70.0).abs() < 1e-9);
    }

    #[test]
    fn coverage_resolves_parent_relative_paths() {
        let json = r#"{"files": {"../src/a.py": {"summary": {"percent_covered": 50}}}}"#;
        let artifact = CoverageArtifact::parse(json, Path::new("coverage.json")).unwrap();
        let mean = artifact.mean_percent_under(
            Path::new("/work/src"),
            Path::new("/work/report_dir"),
            0.0,
        );
        assert_eq!(mean, 50.0);
    }

    #[test]
    fn coverage_without_matching_files_uses_policy() {
        let artifact = CoverageArtifact::parse(COVERAGE, Path::new("coverage.json")).unwrap();
        let mean = artifact.mean_percent_under(Path::new("/nowhere"), Path::new("/work"), 12.5);
        assert_eq!(mean, 12.5);
    }

    #[test]
    fn coverage_without_files_key_is_malformed() {
        let err = CoverageArtifact::parse("{}", Path::new("coverage.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::Malformed {
                kind: ArtifactKind::Coverage,
                ..
            })
        ));
    }

    #[test]
    fn summary_defaults_missing_counts_to_zero() {
        let json = r#"{"summary": {"passed": 3, "total": 4, "collected": 4}}"#;
        let summary = SummaryArtifact::parse(json, Path::new(".report.json"))
            .unwrap()
            .to_summary(0.0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.percent_passed, 75.0);
    }

    #[test]
    fn summary_without_total_is_rejected() {
        let json = r#"{"summary": {"passed": 3}}"#;
        let err = SummaryArtifact::parse(json, Path::new(".report.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::MissingTotal(_))
        ));
    }

    #[test]
    fn zero_tests_use_the_configured_ratio() {
        let summary = TestCasesSummary::from_counts(0, 0, 0, 0.0);
        assert_eq!(summary.percent_passed, 0.0);
        assert_eq!(summary.percent_failed, 100.0);

        let lenient = TestCasesSummary::from_counts(0, 0, 0, 1.0);
        assert_eq!(lenient.percent_passed, 100.0);
    }

    #[test]
    fn missing_file_is_reported_as_missing() {
        let path = std::env::temp_dir().join("tpac-no-such-artifact.json");
        let err = SummaryArtifact::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::Missing {
                kind: ArtifactKind::Summary,
                ..
            })
        ));
    }
}
