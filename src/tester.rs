#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! The grading pipeline.
//!
//! A [`Tester`] owns its sources and its [`Report`]. [`Tester::run`] walks
//! through the [`RunStage`]s: sources are materialized in the report
//! directory, the student's tests run with coverage, coverage, pass ratio
//! and style are scored, the master tests (if any) run against the same code,
//! then the report is saved and temporary files are optionally cleared.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use bon::Builder;

use crate::{
    artifacts::{ArtifactPaths, CoverageArtifact, SummaryArtifact, TestCasesSummary},
    constants::{
        CODE_COVERAGE_KEY, DEFAULT_REPO_BRANCH, DEFAULT_REPORT_DIRNAME, DEFAULT_REPORT_FILENAME,
        EMPTY_COVERAGE_PERCENT, MASTER_PERCENT_PASSED_KEY, MASTER_TESTS_RENAME_PATTERN,
        METRIC_KEYS, PEP8_KEY, PERCENT_PASSED_KEY, REPORT_PUBLISH_DIRNAME, ZERO_TESTS_RATIO_PASSED,
    },
    report::{GradeScale, Report},
    runner::{self, PytestRunner},
    source::{GitRepo, Origin, Source, SourceKind, git},
    style::{Pep8Checker, StyleScore},
    util,
};

/// Weight of a metric nobody configured.
const DEFAULT_WEIGHT: f64 = 1.0;

/// Commit message used when publishing a report.
const PUBLISH_COMMIT_MESSAGE: &str = "Update grading report";

/// Weight of every metric, keyed by report key.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights(BTreeMap<String, f64>);

impl Default for Weights {
    fn default() -> Self {
        Self(
            METRIC_KEYS
                .iter()
                .map(|key| (key.to_string(), DEFAULT_WEIGHT))
                .collect(),
        )
    }
}

impl Weights {
    /// Weight of `key`, `1.0` when unset.
    pub fn get(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    /// Sets the weight of `key`.
    pub fn set(&mut self, key: impl Into<String>, weight: f64) -> &mut Self {
        self.0.insert(key.into(), weight);
        self
    }

    /// Overrides the weights present in `overrides`, keeping the others.
    pub fn merge<K: Into<String>>(&mut self, overrides: impl IntoIterator<Item = (K, f64)>) {
        for (key, weight) in overrides {
            self.0.insert(key.into(), weight);
        }
    }

    /// Every weight, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Weights {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        let mut weights = Weights::default();
        weights.merge(iter);
        weights
    }
}

/// How a [`Tester`] is configured.
#[derive(Debug, Clone, Default, Builder)]
pub struct TesterOptions {
    /// Where sources are materialized and artifacts land;
    /// `./report_dir` by default.
    #[builder(into)]
    pub report_dir:             Option<PathBuf>,
    /// Where the report is saved; `<report_dir>/report.json` by default.
    #[builder(into)]
    pub report_filepath:        Option<PathBuf>,
    /// Metric weights.
    #[builder(default)]
    pub weights:                Weights,
    /// Rescaling from the weighted mean to the final grade.
    #[builder(default)]
    pub scale:                  GradeScale,
    /// Ratio of passed tests credited to a suite without tests.
    pub zero_tests_ratio:       Option<f64>,
    /// Coverage credited when no covered file lies under the code source.
    pub empty_coverage_percent: Option<f64>,
    /// Branch reports are pushed to.
    #[builder(into)]
    pub report_branch:          Option<String>,
}

/// What a single [`Tester::run`] does besides grading.
#[derive(Debug, Clone, Builder)]
pub struct RunOptions {
    /// Re-materialize sources and recreate environments.
    #[builder(default)]
    pub overwrite:                    bool,
    /// Save the report once scored.
    #[builder(default = true)]
    pub save_report:                  bool,
    /// Remove runner artifacts and caches afterwards.
    #[builder(default = true)]
    pub clear_pytest_temporary_files: bool,
    /// Remove every materialized source afterwards.
    #[builder(default)]
    pub clear_temporary_files:        bool,
    /// Weights overriding the configured ones, for this run on.
    #[builder(default)]
    pub weights:                      BTreeMap<String, f64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions::builder().build()
    }
}

/// How far the last [`Tester::run`] got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStage {
    /// Nothing done yet.
    Uninitialized,
    /// Every source has a working copy.
    SourcesMaterialized,
    /// The student's tests ran.
    PrimaryTestsRun,
    /// Coverage, pass ratio and style are in the report.
    PrimaryScored,
    /// The master tests ran.
    MasterTestsRun,
    /// The master pass ratio is in the report.
    MasterScored,
    /// The report is on disk.
    ReportSaved,
    /// Materialized sources were removed.
    TemporaryFilesCleared,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Uninitialized => "UNINITIALIZED",
            RunStage::SourcesMaterialized => "SOURCES_MATERIALIZED",
            RunStage::PrimaryTestsRun => "PRIMARY_TESTS_RUN",
            RunStage::PrimaryScored => "PRIMARY_SCORED",
            RunStage::MasterTestsRun => "MASTER_TESTS_RUN",
            RunStage::MasterScored => "MASTER_SCORED",
            RunStage::ReportSaved => "REPORT_SAVED",
            RunStage::TemporaryFilesCleared => "TEMP_FILES_CLEARED",
        };
        write!(f, "{name}")
    }
}

/// Runs the tests of a code source and grades it.
#[derive(Debug)]
pub struct Tester {
    /// The student's code.
    code_src:                  Source,
    /// The student's tests.
    tests_src:                 Source,
    /// Reference code the master tests import instead of the student's.
    master_code_src:           Option<Source>,
    /// Instructor tests.
    master_tests_src:          Option<Source>,
    /// Where sources are materialized and artifacts land.
    report_dir:                PathBuf,
    /// Where the report is saved.
    report_filepath:           PathBuf,
    /// The scores.
    report:                    Report,
    /// Metric weights.
    weights:                   Weights,
    /// Ratio of passed tests credited to a suite without tests.
    zero_tests_ratio:          f64,
    /// Coverage credited when no covered file lies under the code source.
    empty_coverage_percent:    f64,
    /// Branch reports are pushed to.
    report_branch:             String,
    /// Style checker.
    style:                     Pep8Checker,
    /// Pass/fail numbers of the last primary pass.
    test_cases_summary:        Option<TestCasesSummary>,
    /// Pass/fail numbers of the last master pass.
    master_test_cases_summary: Option<TestCasesSummary>,
    /// How far the last run got.
    stage:                     RunStage,
}

impl Tester {
    /// Creates a tester for `code_src` and `tests_src`.
    pub fn new(code_src: Source, tests_src: Source, options: TesterOptions) -> Result<Self> {
        let report_dir = match options.report_dir {
            Some(dir) => util::absolutize(&dir)?,
            None => std::env::current_dir()
                .context("Could not read the current directory")?
                .join(DEFAULT_REPORT_DIRNAME),
        };
        let report_filepath = match options.report_filepath {
            Some(path) => util::absolutize(&path)?,
            None => report_dir.join(DEFAULT_REPORT_FILENAME),
        };

        Ok(Self {
            code_src,
            tests_src,
            master_code_src: None,
            master_tests_src: None,
            report: Report::new()
                .with_filepath(&report_filepath)
                .with_scale(options.scale),
            report_dir,
            report_filepath,
            weights: options.weights,
            zero_tests_ratio: options.zero_tests_ratio.unwrap_or(ZERO_TESTS_RATIO_PASSED),
            empty_coverage_percent: options
                .empty_coverage_percent
                .unwrap_or(EMPTY_COVERAGE_PERCENT),
            report_branch: options
                .report_branch
                .unwrap_or_else(|| DEFAULT_REPO_BRANCH.to_string()),
            style: Pep8Checker::default(),
            test_cases_summary: None,
            master_test_cases_summary: None,
            stage: RunStage::Uninitialized,
        })
    }

    /// A tester over fresh `src` and `tests` directories found under the
    /// current directory.
    pub fn discover(options: TesterOptions) -> Result<Self> {
        let code_src = Source::discover(SourceKind::Code)?;
        let tests_src = Source::discover(SourceKind::Tests)?;
        Self::new(code_src, tests_src, options)
    }

    /// Adds an instructor test suite, run in a second pass.
    pub fn with_master_tests(mut self, master_tests_src: Source) -> Self {
        self.master_tests_src = Some(master_tests_src);
        self
    }

    /// Adds reference code for the master pass to import instead of the
    /// student's code.
    pub fn with_master_code(mut self, master_code_src: Source) -> Self {
        self.master_code_src = Some(master_code_src);
        self
    }

    /// The student's code.
    pub fn code_src(&self) -> &Source {
        &self.code_src
    }

    /// The student's tests.
    pub fn tests_src(&self) -> &Source {
        &self.tests_src
    }

    /// Instructor tests, if any.
    pub fn master_tests_src(&self) -> Option<&Source> {
        self.master_tests_src.as_ref()
    }

    /// Reference code, if any.
    pub fn master_code_src(&self) -> Option<&Source> {
        self.master_code_src.as_ref()
    }

    /// Where sources are materialized and artifacts land.
    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Where the report is saved.
    pub fn report_filepath(&self) -> &Path {
        &self.report_filepath
    }

    /// The scores so far.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Current metric weights.
    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// How far the last run got.
    pub fn stage(&self) -> RunStage {
        self.stage
    }

    /// Pass/fail numbers of the last primary pass.
    pub fn test_cases_summary(&self) -> Option<&TestCasesSummary> {
        self.test_cases_summary.as_ref()
    }

    /// Pass/fail numbers of the last master pass.
    pub fn master_test_cases_summary(&self) -> Option<&TestCasesSummary> {
        self.master_test_cases_summary.as_ref()
    }

    /// Where the runner artifacts are read from.
    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.report_dir)
    }

    /// Every owned source, optional ones included when present.
    fn sources(&self) -> impl Iterator<Item = &Source> {
        [
            Some(&self.code_src),
            Some(&self.tests_src),
            self.master_code_src.as_ref(),
            self.master_tests_src.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    /// Whether every owned source has its working copy.
    pub fn is_setup(&self) -> bool {
        self.sources().all(Source::is_setup)
    }

    /// Runs the whole pipeline and returns the report.
    ///
    /// Any failure before the save step propagates and leaves the report
    /// file untouched.
    pub async fn run(&mut self, options: RunOptions) -> Result<&Report> {
        self.weights.merge(options.weights);
        self.test_cases_summary = None;
        self.master_test_cases_summary = None;
        self.stage = RunStage::Uninitialized;

        self.setup(options.overwrite).await?;

        self.clear_pycache();
        self.run_primary().await?;
        self.stage = RunStage::PrimaryTestsRun;
        self.score_primary().await?;
        self.stage = RunStage::PrimaryScored;

        if self.master_tests_src.is_some() {
            self.run_master().await?;
            self.stage = RunStage::MasterTestsRun;
            self.score_master()?;
            self.stage = RunStage::MasterScored;
        }
        self.clear_pycache();

        if options.save_report {
            let path = self.report.save(Some(self.report_filepath.as_path()))?;
            tracing::info!("Report saved to {}", path.display());
            self.stage = RunStage::ReportSaved;
        }
        tracing::info!("{}", self.report);

        if options.clear_pytest_temporary_files {
            self.clear_pytest_temporary_files();
        }
        if options.clear_temporary_files {
            self.clear_temporary_files();
        }

        Ok(&self.report)
    }

    /// Materializes every owned source in the report directory. Sources
    /// already set up are left alone unless `overwrite` is set.
    pub async fn setup(&mut self, overwrite: bool) -> Result<()> {
        let report_dir = self.report_dir.clone();
        for source in [
            Some(&mut self.code_src),
            Some(&mut self.tests_src),
            self.master_code_src.as_mut(),
            self.master_tests_src.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            source
                .setup_at(&report_dir, overwrite)
                .await
                .with_context(|| format!("Could not set up {source}"))?;
        }
        self.stage = RunStage::SourcesMaterialized;
        Ok(())
    }

    /// Directories tests need on their import path to reach `code_path`.
    fn import_paths(code_path: &Path) -> Vec<PathBuf> {
        let mut paths = vec![code_path.to_path_buf()];
        paths.extend(code_path.parent().map(Path::to_path_buf));
        paths
    }

    /// Runs the student's tests with coverage over the student's code.
    async fn run_primary(&self) -> Result<()> {
        let code_path = self.code_src.materialized_path()?;
        let runner = PytestRunner::builder()
            .report_dir(&self.report_dir)
            .tests_path(self.tests_src.materialized_path()?)
            .coverage_target(&code_path)
            .import_paths(Self::import_paths(&code_path))
            .build();
        runner.run(&self.code_src).await?;
        Ok(())
    }

    /// Adds coverage, pass ratio and style to the report.
    async fn score_primary(&mut self) -> Result<()> {
        let coverage = self.get_code_coverage()?;
        let summary = self.get_test_cases_summary()?;
        let pep8 = self.get_pep8_score().await?;
        tracing::info!("Tests: {summary}");

        self.report
            .add(CODE_COVERAGE_KEY, coverage, self.weights.get(CODE_COVERAGE_KEY))?;
        self.report.add(
            PERCENT_PASSED_KEY,
            summary.percent_passed,
            self.weights.get(PERCENT_PASSED_KEY),
        )?;
        self.report.add(PEP8_KEY, pep8, self.weights.get(PEP8_KEY))?;
        self.test_cases_summary = Some(summary);
        Ok(())
    }

    /// Renames the master test files and runs them, without coverage,
    /// against the reference code when given, the student's code otherwise.
    async fn run_master(&self) -> Result<()> {
        let Some(master_tests_src) = &self.master_tests_src else {
            return Ok(());
        };
        let renamed = master_tests_src.rename_test_files(MASTER_TESTS_RENAME_PATTERN)?;
        tracing::debug!("Renamed {} master test files", renamed.len());

        let code_src = self.master_code_src.as_ref().unwrap_or(&self.code_src);
        let code_path = code_src.materialized_path()?;
        let runner = PytestRunner::builder()
            .report_dir(&self.report_dir)
            .tests_path(master_tests_src.materialized_path()?)
            .import_paths(Self::import_paths(&code_path))
            .build();
        runner.run(code_src).await?;
        Ok(())
    }

    /// Adds the master pass ratio to the report.
    fn score_master(&mut self) -> Result<()> {
        let summary = self.get_test_cases_summary()?;
        tracing::info!("Master tests: {summary}");
        self.report.add(
            MASTER_PERCENT_PASSED_KEY,
            summary.percent_passed,
            self.weights.get(MASTER_PERCENT_PASSED_KEY),
        )?;
        self.master_test_cases_summary = Some(summary);
        Ok(())
    }

    /// Mean coverage of the files under the student's code, read from the
    /// coverage report in the report directory.
    pub fn get_code_coverage(&self) -> Result<f64> {
        let artifact = CoverageArtifact::load(&self.artifact_paths().coverage_json)?;
        let code_path = self.code_src.materialized_path()?;
        Ok(artifact.mean_percent_under(&code_path, &self.report_dir, self.empty_coverage_percent))
    }

    /// Pass/fail numbers read from the test summary in the report directory.
    pub fn get_test_cases_summary(&self) -> Result<TestCasesSummary> {
        let artifact = SummaryArtifact::load(&self.artifact_paths().report_json)?;
        Ok(artifact.to_summary(self.zero_tests_ratio))
    }

    /// Style scores of the student's code and tests.
    pub async fn get_pep8_scores(&self) -> Result<[StyleScore; 2]> {
        let code = self
            .style
            .check(&self.code_src, &self.code_src.materialized_path()?)
            .await?;
        let tests = self
            .style
            .check(&self.code_src, &self.tests_src.materialized_path()?)
            .await?;
        tracing::info!("Code style: {code}");
        tracing::info!("Tests style: {tests}");
        Ok([code, tests])
    }

    /// Mean style score of the student's code and tests.
    pub async fn get_pep8_score(&self) -> Result<f64> {
        let [code, tests] = self.get_pep8_scores().await?;
        Ok((code.percent + tests.percent) / 2.0)
    }

    /// Removes caches and compiled files from the report directory.
    pub fn clear_pycache(&self) {
        runner::clear_pycache(&self.report_dir);
    }

    /// Removes caches and runner artifacts from the report directory.
    pub fn clear_pytest_temporary_files(&self) {
        self.clear_pycache();
        runner::clear_artifacts(&self.report_dir);
    }

    /// Removes runner artifacts and every materialized source.
    pub fn clear_temporary_files(&mut self) {
        self.clear_pytest_temporary_files();
        for source in self.sources() {
            source.clear_temporary_files();
        }
        self.stage = RunStage::TemporaryFilesCleared;
    }

    /// Deletes the whole report directory.
    pub fn rm_report_dir(&self) -> Result<()> {
        util::remove_dir_all(&self.report_dir)
    }

    /// Finds the repository the student's code comes from: the code's
    /// repository URL for remote sources, otherwise the `origin` remote of
    /// the checkout holding the local code directory (the working copy in the
    /// report directory is not a checkout).
    async fn detect_report_remote(&self) -> Result<String> {
        if let Some(url) = self.code_src.repo_url() {
            return Ok(url.to_string());
        }
        let dir = match self.code_src.origin() {
            Origin::Local(path) => path.clone(),
            Origin::Remote { .. } => {
                std::env::current_dir().context("Could not read the current directory")?
            }
        };
        GitRepo::discover(&dir).await?.remote_url().await
    }

    /// Commits the saved report to `remote` (an URL or `owner/name`) on the
    /// report branch and pushes it.
    ///
    /// Without `remote`, or with `auto`, the repository of the student's
    /// code is used; failing to find one is logged and not an error.
    pub async fn push_report_to(&self, remote: Option<&str>) -> Result<()> {
        let url = match remote.filter(|r| !r.eq_ignore_ascii_case("auto")) {
            Some(remote) => git::resolve_repo_url(remote),
            None => match self.detect_report_remote().await {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!("Could not find where to push the report: {e:#}");
                    return Ok(());
                }
            },
        };

        if !self.report_filepath.is_file() {
            bail!(
                "No report at {} to push, save it first.",
                self.report_filepath.display()
            );
        }
        let file_name = self
            .report_filepath
            .file_name()
            .context("Report file path has no file name")?;

        let scratch = self.report_dir.join(REPORT_PUBLISH_DIRNAME);
        util::remove_dir_all(&scratch)?;

        let published = async {
            let repo = GitRepo::clone_from(&url, &scratch, &self.report_branch).await?;
            fs::copy(&self.report_filepath, scratch.join(file_name)).with_context(|| {
                format!("Could not copy the report into {}", scratch.display())
            })?;
            repo.add(Path::new(file_name)).await?;
            if repo.commit(PUBLISH_COMMIT_MESSAGE).await? {
                repo.push(&self.report_branch).await?;
                tracing::info!("Report pushed to {url} ({})", self.report_branch);
            } else {
                tracing::info!("Report unchanged, nothing pushed to {url}");
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if !util::try_remove_dir_all(&scratch) {
            tracing::warn!("Could not remove {}", scratch.display());
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_cover_every_metric() {
        let weights = Weights::default();
        for key in METRIC_KEYS {
            assert_eq!(weights.get(key), 1.0);
        }
    }

    #[test]
    fn merge_only_touches_given_keys() {
        let mut weights = Weights::default();
        weights.merge([(PEP8_KEY, 0.5)]);
        assert_eq!(weights.get(PEP8_KEY), 0.5);
        assert_eq!(weights.get(CODE_COVERAGE_KEY), 1.0);
    }

    #[test]
    fn run_options_defaults() {
        let options = RunOptions::default();
        assert!(options.save_report);
        assert!(options.clear_pytest_temporary_files);
        assert!(!options.clear_temporary_files);
        assert!(!options.overwrite);
    }

    #[test]
    fn stages_are_ordered() {
        assert!(RunStage::PrimaryScored < RunStage::MasterTestsRun);
        assert!(RunStage::ReportSaved < RunStage::TemporaryFilesCleared);
        assert_eq!(RunStage::ReportSaved.to_string(), "REPORT_SAVED");
    }
}
