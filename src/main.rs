#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! # tpac
//!
//! Grades a Python assignment from the command line.
//!
//! ```text
//! tpac --code-src-path=Example/SimpleTP/src --tests-src-path=Example/SimpleTP/tests --debug --overwrite
//! ```

use std::path::PathBuf;

use anyhow::Result;
use bpaf::*;
use colored::Colorize;
use dotenvy::dotenv;
use tpac::{
    GradeScale, RunOptions, Source, SourceKind, SourceOptions, Tester, TesterOptions, Weights,
    constants::{CODE_COVERAGE_KEY, MASTER_PERCENT_PASSED_KEY, PEP8_KEY, PERCENT_PASSED_KEY},
};
use tracing::{Level, metadata::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, util::SubscriberInitExt};

/// Where one source comes from.
#[derive(Debug, Clone)]
struct SourceArgs {
    /// Local directory, or sub-path inside the repository.
    path: Option<PathBuf>,
    /// Repository URL or `owner/name`.
    url:  Option<String>,
}

impl SourceArgs {
    /// Whether neither a path nor a URL was given.
    fn is_empty(&self) -> bool {
        self.path.is_none() && self.url.is_none()
    }

    /// Builds the source, or `None` when nothing was given.
    fn build(self, kind: SourceKind, branch: Option<&String>) -> Result<Option<Source>> {
        if self.is_empty() {
            return Ok(None);
        }
        let options = SourceOptions {
            repo_url: self.url,
            repo_branch: branch.cloned(),
            ..SourceOptions::default()
        };
        Source::new(kind, self.path, options).map(Some)
    }
}

/// Command line options.
#[derive(Debug, Clone)]
struct Opts {
    /// The student's code.
    code:                         SourceArgs,
    /// The student's tests.
    tests:                        SourceArgs,
    /// Reference code for the master tests.
    master_code:                  SourceArgs,
    /// Instructor tests.
    master_tests:                 SourceArgs,
    /// Branch checked out in cloned repositories.
    repo_branch:                  Option<String>,
    /// Where to grade.
    report_dir:                   Option<PathBuf>,
    /// Re-materialize everything.
    overwrite:                    bool,
    /// Debug logging.
    debug:                        bool,
    /// Repository to push the report to, or `auto`.
    push_report_to:               Option<String>,
    /// Remove runner artifacts afterwards.
    clear_pytest_temporary_files: bool,
    /// Remove materialized sources afterwards.
    clear_temporary_files:        bool,
    /// Weight of `code_coverage`.
    code_coverage_weight:         f64,
    /// Weight of `percent_passed`.
    percent_passed_weight:        f64,
    /// Weight of `master_percent_passed`.
    master_percent_passed_weight: f64,
    /// Weight of `PEP8`.
    pep8_weight:                  f64,
    /// Remove the report directory at the end.
    rm_report_dir:                bool,
    /// Raw score mapped to `grade_min_value`.
    grade_min:                    f64,
    /// Lowest grade given.
    grade_min_value:              f64,
    /// Highest grade given.
    grade_max:                    f64,
}

/// Parse the command line arguments and return the options.
fn options() -> Opts {
    /// parses a source given by path or URL
    fn source(
        path_flag: &'static str,
        path_help: &'static str,
        url_flag: &'static str,
        url_help: &'static str,
    ) -> impl Parser<SourceArgs> {
        let path = long(path_flag)
            .help(path_help)
            .argument::<PathBuf>("PATH")
            .optional();
        let url = long(url_flag).help(url_help).argument::<String>("URL").optional();
        construct!(SourceArgs { path, url })
    }

    /// parses a metric weight
    fn weight(flag: &'static str, help: &'static str) -> impl Parser<f64> {
        long(flag).help(help).argument::<f64>("WEIGHT").fallback(1.0)
    }

    let code = source(
        "code-src-path",
        "Path to the directory containing the code to be tested",
        "code-src-url",
        "URL of the git repository containing the code to be tested",
    );
    let tests = source(
        "tests-src-path",
        "Path to the directory containing the tests of the code",
        "tests-src-url",
        "URL of the git repository containing the tests of the code",
    );
    let master_code = source(
        "master-code-src-path",
        "Path to the directory containing the reference code",
        "master-code-src-url",
        "URL of the git repository containing the reference code",
    );
    let master_tests = source(
        "master-tests-src-path",
        "Path to the directory containing the master tests",
        "master-tests-src-url",
        "URL of the git repository containing the master tests",
    );
    let repo_branch = long("repo-branch")
        .help("Branch checked out in cloned repositories")
        .argument::<String>("BRANCH")
        .optional();
    let report_dir = long("report-dir")
        .help("Directory where sources are copied and the report is saved")
        .argument::<PathBuf>("DIR")
        .optional();
    let overwrite = long("overwrite").help("Overwrite existing files").switch();
    let debug = long("debug").help("Print debug messages").switch();
    let push_report_to = long("push-report-to")
        .help("Push the report to a git repository; `auto` uses the repository of the code")
        .argument::<String>("URL")
        .optional();
    let clear_pytest_temporary_files = long("clear-pytest-temporary-files")
        .help("Clear pytest temporary files")
        .switch();
    let clear_temporary_files = long("clear-temporary-files")
        .help("Clear every copied source and environment")
        .switch();
    let code_coverage_weight = weight(
        "code_coverage-weight",
        "Weight of the code coverage in the final grade",
    );
    let percent_passed_weight = weight(
        "percent_passed-weight",
        "Weight of the passed tests ratio in the final grade",
    );
    let master_percent_passed_weight = weight(
        "master_percent_passed-weight",
        "Weight of the passed master tests ratio in the final grade",
    );
    let pep8_weight = weight("PEP8-weight", "Weight of the PEP8 score in the final grade");
    let rm_report_dir = long("rm-report-dir")
        .help("Remove the report directory once done")
        .switch();
    let grade_min = long("grade-min")
        .help("Raw score mapped to the minimum grade value")
        .argument::<f64>("GRADE")
        .fallback(0.0);
    let grade_min_value = long("grade-min-value")
        .help("Minimum grade value")
        .argument::<f64>("GRADE")
        .fallback(0.0);
    let grade_max = long("grade-max")
        .help("Maximum grade")
        .argument::<f64>("GRADE")
        .fallback(100.0);

    construct!(Opts {
        code,
        tests,
        master_code,
        master_tests,
        repo_branch,
        report_dir,
        overwrite,
        debug,
        push_report_to,
        clear_pytest_temporary_files,
        clear_temporary_files,
        code_coverage_weight,
        percent_passed_weight,
        master_percent_passed_weight,
        pep8_weight,
        rm_report_dir,
        grade_min,
        grade_min_value,
        grade_max,
    })
    .to_options()
    .descr("Automated grader for Python assignments")
    .run()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let opts = options();

    let fmt = fmt::layer()
        .without_time()
        .with_file(false)
        .with_line_number(false);
    let level = if opts.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt)
        .with(LevelFilter::from_level(level))
        .init();

    let branch = opts.repo_branch.as_ref();
    let code_src = match opts.code.build(SourceKind::Code, branch)? {
        Some(source) => source,
        None => Source::discover(SourceKind::Code)?,
    };
    let tests_src = match opts.tests.build(SourceKind::Tests, branch)? {
        Some(source) => source,
        None => Source::discover(SourceKind::Tests)?,
    };

    let weights: Weights = [
        (CODE_COVERAGE_KEY, opts.code_coverage_weight),
        (PERCENT_PASSED_KEY, opts.percent_passed_weight),
        (MASTER_PERCENT_PASSED_KEY, opts.master_percent_passed_weight),
        (PEP8_KEY, opts.pep8_weight),
    ]
    .into_iter()
    .collect();

    let tester_options = TesterOptions::builder()
        .maybe_report_dir(opts.report_dir)
        .weights(weights)
        .scale(GradeScale::new(opts.grade_min, opts.grade_min_value, opts.grade_max)?)
        .maybe_report_branch(opts.repo_branch.clone())
        .build();
    let mut tester = Tester::new(code_src, tests_src, tester_options)?;
    if let Some(source) = opts.master_code.build(SourceKind::MasterCode, branch)? {
        tester = tester.with_master_code(source);
    }
    if let Some(source) = opts.master_tests.build(SourceKind::MasterTests, branch)? {
        tester = tester.with_master_tests(source);
    }

    let run_options = RunOptions::builder()
        .overwrite(opts.overwrite)
        .clear_pytest_temporary_files(opts.clear_pytest_temporary_files)
        .clear_temporary_files(opts.clear_temporary_files)
        .build();
    let report = tester.run(run_options).await?;
    eprintln!("{}", report.table());
    println!(
        "{} {}",
        "Grade:".bold(),
        format!("{:.2}", report.grade()).green().bold()
    );

    if let Some(remote) = opts.push_report_to.as_deref() {
        if let Err(e) = tester.push_report_to(Some(remote)).await {
            tracing::error!("Error while pushing the report to {remote}: {e:#}");
        }
    }
    if opts.rm_report_dir {
        tester.rm_report_dir()?;
    }

    Ok(())
}
