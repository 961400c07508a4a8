#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

/// Report key for the mean coverage of the student's code.
pub const CODE_COVERAGE_KEY: &str = "code_coverage";

/// Report key for the percentage of the student's tests that passed.
pub const PERCENT_PASSED_KEY: &str = "percent_passed";

/// Report key for the percentage of the master tests that passed.
pub const MASTER_PERCENT_PASSED_KEY: &str = "master_percent_passed";

/// Report key for the style score.
pub const PEP8_KEY: &str = "PEP8";

/// Every metric the tester knows how to produce, in pipeline order.
pub const METRIC_KEYS: [&str; 4] =
    [CODE_COVERAGE_KEY, PERCENT_PASSED_KEY, MASTER_PERCENT_PASSED_KEY, PEP8_KEY];

/// Pattern applied to master test file names so they never shadow the
/// student's test modules.
pub const MASTER_TESTS_RENAME_PATTERN: &str = "{}_master.py";

/// Prefix a file name needs for pytest to collect it.
pub const TEST_FILE_PREFIX: &str = "test_";

/// Extension of collectable test files.
pub const TEST_FILE_EXTENSION: &str = "py";

/// Name of the summary file written by `pytest-json-report`.
pub const DOT_REPORT_JSON: &str = ".report.json";

/// Raw coverage database written by `coverage.py`.
pub const DOT_COVERAGE: &str = ".coverage";

/// JSON coverage report written by `pytest-cov`.
pub const COVERAGE_JSON: &str = "coverage.json";

/// XML coverage report, removed if some plugin produced it.
pub const COVERAGE_XML: &str = "coverage.xml";

/// Every runner artifact that is relocated to, and later deleted from, the
/// report directory.
pub const RUNNER_ARTIFACTS: [&str; 4] = [DOT_COVERAGE, COVERAGE_JSON, COVERAGE_XML, DOT_REPORT_JSON];

/// Directories left behind by the interpreter and pytest between runs.
pub const CACHE_DIRNAMES: [&str; 2] = ["__pycache__", ".pytest_cache"];

/// Extension of compiled Python files.
pub const COMPILED_EXTENSION: &str = "pyc";

/// Dependency manifest looked up next to a code source.
pub const REQUIREMENTS_FILENAME: &str = "requirements.txt";

/// Default name of the report directory, created in the current directory.
pub const DEFAULT_REPORT_DIRNAME: &str = "report_dir";

/// Default name of the persisted report.
pub const DEFAULT_REPORT_FILENAME: &str = "report.json";

/// Default branch for cloned sources and published reports.
pub const DEFAULT_REPO_BRANCH: &str = "main";

/// Template used to expand `owner/name` shorthands into clone URLs.
pub const DEFAULT_REPO_URL: &str = "https://github.com/{}.git";

/// Modules the grading run imports inside a code source's environment.
pub const GRADING_MODULES: [&str; 4] = ["pytest", "pytest_cov", "pytest_jsonreport", "pycodestyle"];

/// `.pth` file exposing the grader's own site-packages inside an environment.
pub const HOST_SITE_PTH_FILENAME: &str = "_tpac_host_site.pth";

/// Committer used to publish reports when git has no identity configured.
pub const PUBLISH_AUTHOR_NAME: &str = "tpac";

/// Email of [`PUBLISH_AUTHOR_NAME`].
pub const PUBLISH_AUTHOR_EMAIL: &str = "tpac@localhost";

/// Default name of the directory holding remote clones.
pub const DEFAULT_LOCAL_TMP_DIRNAME: &str = "tmp_git";

/// Scratch clone used while publishing a report.
pub const REPORT_PUBLISH_DIRNAME: &str = "tmp_report_git";

/// Ratio of passed tests credited to a suite that collected no test at all.
pub const ZERO_TESTS_RATIO_PASSED: f64 = 0.0;

/// Coverage credited when no covered file lies under the code source.
pub const EMPTY_COVERAGE_PERCENT: f64 = 0.0;

/// Maximum line length enforced by the style checker.
pub const PEP8_MAX_LINE_LENGTH: usize = 120;

/// pycodestyle codes ignored by the style checker.
pub const PEP8_IGNORED_CODES: &str = "W191,E501";

/// Absolute tolerance used when comparing grades and weight sums.
pub const FLOAT_ABS_TOLERANCE: f64 = 1e-8;

/// Relative tolerance used when comparing grades and weight sums.
pub const FLOAT_REL_TOLERANCE: f64 = 1e-5;
