//! # tpac
//!
//! An automated grader for Python assignments: the student's code and tests
//! are copied (or cloned) into a report directory, the tests run under
//! pytest with coverage, style is scored with pycodestyle, an optional
//! instructor test suite runs against the same code, and everything is
//! reduced to one weighted grade saved as JSON.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

/// Runner artifacts (coverage report, test summary) and their reductions
pub mod artifacts;
/// Process-wide runtime configuration
pub mod config;
/// Constant values used throughout
pub mod constants;
/// Typed errors
pub mod error;
/// Structured subprocess invocation
pub mod process;
/// The weighted report
pub mod report;
/// pytest invocation and artifact handling
pub mod runner;
/// Sources of code and tests, and their working copies
pub mod source;
/// PEP8 style scoring
pub mod style;
/// The grading pipeline
pub mod tester;
/// Filesystem helpers
pub mod util;

pub use report::{GradeScale, Report};
pub use source::{Source, SourceKind, SourceOptions};
pub use tester::{RunOptions, RunStage, Tester, TesterOptions, Weights};
