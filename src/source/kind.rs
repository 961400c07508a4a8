//! What a source is used for, and the directory names that follow from it.

use std::fmt;

/// The role a [`super::Source`] plays in a grading run.
///
/// Roles only differ by their default directory names and by whether an
/// isolated Python environment is provisioned for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// The student's code.
    Code,
    /// The student's tests.
    Tests,
    /// Reference code run against the master tests.
    MasterCode,
    /// The instructor's tests.
    MasterTests,
}

impl SourceKind {
    /// Directory searched for when a source is built without an origin.
    pub fn default_dirname(self) -> &'static str {
        match self {
            SourceKind::Code | SourceKind::MasterCode => "src",
            SourceKind::Tests | SourceKind::MasterTests => "tests",
        }
    }

    /// Name of the materialized copy inside the working directory, when it
    /// must not default to the origin's basename.
    pub fn default_working_dirname(self) -> Option<&'static str> {
        match self {
            SourceKind::MasterCode => Some("master_src"),
            SourceKind::MasterTests => Some("master_tests"),
            SourceKind::Code | SourceKind::Tests => None,
        }
    }

    /// Name of the virtual environment provisioned for code sources.
    pub fn default_env_name(self) -> Option<&'static str> {
        match self {
            SourceKind::Code => Some("venv"),
            SourceKind::MasterCode => Some("master_venv"),
            SourceKind::Tests | SourceKind::MasterTests => None,
        }
    }

    /// Whether this source holds code under test.
    pub fn is_code(self) -> bool {
        matches!(self, SourceKind::Code | SourceKind::MasterCode)
    }

    /// Whether this source holds a test suite.
    pub fn is_tests(self) -> bool {
        !self.is_code()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Code => "code",
            SourceKind::Tests => "tests",
            SourceKind::MasterCode => "master_code",
            SourceKind::MasterTests => "master_tests",
        };
        write!(f, "{name}")
    }
}
