#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Typed failures that callers may want to tell apart.
//!
//! Everything else travels as a plain `anyhow::Error`; these enums are carried
//! inside it and can be recovered with `downcast_ref`.

use std::path::PathBuf;

/// Problems with where a source comes from or how it was materialized.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// A local origin that does not exist, with no repository to fall back on.
    #[error(
        "Source `{0}` doesn't exist locally and no repository url was provided. Make sure the \
         source exists locally or give a repository url."
    )]
    OriginNotFound(PathBuf),
    /// No default directory could be found for a source built without origin.
    #[error("Could not find a default `{dirname}` directory under {root}.")]
    DefaultDirNotFound {
        /// Directory name that was searched for.
        dirname: String,
        /// Root of the search.
        root:    PathBuf,
    },
    /// An operation needs the materialized copy, which does not exist yet.
    #[error("Source `{0}` is not set up yet, call `setup_at` first.")]
    NotMaterialized(String),
    /// A rename pattern without its `{{}}` placeholder.
    #[error("Pattern `{0}` must contain `{{}}`.")]
    InvalidRenamePattern(String),
    /// A rename that would clobber an existing file.
    #[error("Renaming {from} would overwrite {to}.")]
    RenameCollision {
        /// File being renamed.
        from: PathBuf,
        /// Existing file at the target name.
        to:   PathBuf,
    },
}

/// Problems with the weighted report.
#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    /// `save` or `load` was called without any file path configured.
    #[error("The report file path must be set before {0}.")]
    MissingFilepath(&'static str),
    /// A negative or non-finite weight.
    #[error("Weight of `{name}` must be a finite, non-negative number, got {weight}.")]
    InvalidWeight {
        /// Metric name.
        name:   String,
        /// Rejected weight.
        weight: f64,
    },
    /// Rescaling bounds that would divide by zero or invert the range.
    #[error("Invalid grade scale: grade_max ({max}) must be greater than grade_min ({min}).")]
    InvalidScale {
        /// Lower bound of the raw range.
        min: f64,
        /// Upper bound of the raw range.
        max: f64,
    },
    /// A loaded document whose stored grade disagrees with its data.
    #[error("Stored grade {stored} does not match the recomputed grade {recomputed}.")]
    GradeMismatch {
        /// Grade found in the document.
        stored:     f64,
        /// Grade computed from the loaded data.
        recomputed: f64,
    },
}

/// Which runner artifact an [`ArtifactError`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// JSON coverage report.
    Coverage,
    /// JSON test summary.
    Summary,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Coverage => write!(f, "coverage report"),
            ArtifactKind::Summary => write!(f, "test summary"),
        }
    }
}

/// Problems reading what the test runner produced.
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    /// The runner did not produce the artifact at all.
    #[error("The test runner produced no {kind} (looked for `{searched}`).")]
    Missing {
        /// Missing artifact.
        kind:     ArtifactKind,
        /// File name that was searched for.
        searched: String,
    },
    /// A test summary without its `total` count.
    #[error("The test summary at {0} has no `summary.total` count.")]
    MissingTotal(PathBuf),
    /// The artifact exists but is not in the expected shape.
    #[error("Could not parse the {kind} at {path}: {reason}")]
    Malformed {
        /// Offending artifact.
        kind:   ArtifactKind,
        /// Where it was read from.
        path:   PathBuf,
        /// Parser message.
        reason: String,
    },
}

/// Failures of version-control operations.
#[derive(thiserror::Error, Debug)]
pub enum GitError {
    /// git exited with a failure status.
    #[error("git {args} failed: {stderr}")]
    CommandFailed {
        /// Arguments passed to git.
        args:   String,
        /// What git printed on stderr.
        stderr: String,
    },
    /// The directory has no `origin` remote.
    #[error("No git remote found for {0}")]
    NoRemote(PathBuf),
}

/// Failures of the style checker.
#[derive(thiserror::Error, Debug)]
pub enum StyleError {
    /// The checker could not run (missing module, crash).
    #[error("The style checker failed on {dir}: {output}")]
    CheckerFailed {
        /// Directory being checked.
        dir:    PathBuf,
        /// Combined checker output.
        output: String,
    },
}
