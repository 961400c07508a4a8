#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! PEP8 compliance scoring.
//!
//! `pycodestyle` is run over a directory inside the code source's
//! environment; the score is the share of physical lines without a reported
//! error, clamped to `[0, 100]`.

use std::{fmt, fs, path::Path};

use anyhow::Result;
use itertools::Itertools;
use walkdir::WalkDir;

use crate::{
    config,
    constants::{PEP8_IGNORED_CODES, PEP8_KEY, PEP8_MAX_LINE_LENGTH, TEST_FILE_EXTENSION},
    error::StyleError,
    process::Invocation,
    source::Source,
};

/// Directories pycodestyle skips by default; their files are not counted
/// either.
const EXCLUDED_DIRNAMES: [&str; 9] = [
    ".svn",
    "CVS",
    ".bzr",
    ".hg",
    ".git",
    "__pycache__",
    ".tox",
    ".nox",
    ".eggs",
];

/// A percentage score with an optional diagnostic message.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleScore {
    /// What was scored.
    pub name:    String,
    /// Score in `[0, 100]`.
    pub percent: f64,
    /// De-duplicated diagnostics, empty when clean.
    pub message: String,
}

impl fmt::Display for StyleScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {:.2} %", self.name, self.percent)?;
        if !self.message.is_empty() {
            write!(f, ", ({})", self.message)?;
        }
        write!(f, "]")
    }
}

/// One `path:row:col: CODE text` line of pycodestyle output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Error code, eg. `E225`.
    pub code: String,
    /// Human-readable text.
    pub text: String,
}

impl Diagnostic {
    /// Parses a single line of pycodestyle output.
    pub fn parse(line: &str) -> Option<Self> {
        line.match_indices(": ").find_map(|(idx, sep)| {
            let rest = &line[idx + sep.len()..];
            let (code, text) = rest.split_once(' ')?;
            let mut chars = code.chars();
            let is_code = chars.next().is_some_and(|c| c.is_ascii_uppercase())
                && code.len() > 1
                && chars.all(|c| c.is_ascii_digit());
            is_code.then(|| Diagnostic {
                code: code.to_string(),
                text: text.trim().to_string(),
            })
        })
    }
}

/// Score for `errors` over `physical_lines`; no line at all scores 100.
pub fn percent_from_counts(errors: usize, physical_lines: usize) -> f64 {
    let err_ratio = if physical_lines == 0 {
        0.0
    } else {
        errors as f64 / physical_lines as f64
    };
    (100.0 - err_ratio * 100.0).clamp(0.0, 100.0)
}

/// Builds a score out of raw checker output and a physical line count.
pub fn score_output(name: &str, output: &str, physical_lines: usize) -> StyleScore {
    let diagnostics = output.lines().filter_map(Diagnostic::parse).collect::<Vec<_>>();

    let message = diagnostics
        .iter()
        .sorted_by(|a, b| a.code.cmp(&b.code))
        .unique_by(|d| d.code.clone())
        .map(|d| format!("{}:'{}'", d.code, d.text))
        .join(", ");

    StyleScore {
        name: name.to_string(),
        percent: percent_from_counts(diagnostics.len(), physical_lines),
        message,
    }
}

/// Lines of every Python file under `dir`, skipping the directories the
/// checker skips.
pub fn count_physical_lines(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !EXCLUDED_DIRNAMES.iter().any(|name| e.file_name() == *name)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext == TEST_FILE_EXTENSION)
        })
        .filter_map(|e| fs::read(e.path()).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).lines().count())
        .sum()
}

/// Runs pycodestyle with a fixed configuration.
#[derive(Debug, Clone)]
pub struct Pep8Checker {
    /// `--max-line-length`.
    max_line_length: usize,
    /// `--ignore`.
    ignore:          String,
}

impl Default for Pep8Checker {
    fn default() -> Self {
        Self {
            max_line_length: PEP8_MAX_LINE_LENGTH,
            ignore:          PEP8_IGNORED_CODES.to_string(),
        }
    }
}

impl Pep8Checker {
    /// The checker invocation for `dir`.
    pub fn invocation(&self, dir: &Path) -> Invocation {
        Invocation::new(
            "python",
            [
                "-m".into(),
                "pycodestyle".into(),
                format!("--max-line-length={}", self.max_line_length).into(),
                format!("--ignore={}", self.ignore).into(),
                dir.as_os_str().to_os_string(),
            ],
        )
        .with_deadline(config::style_timeout())
    }

    /// Scores `dir`, running the checker through `env_source` (the code
    /// source, whose environment has pycodestyle available).
    pub async fn check(&self, env_source: &Source, dir: &Path) -> Result<StyleScore> {
        let collected = env_source.run(self.invocation(dir)).await?;
        let stdout = collected.stdout_lossy();
        let score = score_output(PEP8_KEY, &stdout, count_physical_lines(dir));

        if !collected.success() && score.message.is_empty() {
            return Err(StyleError::CheckerFailed {
                dir:    dir.to_path_buf(),
                output: collected.combined().trim().to_string(),
            }
            .into());
        }

        tracing::debug!("{} -> {score}", dir.display());
        Ok(score)
    }
}
