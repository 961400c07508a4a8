#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! One pytest invocation, from a clean report directory to relocated
//! artifacts.
//!
//! The runner is started from the report directory so that the coverage
//! database, the JSON coverage report and the JSON summary land there.
//! Caches and stale artifacts are purged before and after each invocation so
//! that a primary pass and a master pass never read each other's output.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use bon::Builder;

use crate::{
    artifacts::ArtifactPaths,
    config,
    constants::{CACHE_DIRNAMES, COMPILED_EXTENSION, DOT_REPORT_JSON, RUNNER_ARTIFACTS},
    process::{Collected, Invocation},
    source::Source,
    util,
};

/// How deep stray artifacts are searched for outside the report directory.
const STRAY_ARTIFACT_SEARCH_DEPTH: usize = 3;

/// pytest exit code for a session that collected no test.
const NO_TESTS_COLLECTED: i32 = 5;

/// Removes every cache directory and compiled file under `root`.
pub fn clear_pycache(root: &Path) {
    let dirs = util::remove_dirs_named(root, &CACHE_DIRNAMES);
    let files = util::remove_files_with_extension(root, COMPILED_EXTENSION);
    tracing::debug!(
        "Removed {dirs} cache directories and {files} compiled files under {}",
        root.display()
    );
}

/// Removes the runner artifacts from `report_dir`. Failures are logged.
pub fn clear_artifacts(report_dir: &Path) {
    for path in ArtifactPaths::in_dir(report_dir).all() {
        if let Err(e) = util::remove_file(path) {
            tracing::warn!("{e:#}");
        }
    }
}

/// A pytest invocation over one test directory.
#[derive(Debug, Clone, Builder)]
pub struct PytestRunner {
    /// Directory the runner starts in and where its artifacts end up.
    #[builder(into)]
    report_dir:      PathBuf,
    /// Test directory handed to pytest.
    #[builder(into)]
    tests_path:      PathBuf,
    /// Directory measured by coverage; no coverage at all when unset.
    #[builder(into)]
    coverage_target: Option<PathBuf>,
    /// Directories prepended to `PYTHONPATH` so tests can import the code.
    #[builder(default)]
    #[builder(with = FromIterator::from_iter)]
    import_paths:    Vec<PathBuf>,
}

impl PytestRunner {
    /// Directory the runner starts in.
    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Test directory handed to pytest.
    pub fn tests_path(&self) -> &Path {
        &self.tests_path
    }

    /// Directory measured by coverage, if any.
    pub fn coverage_target(&self) -> Option<&Path> {
        self.coverage_target.as_deref()
    }

    /// Arguments passed to `python -m pytest`.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-m".into(),
            "pytest".into(),
            self.tests_path.as_os_str().to_os_string(),
        ];
        if let Some(target) = &self.coverage_target {
            let mut cov = OsString::from("--cov=");
            cov.push(target);
            args.push(cov);
            args.push("--cov-report=json".into());
        }
        args.extend(
            [
                "-p".to_string(),
                "no:cacheprovider".to_string(),
                "--json-report".to_string(),
                format!("--json-report-file={DOT_REPORT_JSON}"),
                "--json-report-summary".to_string(),
                "--json-report-indent=4".to_string(),
            ]
            .map(OsString::from),
        );
        args
    }

    /// The invocation, before being scoped to an environment.
    pub fn invocation(&self) -> Result<Invocation> {
        let mut invocation = Invocation::new("python", self.args())
            .in_dir(&self.report_dir)
            .with_deadline(config::runner_timeout());

        if !self.import_paths.is_empty() {
            let mut paths = self.import_paths.clone();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            let joined = std::env::join_paths(paths).context("Could not build PYTHONPATH")?;
            invocation = invocation.with_env("PYTHONPATH", joined);
        }
        Ok(invocation)
    }

    /// Runs pytest in `env_source`'s environment and relocates its
    /// artifacts into the report directory.
    ///
    /// A failing test suite is not an error; whether the run produced usable
    /// artifacts is checked by whoever reads them.
    pub async fn run(&self, env_source: &Source) -> Result<Collected> {
        std::fs::create_dir_all(&self.report_dir)
            .with_context(|| format!("Could not create {}", self.report_dir.display()))?;
        self.clear_caches();
        clear_artifacts(&self.report_dir);

        let invocation = env_source.command(self.invocation()?)?;
        tracing::info!("Running {invocation} in {}", self.report_dir.display());
        let collected = invocation.run().await?;

        match collected.status.code() {
            Some(0 | 1) => {}
            Some(NO_TESTS_COLLECTED) => {
                tracing::warn!("pytest collected no test in {}", self.tests_path.display())
            }
            code => tracing::warn!(
                "pytest exited with {code:?}:\n{}",
                collected.combined().trim()
            ),
        }
        tracing::debug!("pytest output:\n{}", collected.stdout_lossy());

        self.relocate_artifacts();
        self.clear_caches();
        Ok(collected)
    }

    /// Purges caches in every directory this run touches.
    fn clear_caches(&self) {
        clear_pycache(&self.report_dir);
        clear_pycache(&self.tests_path);
        if let Some(target) = &self.coverage_target {
            clear_pycache(target);
        }
    }

    /// Moves artifacts written outside the report directory (eg. by a
    /// `conftest.py` that changes directory) into it. Move failures are
    /// logged only.
    fn relocate_artifacts(&self) {
        let mut roots = vec![self.tests_path.clone()];
        roots.extend(self.coverage_target.clone());

        for name in RUNNER_ARTIFACTS {
            let target = self.report_dir.join(name);
            if target.exists() {
                continue;
            }
            let Some(stray) = roots
                .iter()
                .find_map(|root| util::find_file(name, root, STRAY_ARTIFACT_SEARCH_DEPTH))
            else {
                continue;
            };
            match util::move_file(&stray, &target) {
                Ok(()) => tracing::debug!("Moved {} to {}", stray.display(), target.display()),
                Err(e) => tracing::warn!(
                    "Could not move {} to {}: {e:#}",
                    stray.display(),
                    self.report_dir.display()
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn primary_pass_measures_coverage() {
        let runner = PytestRunner::builder()
            .report_dir("/work/report_dir")
            .tests_path("/work/report_dir/tests")
            .coverage_target("/work/report_dir/src")
            .build();
        let args = strings(runner.args());
        assert_eq!(&args[..3], ["-m", "pytest", "/work/report_dir/tests"]);
        assert!(args.contains(&"--cov=/work/report_dir/src".to_string()));
        assert!(args.contains(&"--cov-report=json".to_string()));
        assert!(args.contains(&"--json-report-file=.report.json".to_string()));
        assert!(args.contains(&"no:cacheprovider".to_string()));
    }

    #[test]
    fn master_pass_has_no_coverage_flags() {
        let runner = PytestRunner::builder()
            .report_dir("/work/report_dir")
            .tests_path("/work/report_dir/master_tests")
            .import_paths([PathBuf::from("/work/report_dir/src")])
            .build();
        let args = strings(runner.args());
        assert!(!args.iter().any(|a| a.starts_with("--cov")));
        assert!(args.contains(&"--json-report-summary".to_string()));
    }

    #[test]
    fn invocation_runs_in_report_dir() {
        let runner = PytestRunner::builder()
            .report_dir("/work/report_dir")
            .tests_path("/work/report_dir/tests")
            .build();
        let invocation = runner.invocation().unwrap();
        assert_eq!(invocation.cwd(), Some(Path::new("/work/report_dir")));
        assert_eq!(invocation.program(), "python");
    }
}
