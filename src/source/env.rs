#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Isolated Python environments for code sources.
//!
//! An environment is a plain `venv` created next to the materialized code.
//! Commands are pointed at it by rewriting their leading executable
//! (`python`, `pip`, ...) to the copy living in the environment's scripts
//! folder.
//!
//! The grader's interpreter may itself live in a virtual environment (the
//! usual way to get pytest on systems that refuse global installs). Its
//! packages are not "system" site-packages from the point of view of a nested
//! venv, so environments are created from the base interpreter and the
//! grader's site-packages are appended through a `.pth` file.

use std::{
    ffi::{OsStr, OsString},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use itertools::Itertools;
use serde::Deserialize;

use crate::{config, constants::HOST_SITE_PTH_FILENAME, process::Invocation, util};

/// Executables that are redirected into the environment when it exists.
const ENV_SCOPED_PROGRAMS: [&str; 4] = ["python", "python3", "pip", "pip3"];

/// Prints the base interpreter and site-packages of the running Python.
const HOST_INSPECT_SCRIPT: &str = "import json, site, sys; print(json.dumps({'base_executable': \
                                   getattr(sys, '_base_executable', sys.executable), \
                                   'site_packages': site.getsitepackages()}))";

/// Prints the site-packages of the running Python.
const SITE_PACKAGES_SCRIPT: &str = "import json, site; print(json.dumps(site.getsitepackages()))";

/// Prints which of the modules named in argv cannot be imported.
const MISSING_MODULES_SCRIPT: &str = "import importlib.util, sys; print(' '.join(m for m in \
                                      sys.argv[1:] if importlib.util.find_spec(m) is None))";

/// The interpreter the grader runs with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostPython {
    /// Interpreter environments are created from; the base one when the host
    /// itself runs inside a venv.
    pub base_executable: PathBuf,
    /// Site-packages directories visible to the host.
    pub site_packages:   Vec<PathBuf>,
}

impl HostPython {
    /// Asks `python` for its base interpreter and site-packages.
    pub async fn inspect(python: &Path) -> Result<Self> {
        let collected = Invocation::new(python, ["-c", HOST_INSPECT_SCRIPT])
            .with_deadline(config::install_timeout())
            .run()
            .await
            .with_context(|| format!("Could not run {}", python.display()))?;
        if !collected.success() {
            bail!(
                "Could not inspect the interpreter {}:\n{}",
                python.display(),
                collected.combined()
            );
        }
        serde_json::from_str(collected.stdout_lossy().trim())
            .with_context(|| format!("Unexpected answer from {}", python.display()))
    }

    /// Inspects the Python found on the path.
    pub async fn detect() -> Result<Self> {
        Self::inspect(&util::python_path()?).await
    }
}

/// A virtual environment rooted at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonEnv {
    /// Root of the environment.
    path: PathBuf,
}

impl PythonEnv {
    /// Describes (without creating) the environment at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Root of the environment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the environment directory exists.
    pub fn is_ready(&self) -> bool {
        self.path.is_dir()
    }

    /// Whether `dir` lies inside the environment, comparing canonical paths
    /// when the lexical ones differ.
    fn contains(&self, dir: &Path) -> bool {
        if dir.starts_with(&self.path) {
            return true;
        }
        match (fs::canonicalize(dir), fs::canonicalize(&self.path)) {
            (Ok(dir), Ok(root)) => dir.starts_with(root),
            _ => false,
        }
    }

    /// Folder holding the environment's executables.
    pub fn scripts_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.path.join("Scripts")
        } else {
            self.path.join("bin")
        }
    }

    /// Path of an executable inside the scripts folder.
    fn scoped(&self, program: &str) -> PathBuf {
        if cfg!(windows) {
            self.scripts_dir().join(format!("{program}.exe"))
        } else {
            self.scripts_dir().join(program)
        }
    }

    /// The environment's interpreter.
    pub fn python(&self) -> PathBuf {
        self.scoped("python")
    }

    /// Maps a leading executable name to its environment-scoped path, when the
    /// environment exists and the name is one it provides. Other programs are
    /// returned unchanged.
    pub fn resolve_program(&self, program: &OsStr) -> OsString {
        if self.is_ready()
            && let Some(name) = program.to_str()
            && ENV_SCOPED_PROGRAMS.contains(&name)
        {
            return self.scoped(name).into_os_string();
        }
        program.to_os_string()
    }

    /// Rewrites the program of `invocation` with [`Self::resolve_program`].
    pub fn scope(&self, invocation: Invocation) -> Invocation {
        let program = self.resolve_program(invocation.program());
        invocation.with_program(program)
    }

    /// Deletes the environment if present and creates a fresh one from the
    /// Python found on the path.
    pub async fn recreate(&self, cwd: &Path) -> Result<String> {
        let host = HostPython::detect().await?;
        self.recreate_from(&host, cwd).await
    }

    /// Deletes the environment if present and creates a fresh one from
    /// `host`.
    ///
    /// The environment sees the base interpreter's site-packages and the
    /// host's own, behind its local ones, so the grading tools (pytest and its
    /// plugins, pycodestyle) installed next to the grader stay importable while
    /// the student's dependencies go into the environment.
    pub async fn recreate_from(&self, host: &HostPython, cwd: &Path) -> Result<String> {
        if self.is_ready() {
            tracing::info!("Recreating environment {} ...", self.path.display());
            util::remove_dir_all(&self.path)?;
        }

        tracing::info!(
            "Creating environment at {} from {} ...",
            self.path.display(),
            host.base_executable.display()
        );
        let args = [
            OsString::from("-m"),
            "venv".into(),
            "--system-site-packages".into(),
            self.path.clone().into_os_string(),
        ];
        let collected = Invocation::new(&host.base_executable, args)
            .in_dir(cwd)
            .with_deadline(config::install_timeout())
            .run()
            .await
            .context("Could not create the virtual environment")?;

        if !collected.success() || !self.is_ready() {
            bail!(
                "Creating the environment at {} failed:\n{}",
                self.path.display(),
                collected.combined()
            );
        }
        self.link_host_site_packages(host).await?;
        tracing::info!("Creating environment -> Done.");
        Ok(collected.combined())
    }

    /// Writes the host's site-packages into a `.pth` file of the
    /// environment.
    async fn link_host_site_packages(&self, host: &HostPython) -> Result<()> {
        let own = self.site_packages().await?;
        let lines = host
            .site_packages
            .iter()
            .filter(|dir| dir.is_dir() && !self.contains(dir))
            .map(|dir| dir.display().to_string())
            .join("\n");
        if lines.is_empty() {
            return Ok(());
        }

        let pth = own.join(HOST_SITE_PTH_FILENAME);
        tracing::debug!("Linking host site-packages through {}", pth.display());
        fs::write(&pth, format!("{lines}\n"))
            .with_context(|| format!("Could not write {}", pth.display()))
    }

    /// The environment's own site-packages directory.
    pub async fn site_packages(&self) -> Result<PathBuf> {
        let collected = Invocation::new(self.python(), ["-c", SITE_PACKAGES_SCRIPT])
            .with_deadline(config::install_timeout())
            .run()
            .await
            .context("Could not query the environment's site-packages")?;
        if !collected.success() {
            bail!(
                "Could not query the site-packages of {}:\n{}",
                self.path.display(),
                collected.combined()
            );
        }
        let dirs: Vec<PathBuf> = serde_json::from_str(collected.stdout_lossy().trim())
            .context("Unexpected site-packages listing")?;
        dirs.into_iter()
            .find(|dir| self.contains(dir))
            .with_context(|| format!("{} has no site-packages of its own", self.path.display()))
    }

    /// Names of `modules` the environment's interpreter cannot import.
    pub async fn missing_modules(&self, modules: &[&str]) -> Result<Vec<String>> {
        let mut args = vec!["-c", MISSING_MODULES_SCRIPT];
        args.extend_from_slice(modules);
        let collected = Invocation::new(self.python(), args)
            .with_deadline(config::install_timeout())
            .run()
            .await
            .context("Could not run the environment's interpreter")?;
        if !collected.success() {
            bail!(
                "Could not check the modules of {}:\n{}",
                self.path.display(),
                collected.combined()
            );
        }
        Ok(collected
            .stdout_lossy()
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    /// Installs the dependencies listed in `requirements` into the
    /// environment.
    pub async fn install_requirements(&self, requirements: &Path, cwd: &Path) -> Result<String> {
        tracing::info!("Installing dependencies from {} ...", requirements.display());
        let invocation = Invocation::new("python", [
            OsString::from("-m"),
            "pip".into(),
            "install".into(),
            "-r".into(),
            requirements.as_os_str().to_os_string(),
        ])
        .in_dir(cwd)
        .with_env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .with_deadline(config::install_timeout());

        let collected = self
            .scope(invocation)
            .run()
            .await
            .context("Could not install the dependencies")?;

        if !collected.success() {
            bail!(
                "Installing {} failed:\n{}",
                requirements.display(),
                collected.combined()
            );
        }
        Ok(collected.combined())
    }

    /// Deletes the environment, logging (not failing) when it cannot be
    /// removed.
    pub fn remove(&self) {
        util::try_remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_environment_leaves_program_alone() {
        let env = PythonEnv::new("/definitely/not/a/venv");
        assert_eq!(env.resolve_program(OsStr::new("python")), OsString::from("python"));
    }

    #[test]
    fn existing_environment_scopes_python_and_pip_only() {
        let root = std::env::temp_dir().join(format!("tpac-env-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create env root");
        let env = PythonEnv::new(&root);

        let python = env.resolve_program(OsStr::new("python"));
        assert!(Path::new(&python).starts_with(env.scripts_dir()));
        let pip = env.resolve_program(OsStr::new("pip"));
        assert!(Path::new(&pip).starts_with(env.scripts_dir()));
        assert_eq!(env.resolve_program(OsStr::new("git")), OsString::from("git"));

        let _ = std::fs::remove_dir_all(root);
    }
}
