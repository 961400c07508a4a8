#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Where the files under grading come from, and their working copies.
//!
//! A [`Source`] is an origin (a local directory, or a sub-path of a remote
//! repository) plus the copy of it materialized inside a working directory.
//! Code sources additionally get an isolated Python environment with their
//! declared dependencies installed.

/// Isolated Python environments.
pub mod env;
/// git plumbing used to fetch remote sources and publish reports.
pub mod git;
/// Source roles and their default names.
pub mod kind;

use std::{
    ffi::OsString,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use bon::Builder;
pub use env::{HostPython, PythonEnv};
pub use git::GitRepo;
pub use kind::SourceKind;

use crate::{
    constants::{
        DEFAULT_LOCAL_TMP_DIRNAME, DEFAULT_REPO_BRANCH, GRADING_MODULES, REQUIREMENTS_FILENAME,
        TEST_FILE_EXTENSION, TEST_FILE_PREFIX,
    },
    error::SourceError,
    process::{Collected, Invocation},
    util,
};

/// How deep default directories are searched for under the current directory.
const DEFAULT_DIR_SEARCH_DEPTH: usize = 4;

/// How deep the dependency manifest is searched for next to a code source.
const REQUIREMENTS_SEARCH_DEPTH: usize = 3;

/// Where a source's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A directory on this machine.
    Local(PathBuf),
    /// A sub-path of a git repository.
    Remote {
        /// Clone URL.
        url:      String,
        /// Branch checked out after cloning.
        branch:   String,
        /// Directory inside the repository that makes up the source.
        sub_path: PathBuf,
    },
}

impl Origin {
    /// The origin's directory path, local or inside the repository.
    pub fn path(&self) -> &Path {
        match self {
            Origin::Local(path) => path,
            Origin::Remote { sub_path, .. } => sub_path,
        }
    }
}

/// Optional knobs of a [`Source`].
#[derive(Debug, Clone, Default, Builder)]
#[builder(on(String, into))]
pub struct SourceOptions {
    /// Repository to clone the source from. `owner/name` is expanded to a
    /// GitHub URL.
    pub repo_url:          Option<String>,
    /// Branch checked out after cloning, `main` by default.
    pub repo_branch:       Option<String>,
    /// Name of the working copy, instead of the origin's basename.
    pub working_dirname:   Option<String>,
    /// Name of the directory holding remote clones, `tmp_git` by default.
    pub local_tmp_dirname: Option<String>,
    /// Dependency manifest, instead of searching for `requirements.txt`.
    #[builder(into)]
    pub requirements_path: Option<PathBuf>,
    /// Name of the virtual environment, instead of the role's default.
    pub env_name:          Option<String>,
}

/// What provisioning did during the last `setup_at`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Provisioning {
    /// Not a code source, or not set up yet.
    #[default]
    NotApplicable,
    /// The existing environment was kept.
    Reused,
    /// A fresh environment was created; holds the manifest installed from, if
    /// one was found.
    Created(Option<PathBuf>),
}

/// An origin of files and its materialized working copy.
#[derive(Debug, Clone)]
pub struct Source {
    /// Role of the source.
    kind:              SourceKind,
    /// Where the files come from.
    origin:            Origin,
    /// Directory the copy is materialized in; unset until `setup_at`.
    working_dir:       Option<PathBuf>,
    /// Explicit name of the working copy.
    working_dirname:   Option<String>,
    /// Name of the directory holding remote clones.
    local_tmp_dirname: String,
    /// Explicit dependency manifest.
    requirements_path: Option<PathBuf>,
    /// Name of the virtual environment, for code sources.
    env_name:          Option<String>,
    /// Outcome of the last provisioning.
    provisioning:      Provisioning,
}

impl Source {
    /// Creates a source of role `kind`.
    ///
    /// * `path`: local directory, or the sub-path inside the repository when
    ///   `options.repo_url` is set. When `None`, a local directory named after
    ///   the role (`src` or `tests`) is searched for under the current
    ///   directory; for a remote source the role's name is used as sub-path.
    ///
    /// Fails when the local origin does not exist and no repository was given,
    /// or when the repository URL is blank.
    pub fn new(kind: SourceKind, path: Option<PathBuf>, options: SourceOptions) -> Result<Self> {
        let origin = match options.repo_url.as_deref().map(str::trim) {
            Some("") => {
                let path = path.unwrap_or_else(|| PathBuf::from(kind.default_dirname()));
                return Err(SourceError::OriginNotFound(path).into());
            }
            Some(url) => Origin::Remote {
                url:      git::resolve_repo_url(url),
                branch:   options
                    .repo_branch
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REPO_BRANCH.to_string()),
                sub_path: path.unwrap_or_else(|| PathBuf::from(kind.default_dirname())),
            },
            None => {
                let path = match path {
                    Some(path) => path,
                    None => Self::find_default_dir(kind)?,
                };
                if !path.exists() {
                    return Err(SourceError::OriginNotFound(path).into());
                }
                Origin::Local(util::absolutize(&path)?)
            }
        };

        Ok(Self {
            kind,
            origin,
            working_dir: None,
            working_dirname: options
                .working_dirname
                .or_else(|| kind.default_working_dirname().map(str::to_string)),
            local_tmp_dirname: options
                .local_tmp_dirname
                .unwrap_or_else(|| DEFAULT_LOCAL_TMP_DIRNAME.to_string()),
            requirements_path: options.requirements_path,
            env_name: options
                .env_name
                .or_else(|| kind.default_env_name().map(str::to_string))
                .filter(|_| kind.is_code()),
            provisioning: Provisioning::NotApplicable,
        })
    }

    /// A local source with default options.
    pub fn local(kind: SourceKind, path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(kind, Some(path.into()), SourceOptions::default())
    }

    /// A source found by searching the current directory for the role's
    /// default directory name.
    pub fn discover(kind: SourceKind) -> Result<Self> {
        Self::new(kind, None, SourceOptions::default())
    }

    /// Searches the current directory tree for `kind`'s default directory.
    fn find_default_dir(kind: SourceKind) -> Result<PathBuf> {
        let root = std::env::current_dir().context("Could not read the current directory")?;
        util::find_dir(kind.default_dirname(), &root, DEFAULT_DIR_SEARCH_DEPTH).ok_or_else(|| {
            SourceError::DefaultDirNotFound {
                dirname: kind.default_dirname().to_string(),
                root,
            }
            .into()
        })
    }

    /// Role of the source.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Where the files come from.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Directory the copy is materialized in, once chosen.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Whether the files come from a repository.
    pub fn is_remote(&self) -> bool {
        matches!(self.origin, Origin::Remote { .. })
    }

    /// Whether the files come from an existing local directory.
    pub fn is_local(&self) -> bool {
        matches!(&self.origin, Origin::Local(path) if path.exists())
    }

    /// Clone URL, for remote sources.
    pub fn repo_url(&self) -> Option<&str> {
        match &self.origin {
            Origin::Remote { url, .. } => Some(url),
            Origin::Local(_) => None,
        }
    }

    /// Repository name, for remote sources.
    pub fn repo_name(&self) -> Option<String> {
        self.repo_url().map(git::repo_name)
    }

    /// Name of the working copy inside the working directory.
    fn basename(&self) -> OsString {
        if let Some(name) = &self.working_dirname {
            return OsString::from(name);
        }
        util::normalize_lexically(self.origin.path())
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| OsString::from(self.kind.default_dirname()))
    }

    /// Path of the materialized copy; `None` until a working directory is
    /// assigned.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.working_dir
            .as_ref()
            .map(|dir| dir.join(self.basename()))
    }

    /// Path of the materialized copy, failing when there is none yet.
    pub fn materialized_path(&self) -> Result<PathBuf> {
        self.local_path()
            .filter(|path| path.exists())
            .ok_or_else(|| SourceError::NotMaterialized(self.to_string()).into())
    }

    /// Whether the materialized copy exists on disk.
    pub fn is_setup(&self) -> bool {
        self.local_path().is_some_and(|path| path.exists())
    }

    /// Directory holding this source's clone of its repository.
    pub fn local_repo_tmp_dirpath(&self) -> Option<PathBuf> {
        let dir = self.working_dir.as_ref()?;
        let name = self.repo_name()?;
        Some(dir.join(&self.local_tmp_dirname).join(name))
    }

    /// The source's virtual environment, for code sources with a working
    /// directory.
    pub fn environment(&self) -> Option<PythonEnv> {
        let dir = self.working_dir.as_ref()?;
        let name = self.env_name.as_ref()?;
        Some(PythonEnv::new(dir.join(name)))
    }

    /// Whether the source's environment exists.
    pub fn is_environment_ready(&self) -> bool {
        self.environment().is_some_and(|env| env.is_ready())
    }

    /// Outcome of the last provisioning.
    pub fn provisioning(&self) -> &Provisioning {
        &self.provisioning
    }

    /// The dependency manifest: the explicit one, or the first
    /// `requirements.txt` found around the origin.
    pub fn requirements_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.requirements_path {
            return Some(path.clone());
        }

        let origin_dir = match &self.origin {
            Origin::Local(path) => path.clone(),
            Origin::Remote { sub_path, .. } => self.local_repo_tmp_dirpath()?.join(sub_path),
        };
        let root = util::normalize_lexically(&origin_dir.join(".."));
        util::find_file(REQUIREMENTS_FILENAME, &root, REQUIREMENTS_SEARCH_DEPTH)
    }

    /// Materializes the source inside `dst_dir`.
    ///
    /// Does nothing when the copy already exists and `overwrite` is false.
    /// With `overwrite`, the previous copy and clone are purged first. Code
    /// sources also get their environment (re)created and dependencies
    /// installed. Returns the materialized path.
    pub async fn setup_at(&mut self, dst_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        fs::create_dir_all(dst_dir)
            .with_context(|| format!("Could not create {}", dst_dir.display()))?;
        self.working_dir = Some(util::absolutize(dst_dir)?);

        if overwrite {
            self.purge_materialized()?;
        }

        if self.is_setup() {
            tracing::info!("{self} is already set up, skipping the copy.");
        } else {
            self.materialize().await?;
        }

        if self.kind.is_code() {
            self.provision(overwrite).await?;
        }

        tracing::debug!("{self}");
        self.materialized_path()
    }

    /// Deletes the working copy and the clone, treating "already gone" as
    /// success.
    fn purge_materialized(&self) -> Result<()> {
        if let Some(path) = self.local_path() {
            util::remove_dir_all(&path)?;
        }
        if let Some(path) = self.local_repo_tmp_dirpath() {
            util::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Copies (or clones then copies) the origin into the working copy.
    async fn materialize(&self) -> Result<()> {
        let local_path = self
            .local_path()
            .context("working directory must be set before materializing")?;

        match &self.origin {
            Origin::Local(path) => {
                if local_path.starts_with(path) {
                    bail!(
                        "Cannot materialize {} inside its own origin {}",
                        local_path.display(),
                        path.display()
                    );
                }
                util::copy_dir_all(path, &local_path)
            }
            Origin::Remote {
                url,
                branch,
                sub_path,
            } => {
                let repo = self.clone_repo(url, branch).await?;
                let src_repo_path = repo.dir().join(sub_path);
                util::copy_dir_all(&src_repo_path, &local_path).with_context(|| {
                    format!("Could not copy {} out of {url}", sub_path.display())
                })
            }
        }
    }

    /// Clones the repository into the cache (unless already there), checks
    /// out the branch and pulls.
    async fn clone_repo(&self, url: &str, branch: &str) -> Result<GitRepo> {
        let cache = self
            .local_repo_tmp_dirpath()
            .context("working directory must be set before cloning")?;
        let name = git::repo_name(url);

        let repo = if cache.exists() {
            tracing::info!(
                "No need to clone repo {name} from {url} to {}. Repo already exists.",
                cache.display()
            );
            GitRepo::open(&cache)
        } else {
            tracing::info!("Cloning repo {name} from {url} to {} ...", cache.display());
            let repo = GitRepo::clone_from(url, &cache, branch).await?;
            tracing::info!("Cloning repo {name} -> Done.");
            repo
        };

        repo.checkout(branch).await?;
        repo.pull().await?;
        Ok(repo)
    }

    /// Creates the environment when missing (or when `overwrite` asks for a
    /// fresh one) and installs the manifest's dependencies into it.
    async fn provision(&mut self, overwrite: bool) -> Result<()> {
        let (Some(env), Some(working_dir)) = (self.environment(), self.working_dir.clone()) else {
            self.provisioning = Provisioning::NotApplicable;
            return Ok(());
        };

        if env.is_ready() && !overwrite {
            tracing::info!("Reusing environment {}.", env.path().display());
            self.provisioning = Provisioning::Reused;
            return Ok(());
        }

        let venv_stdout = env.recreate(&working_dir).await?;
        tracing::debug!("venv stdout: {venv_stdout}");

        let requirements = self.requirements_path();
        match &requirements {
            Some(path) => {
                let reqs_stdout = env.install_requirements(path, &working_dir).await?;
                tracing::debug!("requirements stdout: {reqs_stdout}");
            }
            None => {
                tracing::info!(
                    "No {REQUIREMENTS_FILENAME} found for {self}, skipping dependency installation."
                );
            }
        }
        match env.missing_modules(&GRADING_MODULES).await {
            Ok(missing) if !missing.is_empty() => tracing::warn!(
                "The environment {} cannot import {}; grading runs will fail.",
                env.path().display(),
                missing.join(", ")
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not check the grading tools: {e:#}"),
        }
        self.provisioning = Provisioning::Created(requirements);
        Ok(())
    }

    /// Points `invocation` at this source: its leading executable is scoped
    /// to the environment when one exists (a bare `python` otherwise resolves
    /// to the system interpreter) and it runs in the working directory unless
    /// told otherwise.
    pub fn command(&self, invocation: Invocation) -> Result<Invocation> {
        let invocation = match self.environment().filter(PythonEnv::is_ready) {
            Some(env) => env.scope(invocation),
            None if invocation.program() == "python" => {
                invocation.with_program(util::python_path()?)
            }
            None => invocation,
        };

        Ok(match (&self.working_dir, invocation.cwd()) {
            (Some(dir), None) => invocation.in_dir(dir),
            _ => invocation,
        })
    }

    /// Runs `invocation` through [`Self::command`].
    pub async fn run(&self, invocation: Invocation) -> Result<Collected> {
        self.command(invocation)?.run().await
    }

    /// Renames every collectable test file (`test_*.py`) of the working copy
    /// by substituting its name into `pattern`, eg. `{}_master.py` turns
    /// `test_a.py` into `test_a_master.py`.
    ///
    /// Files already carrying the pattern are left alone, and a rename never
    /// overwrites an existing file. Returns the new paths.
    pub fn rename_test_files(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let root = self.materialized_path()?;
        let extension = format!(".{TEST_FILE_EXTENSION}");
        let Some((prefix, suffix)) = pattern.replace(&extension, "").split_once("{}").map(
            |(prefix, suffix)| (prefix.to_string(), suffix.to_string()),
        ) else {
            return Err(SourceError::InvalidRenamePattern(pattern.to_string()).into());
        };

        let mut renamed = Vec::new();
        let files = util::glob_files(&format!("{TEST_FILE_PREFIX}*{extension}"), &root)?;
        for file in files {
            let Some(stem) = file
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(&extension))
            else {
                continue;
            };
            if (!prefix.is_empty() || !suffix.is_empty())
                && stem.starts_with(&prefix)
                && stem.ends_with(&suffix)
                && stem.len() > prefix.len() + suffix.len()
                && stem[prefix.len()..].starts_with(TEST_FILE_PREFIX)
            {
                continue;
            }

            let new_name = format!("{prefix}{stem}{suffix}{extension}");
            let target = file.with_file_name(&new_name);
            if target.exists() {
                return Err(SourceError::RenameCollision {
                    from: file,
                    to:   target,
                }
                .into());
            }
            fs::rename(&file, &target).with_context(|| {
                format!("Could not rename {} to {}", file.display(), target.display())
            })?;
            renamed.push(target);
        }

        Ok(renamed)
    }

    /// Removes the working copy, the repository clone and the environment.
    /// Failures are logged and the paths left behind.
    pub fn clear_temporary_files(&self) {
        if let Some(path) = self.local_path() {
            util::try_remove_dir_all(&path);
        }
        if let Some(path) = self.local_repo_tmp_dirpath() {
            if !util::try_remove_dir_all(&path) {
                tracing::warn!(
                    "Could not remove repo {} at {}.",
                    self.repo_name().unwrap_or_default(),
                    path.display()
                );
            }
        }
        if let Some(env) = self.environment() {
            env.remove();
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({}, src={}", self.kind, self.origin.path().display())?;
        if let Some(dir) = &self.working_dir {
            write!(f, ", working_dir={}", dir.display())?;
        }
        match &self.origin {
            Origin::Local(_) => write!(f, ", is_local=true")?,
            Origin::Remote { url, branch, .. } => {
                write!(f, ", is_remote=true, url={url}, branch={branch}")?
            }
        }
        if let Some(env) = self.environment() {
            write!(f, ", venv={}", env.path().display())?;
        }
        write!(f, ")")
    }
}
