#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Filesystem search, copy and cleanup primitives.

use std::{
    fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use glob::glob;
use walkdir::WalkDir;
use which::which;

/// Finds and returns the path to a system Python interpreter
pub fn python_path() -> Result<PathBuf> {
    which("python3")
        .or_else(|_| which("python"))
        .context("Cannot find a Python interpreter on path (python3 or python)")
}

/// Finds and returns the path to git
pub fn git_path() -> Result<PathBuf> {
    which("git").context("Cannot find git on path")
}

/// Returns the shallowest file named `filename` under `root`, at most
/// `max_depth` levels down. Ties are broken by file-name order.
pub fn find_file(filename: &str, root: &Path, max_depth: usize) -> Option<PathBuf> {
    WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == filename)
        .min_by_key(walkdir::DirEntry::depth)
        .map(walkdir::DirEntry::into_path)
}

/// Returns the shallowest directory named `dirname` strictly under `root`, at
/// most `max_depth` levels down.
pub fn find_dir(dirname: &str, root: &Path, max_depth: usize) -> Option<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir() && e.file_name() == dirname)
        .min_by_key(walkdir::DirEntry::depth)
        .map(walkdir::DirEntry::into_path)
}

/// A glob utility function returning every file under `root` whose name
/// matches `file_pattern`, at any depth.
///
/// * `file_pattern`: a glob for the file name only, eg. `test_*.py`
/// * `root`: the root directory where search starts
pub fn glob_files(file_pattern: &str, root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = root.join("**").join(file_pattern);
    let pattern = pattern
        .to_str()
        .context("Could not convert root to string")?
        .to_string();

    Ok(glob(&pattern)
        .context("Could not create glob")?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect())
}

/// Recursively copies `src` into `dst`, creating `dst` if needed and
/// overwriting files that already exist there.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("Cannot copy {}: not a directory", src.display());
    }
    fs::create_dir_all(dst).with_context(|| format!("Could not create {}", dst.display()))?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("Could not walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .context("walked outside of the copied tree")?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Could not create {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Could not copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }

    Ok(())
}

/// Clears the read-only bit of `path` and, for directories, of everything in
/// it.
fn make_writable(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if let Ok(metadata) = entry.metadata() {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), permissions);
            }
        }
    }
}

/// Removes a directory tree.
///
/// A missing directory counts as removed. On a permission error the read-only
/// bits are cleared and the removal is retried once.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            make_writable(path);
            match fs::remove_dir_all(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("Could not delete {}", path.display())),
            }
        }
        Err(e) => Err(e).with_context(|| format!("Could not delete {}", path.display())),
    }
}

/// Like [`remove_dir_all`], but a failure is only logged and the path left
/// behind. Returns whether the path is gone.
pub fn try_remove_dir_all(path: &Path) -> bool {
    match remove_dir_all(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("{e:#}. Please remove it manually.");
            false
        }
    }
}

/// Removes a single file, tolerating its absence and retrying once after a
/// permission error.
pub fn remove_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if !path.is_file() {
        bail!("Expected a file, got {}", path.display());
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            make_writable(path);
            fs::remove_file(path).with_context(|| format!("Could not delete {}", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("Could not delete {}", path.display())),
    }
}

/// Recursively removes every directory under `root` whose name is one of
/// `dirnames`. Returns how many were removed.
pub fn remove_dirs_named(root: &Path, dirnames: &[&str]) -> usize {
    let mut matches = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_dir()
            && dirnames
                .iter()
                .any(|name| entry.file_name() == std::ffi::OsStr::new(name))
        {
            matches.push(entry.into_path());
            walker.skip_current_dir();
        }
    }

    matches
        .iter()
        .filter(|dir| try_remove_dir_all(dir))
        .count()
}

/// Removes every file under `root` with the given extension. Returns how many
/// were removed.
pub fn remove_files_with_extension(root: &Path, extension: &str) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == extension))
        .filter(|e| match remove_file(e.path()) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("{err:#}");
                false
            }
        })
        .count()
}

/// Moves `from` to `to`, falling back to copy-and-delete when a rename is not
/// possible (eg. across filesystems).
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("Could not copy {} to {}", from.display(), to.display()))?;
    remove_file(from)
}

/// Resolves `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Makes `path` absolute against the current directory and normalizes it.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Could not make {} absolute", path.display()))?;
    Ok(normalize_lexically(&absolute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_dot_and_resolves_parent() {
        let path = Path::new("/a/./b/../c/d");
        assert_eq!(normalize_lexically(path), PathBuf::from("/a/c/d"));
    }

    #[test]
    fn normalize_keeps_leading_parent_of_relative_path() {
        let path = Path::new("../x/./y");
        assert_eq!(normalize_lexically(path), PathBuf::from("../x/y"));
    }
}
