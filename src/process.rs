#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Structured subprocess invocation.
//!
//! Every external tool (pytest, pip, venv, git, pycodestyle) goes through
//! [`Invocation::run`]: an argument list, a working directory, extra
//! environment and an optional timeout in, a [`Collected`] out.

use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::{Child, Command},
    time::timeout,
};

/// Drop guard that terminates a spawned child process if the invocation is
/// abandoned (timeout or early return).
struct ChildDropGuard(Option<Child>);

impl ChildDropGuard {
    /// Wraps the provided child process with the drop guard.
    fn new(child: Child) -> Self {
        Self(Some(child))
    }

    /// Returns a mutable reference to the underlying child process.
    fn child_mut(&mut self) -> Result<&mut Child> {
        self.0
            .as_mut()
            .context("child process already taken from guard")
    }

    /// Prevents the guard from killing the process on drop.
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for ChildDropGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct Collected {
    /// Exit status returned by the process.
    pub status: std::process::ExitStatus,
    /// Contents written to stdout.
    pub stdout: Vec<u8>,
    /// Contents written to stderr.
    pub stderr: Vec<u8>,
}

impl Collected {
    /// Whether the process exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout, lossily decoded.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr, lossily decoded.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        let stdout = self.stdout_lossy();
        let stderr = self.stderr_lossy();
        match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (_, true) => stdout,
            (true, false) => stderr,
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// A single external command: program, arguments, where and how long to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program to execute; a bare name is resolved through `PATH`.
    program:  OsString,
    /// Arguments, passed verbatim (no shell involved).
    args:     Vec<OsString>,
    /// Working directory of the child.
    cwd:      Option<PathBuf>,
    /// Extra environment variables.
    env:      Vec<(OsString, OsString)>,
    /// Kill the child and fail when it runs longer than this.
    deadline: Option<Duration>,
}

impl Invocation {
    /// Shorthand for an invocation of `program` with `args` and nothing else.
    pub fn new<I, S>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program:  program.into(),
            args:     args.into_iter().map(Into::into).collect(),
            cwd:      None,
            env:      Vec::new(),
            deadline: None,
        }
    }

    /// Returns the program being invoked.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Returns the arguments.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Returns the working directory, if one was set.
    pub fn cwd(&self) -> Option<&std::path::Path> {
        self.cwd.as_deref()
    }

    /// Replaces the program, keeping everything else.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the working directory.
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the timeout.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Spawns the command and waits for it, collecting stdout and stderr.
    ///
    /// A non-zero exit status is *not* an error here; callers decide what a
    /// failure means for their tool. Spawn failures and timeouts are errors.
    pub async fn run(&self) -> Result<Collected> {
        tracing::debug!("Running {self}");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut guard = ChildDropGuard::new(
            cmd.spawn()
                .with_context(|| format!("failed to spawn {}", self.program.to_string_lossy()))?,
        );

        let stdout = guard
            .child_mut()?
            .stdout
            .take()
            .context("missing stdout pipe")?;
        let stderr = guard
            .child_mut()?
            .stderr
            .take()
            .context("missing stderr pipe")?;

        let out_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .context("failed to read stdout")?;
            Ok::<Vec<u8>, anyhow::Error>(buf)
        });

        let err_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .context("failed to read stderr")?;
            Ok::<Vec<u8>, anyhow::Error>(buf)
        });

        let wait_future = async move {
            let mut guard = guard;
            let status = guard
                .child_mut()?
                .wait()
                .await
                .context("failed to wait on process")?;
            let stdout = out_task.await.context("stdout task join error")??;
            let stderr = err_task.await.context("stderr task join error")??;
            guard.disarm();
            Ok(Collected {
                status,
                stdout,
                stderr,
            })
        };

        match self.deadline {
            Some(limit) => timeout(limit, wait_future)
                .await
                .with_context(|| format!("{self} timed out after {}s", limit.as_secs()))?,
            None => wait_future.await,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        write!(f, "`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let invocation = Invocation::new("python", ["-m", "pytest", "tests"]);
        assert_eq!(invocation.to_string(), "`python -m pytest tests`");
    }

    #[test]
    fn with_program_keeps_arguments() {
        let invocation = Invocation::new("pip", ["install", "-r", "requirements.txt"])
            .with_program("/tmp/venv/bin/pip");
        assert_eq!(invocation.program(), OsStr::new("/tmp/venv/bin/pip"));
        assert_eq!(invocation.args().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_collects_stdout_and_status() {
        let collected = Invocation::new("sh", ["-c", "echo hello; exit 3"])
            .run()
            .await
            .expect("run sh");
        assert!(!collected.success());
        assert_eq!(collected.stdout_lossy().trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_times_out() {
        let result = Invocation::new("sh", ["-c", "sleep 5"])
            .with_deadline(Duration::from_millis(100))
            .run()
            .await;
        assert!(result.is_err());
    }
}
