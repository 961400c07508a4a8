#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Process-wide runtime configuration.
//!
//! Timeouts for every kind of external tool are read once from the
//! environment (a `.env` file is honoured by the binary) and shared through a
//! lazily initialised global.

use std::{
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

/// Default timeout for one pytest invocation.
const DEFAULT_RUNNER_TIMEOUT_SECS: u64 = 600;
/// Default timeout for virtual environment creation and `pip install`.
const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 600;
/// Default timeout for a single git command.
const DEFAULT_GIT_TIMEOUT_SECS: u64 = 300;
/// Default timeout for one style-checker invocation.
const DEFAULT_STYLE_TIMEOUT_SECS: u64 = 120;

/// Timeouts applied to the external tools driven by the grader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigState {
    /// Timeout for the test runner.
    runner_timeout:  Duration,
    /// Timeout for environment provisioning and dependency installation.
    install_timeout: Duration,
    /// Timeout for git operations.
    git_timeout:     Duration,
    /// Timeout for the style checker.
    style_timeout:   Duration,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            runner_timeout:  Duration::from_secs(DEFAULT_RUNNER_TIMEOUT_SECS),
            install_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
            git_timeout:     Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS),
            style_timeout:   Duration::from_secs(DEFAULT_STYLE_TIMEOUT_SECS),
        }
    }
}

impl ConfigState {
    /// Reads every timeout from its environment variable, falling back to the
    /// defaults.
    fn from_env() -> Self {
        Self {
            runner_timeout:  read_timeout_secs(
                "TPAC_RUNNER_TIMEOUT_SECS",
                DEFAULT_RUNNER_TIMEOUT_SECS,
            ),
            install_timeout: read_timeout_secs(
                "TPAC_INSTALL_TIMEOUT_SECS",
                DEFAULT_INSTALL_TIMEOUT_SECS,
            ),
            git_timeout:     read_timeout_secs("TPAC_GIT_TIMEOUT_SECS", DEFAULT_GIT_TIMEOUT_SECS),
            style_timeout:   read_timeout_secs(
                "TPAC_STYLE_TIMEOUT_SECS",
                DEFAULT_STYLE_TIMEOUT_SECS,
            ),
        }
    }

    /// Returns the test runner timeout.
    pub fn runner_timeout(&self) -> Duration {
        self.runner_timeout
    }

    /// Returns the provisioning/installation timeout.
    pub fn install_timeout(&self) -> Duration {
        self.install_timeout
    }

    /// Returns the git timeout.
    pub fn git_timeout(&self) -> Duration {
        self.git_timeout
    }

    /// Returns the style checker timeout.
    pub fn style_timeout(&self) -> Duration {
        self.style_timeout
    }

    /// Returns a copy with a different runner timeout.
    pub fn with_runner_timeout(mut self, timeout: Duration) -> Self {
        self.runner_timeout = timeout;
        self
    }
}

/// Global storage for the lazily constructed configuration state.
static CONFIG_SLOT: OnceLock<Mutex<Option<Arc<ConfigState>>>> = OnceLock::new();

/// Returns the mutex guarding the global configuration slot.
fn slot() -> &'static Mutex<Option<Arc<ConfigState>>> {
    CONFIG_SLOT.get_or_init(|| Mutex::new(None))
}

/// Returns the active configuration, reading the environment on first use.
pub fn get() -> Arc<ConfigState> {
    let mut guard = match slot().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(cfg) = guard.as_ref() {
        return Arc::clone(cfg);
    }

    let cfg = Arc::new(ConfigState::from_env());
    *guard = Some(Arc::clone(&cfg));
    cfg
}

/// Replaces the active configuration.
pub fn set(cfg: ConfigState) {
    let mut guard = match slot().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(Arc::new(cfg));
}

/// Returns the configured test runner timeout.
pub fn runner_timeout() -> Duration {
    get().runner_timeout()
}

/// Returns the configured provisioning/installation timeout.
pub fn install_timeout() -> Duration {
    get().install_timeout()
}

/// Returns the configured git timeout.
pub fn git_timeout() -> Duration {
    get().git_timeout()
}

/// Returns the configured style checker timeout.
pub fn style_timeout() -> Duration {
    get().style_timeout()
}

/// Parses an environment variable into a `Duration`, falling back to
/// `default_secs` when parsing fails or the variable is missing.
fn read_timeout_secs(env: &str, default_secs: u64) -> Duration {
    std::env::var(env)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}
