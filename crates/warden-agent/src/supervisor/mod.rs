//! Registry of supervised daemon processes, keyed by executable path.
//!
//! The [`Supervisor`] is the single source of truth for whether a daemon is
//! running at a given path. Its registry lock only guards map operations;
//! spawning, the startup loop and process teardown all happen outside it.

mod admin;
mod process;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use warden_installer::{ConfigStore, validate_config};

use crate::config::AgentConfig;
use crate::error::AgentError;

pub use self::process::{DaemonProcess, StartupState};

/// Log target for registry operations.
const SUPERVISOR_TARGET: &str = "warden_agent::supervisor";

/// Starts, tracks and stops daemon processes.
#[derive(Debug)]
pub struct Supervisor {
    processes: Mutex<HashMap<PathBuf, Arc<DaemonProcess>>>,
    config_store: Arc<ConfigStore>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(Arc::new(ConfigStore::new()))
    }
}

impl Supervisor {
    /// Creates an empty registry validating configs through `config_store`.
    #[must_use]
    pub fn new(config_store: Arc<ConfigStore>) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            config_store,
        }
    }

    /// Returns the live process for the configured executable, starting one
    /// when none is registered or the registered one has exited.
    ///
    /// # Errors
    ///
    /// Propagates every failure of [`Supervisor::start`].
    pub fn get_or_start(&self, config: &AgentConfig) -> Result<Arc<DaemonProcess>, AgentError> {
        if let Some(process) = self.live(config.executable_path()) {
            return Ok(process);
        }
        self.start(config)
    }

    /// Starts a new daemon and waits for it to become healthy.
    ///
    /// When startup fails with a fatal error logged by the daemon, the start
    /// is attempted `reconnect_session_retries` more times.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Daemon`] when the binary is missing, a process is
    ///   already registered for the path, or the daemon does not become
    ///   healthy. Startup failures carry the captured logs.
    /// - [`AgentError::Configuration`] when the config file would break
    ///   supervision; nothing is spawned in that case.
    /// - [`AgentError::Security`] when the daemon announces a non-HTTP API
    ///   address.
    pub fn start(&self, config: &AgentConfig) -> Result<Arc<DaemonProcess>, AgentError> {
        let mut attempt = 0;
        loop {
            match self.start_once(config) {
                Err(error)
                    if error.cause().is_some() && attempt < config.reconnect_session_retries() =>
                {
                    attempt += 1;
                    warn!(
                        target: SUPERVISOR_TARGET,
                        attempt,
                        cause = error.cause().unwrap_or_default(),
                        "ngrok failed to start, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    fn start_once(&self, config: &AgentConfig) -> Result<Arc<DaemonProcess>, AgentError> {
        let path = config.executable_path();
        self.ensure_path_ready(path)?;
        self.validate_config_file(config)?;

        let process = Arc::new(DaemonProcess::spawn(config)?);
        info!(
            target: SUPERVISOR_TARGET,
            pid = process.pid(),
            path = %path.display(),
            "ngrok process starting"
        );
        if !self.register(path, &process) {
            if let Err(error) = process.terminate() {
                debug!(target: SUPERVISOR_TARGET, error = %error, "failed to discard duplicate ngrok process");
            }
            return Err(already_running(path));
        }

        process.await_startup();
        let health = process.is_healthy();
        if matches!(health, Ok(true)) {
            info!(
                target: SUPERVISOR_TARGET,
                pid = process.pid(),
                api_url = %process.api_url().unwrap_or_default(),
                "ngrok process has started"
            );
            if config.monitor_thread() {
                process.start_monitor();
            } else {
                process.release_output();
            }
            return Ok(process);
        }

        if let Err(error) = self.kill(path) {
            warn!(target: SUPERVISOR_TARGET, error = %error, "failed to clean up unhealthy ngrok process");
        }
        health?;
        Err(startup_failure(&process))
    }

    /// Kills the process registered for `path`.
    ///
    /// The registry entry is always removed. Unregistered paths and
    /// processes that already exited are not errors.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the OS refuses to kill a running
    /// process.
    pub fn kill(&self, path: &Path) -> Result<(), AgentError> {
        let Some(process) = self.lock().remove(path) else {
            return Ok(());
        };
        info!(
            target: SUPERVISOR_TARGET,
            pid = process.pid(),
            path = %path.display(),
            "killing ngrok process"
        );
        process.terminate()
    }

    /// Whether a registered process for `path` is still alive. A stale
    /// entry is removed as a side effect.
    #[must_use]
    pub fn is_running(&self, path: &Path) -> bool {
        self.live(path).is_some()
    }

    /// The live process registered for `path`, if any.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<DaemonProcess>> {
        self.live(path)
    }

    /// Snapshot of every live registered process.
    #[must_use]
    pub fn processes(&self) -> Vec<Arc<DaemonProcess>> {
        let mut processes = self.lock();
        processes.retain(|_, process| process.is_running());
        processes.values().cloned().collect()
    }

    /// Runs the executable in the foreground with inherited standard streams.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the binary is missing, already
    /// supervised, or cannot be spawned.
    pub fn run_blocking<I, S>(&self, path: &Path, args: I) -> Result<ExitStatus, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_path_ready(path)?;
        Command::new(path)
            .args(args)
            .status()
            .map_err(|error| spawn_failure(path, &error))
    }

    /// Runs the executable to completion and returns its combined output.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the binary is missing, already
    /// supervised, cannot be spawned, or exits unsuccessfully.
    pub fn run_blocking_captured<I, S>(&self, path: &Path, args: I) -> Result<String, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_path_ready(path)?;
        let output = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|error| spawn_failure(path, &error))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(text)
        } else {
            Err(AgentError::daemon(format!(
                "ngrok exited with {}: {}",
                output.status,
                text.trim()
            )))
        }
    }

    fn ensure_path_ready(&self, path: &Path) -> Result<(), AgentError> {
        if !path.exists() {
            return Err(AgentError::daemon(format!(
                "ngrok binary was not found at '{}'; install it before starting",
                path.display()
            )));
        }
        if self.is_running(path) {
            return Err(already_running(path));
        }
        Ok(())
    }

    fn validate_config_file(&self, config: &AgentConfig) -> Result<(), AgentError> {
        let path = config.resolved_config_path();
        if !path.exists() {
            debug!(
                target: SUPERVISOR_TARGET,
                path = %path.display(),
                "no ngrok config file to validate"
            );
            return Ok(());
        }
        let parsed = self
            .config_store
            .read_config(&path, false, config.daemon_version())?;
        validate_config(&parsed)?;
        Ok(())
    }

    fn register(&self, path: &Path, process: &Arc<DaemonProcess>) -> bool {
        let mut processes = self.lock();
        if processes.contains_key(path) {
            return false;
        }
        processes.insert(path.to_path_buf(), Arc::clone(process));
        true
    }

    fn live(&self, path: &Path) -> Option<Arc<DaemonProcess>> {
        let mut processes = self.lock();
        let process = processes.get(path).cloned()?;
        if process.is_running() {
            return Some(process);
        }
        debug!(
            target: SUPERVISOR_TARGET,
            pid = process.pid(),
            "evicting exited ngrok process"
        );
        processes.remove(path);
        None
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<DaemonProcess>>> {
        self.processes
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn already_running(path: &Path) -> AgentError {
    AgentError::daemon(format!(
        "ngrok is already running for the executable '{}'",
        path.display()
    ))
}

fn spawn_failure(path: &Path, error: &std::io::Error) -> AgentError {
    AgentError::daemon(format!(
        "failed to run ngrok at '{}': {error}",
        path.display()
    ))
}

fn startup_failure(process: &DaemonProcess) -> AgentError {
    let cause = process.startup_error();
    let message = cause.as_deref().map_or_else(
        || "The ngrok process was unable to start.".to_owned(),
        |reason| format!("The ngrok process errored on start: {reason}."),
    );
    AgentError::Daemon {
        message,
        logs: process.logs(),
        cause,
    }
}
