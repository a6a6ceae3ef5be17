//! Per-call configuration threaded through every supervisor operation.
//!
//! [`AgentConfig`] is immutable once handed to an operation. Callers build
//! one with the `with_*` methods, or rely on the session's default slot.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use warden_installer::DaemonVersion;

use crate::log_record::LogRecord;

/// Environment variable holding an auth token override.
pub const AUTH_TOKEN_ENV: &str = "NGROK_AUTHTOKEN";
/// Environment variable holding an API key override.
pub const API_KEY_ENV: &str = "NGROK_API_KEY";

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_MAX_LOGS: usize = 100;

#[cfg(windows)]
const BINARY_NAME: &str = "ngrok.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "ngrok";

/// Callback invoked for every daemon log line.
pub type LogEventCallback = Arc<dyn Fn(&LogRecord) + Send + Sync>;

/// Settings for installing, starting and talking to the daemon.
#[derive(Clone)]
pub struct AgentConfig {
    executable_path: PathBuf,
    config_path: Option<PathBuf>,
    auth_token: Option<String>,
    api_key: Option<String>,
    region: Option<String>,
    monitor_thread: bool,
    log_event_callback: Option<LogEventCallback>,
    start_new_session: bool,
    startup_timeout: Duration,
    max_logs: usize,
    request_timeout: Duration,
    reconnect_session_retries: u32,
    daemon_version: DaemonVersion,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable_path: default_executable_path(),
            config_path: None,
            auth_token: None,
            api_key: None,
            region: None,
            monitor_thread: true,
            log_event_callback: None,
            start_new_session: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_logs: DEFAULT_MAX_LOGS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_session_retries: 0,
            daemon_version: DaemonVersion::default(),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("executable_path", &self.executable_path)
            .field("config_path", &self.config_path)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("monitor_thread", &self.monitor_thread)
            .field("log_event_callback", &self.log_event_callback.is_some())
            .field("start_new_session", &self.start_new_session)
            .field("startup_timeout", &self.startup_timeout)
            .field("max_logs", &self.max_logs)
            .field("request_timeout", &self.request_timeout)
            .field("reconnect_session_retries", &self.reconnect_session_retries)
            .field("daemon_version", &self.daemon_version)
            .finish()
    }
}

impl AgentConfig {
    /// Creates a configuration with default paths and timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a default configuration with credentials taken from
    /// `NGROK_AUTHTOKEN` and `NGROK_API_KEY` when they are set.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            auth_token: non_empty_env(AUTH_TOKEN_ENV),
            api_key: non_empty_env(API_KEY_ENV),
            ..Self::default()
        }
    }

    /// Sets the daemon executable path.
    #[must_use]
    pub fn with_executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = path.into();
        self
    }

    /// Sets the daemon configuration file path.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Overrides the auth token passed to the daemon.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Overrides the API key passed to the daemon.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Overrides the region the daemon connects to.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Chooses whether logs keep being read after a healthy start.
    #[must_use]
    pub const fn with_monitor_thread(mut self, enabled: bool) -> Self {
        self.monitor_thread = enabled;
        self
    }

    /// Registers a callback for every daemon log line.
    #[must_use]
    pub fn with_log_event_callback(
        mut self,
        callback: impl Fn(&LogRecord) + Send + Sync + 'static,
    ) -> Self {
        self.log_event_callback = Some(Arc::new(callback));
        self
    }

    /// Starts the daemon in its own process group where supported.
    #[must_use]
    pub const fn with_start_new_session(mut self, enabled: bool) -> Self {
        self.start_new_session = enabled;
        self
    }

    /// Sets how long the daemon may take to become healthy.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets how many log lines each process retains.
    #[must_use]
    pub const fn with_max_logs(mut self, max_logs: usize) -> Self {
        self.max_logs = max_logs;
        self
    }

    /// Sets the control-plane request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how many extra start attempts follow a fatal startup error.
    #[must_use]
    pub const fn with_reconnect_session_retries(mut self, retries: u32) -> Self {
        self.reconnect_session_retries = retries;
        self
    }

    /// Selects the daemon major version.
    #[must_use]
    pub const fn with_daemon_version(mut self, version: DaemonVersion) -> Self {
        self.daemon_version = version;
        self
    }

    /// Daemon executable path.
    #[must_use]
    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    /// Explicitly configured config file path.
    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Config file path the daemon will read: the explicit path, or the
    /// daemon's own default location for its version.
    #[must_use]
    pub fn resolved_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| default_config_path(self.daemon_version))
    }

    /// Auth token override.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// API key override.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Region override.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Whether a monitor thread runs after startup.
    #[must_use]
    pub const fn monitor_thread(&self) -> bool {
        self.monitor_thread
    }

    /// Registered log callback.
    #[must_use]
    pub const fn log_event_callback(&self) -> Option<&LogEventCallback> {
        self.log_event_callback.as_ref()
    }

    /// Whether the daemon gets its own process group.
    #[must_use]
    pub const fn start_new_session(&self) -> bool {
        self.start_new_session
    }

    /// Startup deadline.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Retained log lines per process.
    #[must_use]
    pub const fn max_logs(&self) -> usize {
        self.max_logs
    }

    /// Control-plane request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Extra start attempts after a fatal startup error.
    #[must_use]
    pub const fn reconnect_session_retries(&self) -> u32 {
        self.reconnect_session_retries
    }

    /// Daemon major version.
    #[must_use]
    pub const fn daemon_version(&self) -> DaemonVersion {
        self.daemon_version
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn default_executable_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("warden")
        .join("bin")
        .join(BINARY_NAME)
}

fn default_config_path(version: DaemonVersion) -> PathBuf {
    match version {
        DaemonVersion::V2 => dirs::home_dir()
            .unwrap_or_else(env::temp_dir)
            .join(".ngrok2")
            .join("ngrok.yml"),
        DaemonVersion::V3 => dirs::config_dir()
            .unwrap_or_else(env::temp_dir)
            .join("ngrok")
            .join("ngrok.yml"),
    }
}
