//! A single supervised daemon process and its log plumbing.
//!
//! Standard output is drained by a dedicated reader thread into a channel.
//! The startup loop consumes the channel until the daemon is ready, fails,
//! or the deadline passes; afterwards an optional monitor thread takes the
//! receiver over. When nobody consumes the channel any more, the reader keeps
//! draining the pipe and discards lines so the daemon never blocks on a full
//! pipe.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{API_KEY_ENV, AgentConfig, LogEventCallback};
use crate::control_plane::ensure_http;
use crate::error::AgentError;
use crate::log_record::{LogLevel, LogRecord};

/// Log target for supervision events.
const PROCESS_TARGET: &str = "warden_agent::supervisor";
/// Log target under which daemon output is re-emitted.
const DAEMON_LOG_TARGET: &str = "warden_agent::daemon";

/// Message fragment announcing the control-plane address.
pub(crate) const WEB_SERVICE_STARTING: &str = "starting web service";
/// Message fragment announcing the tunnel subsystem.
pub(crate) const TUNNEL_SESSION_STARTED: &str = "tunnel session started";
/// Message fragment announcing the upstream session.
pub(crate) const CLIENT_SESSION_ESTABLISHED: &str = "client session established";

/// Upper bound on a single wait inside the startup loop.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `ESRCH`: the process no longer exists.
const NO_SUCH_PROCESS: i32 = 3;

/// Readiness reducer fed by startup log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupState {
    api_url: Option<String>,
    tunnel_started: bool,
    client_connected: bool,
    error: Option<String>,
}

impl StartupState {
    /// Folds one log record into the state.
    ///
    /// An error-level record stores its `err` field (or its message when
    /// `err` is missing) as the fatal startup error.
    pub fn observe(&mut self, record: &LogRecord) {
        if record.level().is_error() {
            self.error = Some(
                record
                    .error()
                    .or_else(|| record.message())
                    .unwrap_or_else(|| record.line())
                    .to_owned(),
            );
            return;
        }

        let Some(message) = record.message() else {
            return;
        };
        if message.contains(WEB_SERVICE_STARTING) {
            if let Some(addr) = record.addr() {
                self.api_url = Some(format!("http://{addr}"));
            }
        } else if message.contains(TUNNEL_SESSION_STARTED) {
            self.tunnel_started = true;
        } else if message.contains(CLIENT_SESSION_ESTABLISHED) {
            self.client_connected = true;
        }
    }

    /// All three readiness signals have been seen.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.api_url.is_some() && self.tunnel_started && self.client_connected
    }

    /// Discovered control-plane base URL.
    #[must_use]
    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref()
    }

    /// Fatal startup error, if one was logged.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Bounded log history shared with the monitor thread.
struct LogSink {
    pid: u32,
    max_logs: usize,
    callback: Option<LogEventCallback>,
    records: Mutex<VecDeque<LogRecord>>,
}

impl LogSink {
    fn record(&self, line: &str) -> Option<LogRecord> {
        let record = LogRecord::parse(line)?;
        emit(&record, self.pid);
        {
            let mut records = lock(&self.records);
            records.push_back(record.clone());
            while records.len() > self.max_logs {
                records.pop_front();
            }
        }
        if let Some(callback) = &self.callback {
            callback(&record);
        }
        Some(record)
    }

    fn snapshot(&self) -> Vec<LogRecord> {
        lock(&self.records).iter().cloned().collect()
    }
}

fn emit(record: &LogRecord, pid: u32) {
    let line = record.line();
    match record.level() {
        LogLevel::Critical | LogLevel::Error => error!(target: DAEMON_LOG_TARGET, pid, "{line}"),
        LogLevel::Warning => warn!(target: DAEMON_LOG_TARGET, pid, "{line}"),
        LogLevel::Info => info!(target: DAEMON_LOG_TARGET, pid, "{line}"),
        LogLevel::NotSet => debug!(target: DAEMON_LOG_TARGET, pid, "{line}"),
    }
}

struct Monitor {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// A daemon subprocess owned by the [`Supervisor`](super::Supervisor).
pub struct DaemonProcess {
    pid: u32,
    executable_path: PathBuf,
    config: AgentConfig,
    child: Mutex<Child>,
    startup: Mutex<StartupState>,
    logs: Arc<LogSink>,
    lines: Mutex<Option<Receiver<String>>>,
    monitor: Mutex<Option<Monitor>>,
}

impl fmt::Debug for DaemonProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonProcess")
            .field("pid", &self.pid)
            .field("executable_path", &self.executable_path)
            .field("startup", &*lock(&self.startup))
            .finish_non_exhaustive()
    }
}

impl DaemonProcess {
    /// Spawns the daemon and starts draining its standard output.
    pub(crate) fn spawn(config: &AgentConfig) -> Result<Self, AgentError> {
        let mut command = start_command(config);
        let mut child = command.spawn().map_err(|error| {
            AgentError::daemon(format!(
                "failed to spawn ngrok at '{}': {error}",
                config.executable_path().display()
            ))
        })?;
        let pid = child.id();

        let Some(stdout) = child.stdout.take() else {
            kill_quietly(&mut child);
            return Err(AgentError::daemon("failed to capture ngrok stdout"));
        };
        let (sender, receiver) = mpsc::channel();
        if let Err(error) = spawn_reader(pid, stdout, sender) {
            kill_quietly(&mut child);
            return Err(AgentError::daemon(format!(
                "failed to start ngrok output reader: {error}"
            )));
        }

        Ok(Self {
            pid,
            executable_path: config.executable_path().to_path_buf(),
            config: config.clone(),
            child: Mutex::new(child),
            startup: Mutex::new(StartupState::default()),
            logs: Arc::new(LogSink {
                pid,
                max_logs: config.max_logs(),
                callback: config.log_event_callback().cloned(),
                records: Mutex::new(VecDeque::new()),
            }),
            lines: Mutex::new(Some(receiver)),
            monitor: Mutex::new(None),
        })
    }

    /// OS process identifier.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Executable the process was started from.
    #[must_use]
    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    /// Configuration the process was started with.
    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Control-plane base URL announced by the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::General`] until the daemon has announced it.
    pub fn api_url(&self) -> Result<String, AgentError> {
        lock(&self.startup)
            .api_url()
            .map(str::to_owned)
            .ok_or_else(|| AgentError::general("ngrok has not announced its API address yet"))
    }

    /// Fatal error recorded during startup.
    #[must_use]
    pub fn startup_error(&self) -> Option<String> {
        lock(&self.startup).error().map(str::to_owned)
    }

    /// Retained log history, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.snapshot()
    }

    /// Whether the OS process has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    /// Whether the daemon is ready, alive, and reported no fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Security`] when the announced API URL is not
    /// HTTP.
    pub fn is_healthy(&self) -> Result<bool, AgentError> {
        let state = lock(&self.startup).clone();
        let Some(api_url) = state.api_url() else {
            return Ok(false);
        };
        if !state.is_ready() {
            return Ok(false);
        }
        ensure_http(api_url)?;
        Ok(state.error().is_none() && self.is_running())
    }

    /// Whether a monitor thread is currently consuming output.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor)
            .as_ref()
            .is_some_and(|monitor| !monitor.handle.is_finished())
    }

    /// Consumes output until the daemon is ready, fails, exits, or the
    /// startup timeout elapses.
    pub(crate) fn await_startup(&self) {
        let deadline = Instant::now() + self.config.startup_timeout();
        let guard = lock(&self.lines);
        let Some(receiver) = guard.as_ref() else {
            return;
        };

        loop {
            {
                let state = lock(&self.startup);
                if state.error().is_some() || state.is_ready() {
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(target: PROCESS_TARGET, pid = self.pid, "ngrok startup timed out");
                break;
            }
            match receiver.recv_timeout((deadline - now).min(STARTUP_POLL_INTERVAL)) {
                Ok(line) => {
                    if let Some(record) = self.logs.record(&line) {
                        lock(&self.startup).observe(&record);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.is_running() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Starts the background monitor. Does nothing when one is running or
    /// the output has already been handed off.
    pub fn start_monitor(&self) {
        let mut monitor = lock(&self.monitor);
        if monitor
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }
        let Some(receiver) = lock(&self.lines).take() else {
            return;
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let sink = Arc::clone(&self.logs);
        let spawned = thread::Builder::new()
            .name(format!("ngrok-monitor-{}", self.pid))
            .spawn(move || monitor_loop(&receiver, &sink, &thread_stop));
        match spawned {
            Ok(handle) => {
                debug!(target: PROCESS_TARGET, pid = self.pid, "monitor thread started");
                *monitor = Some(Monitor { stop, handle });
            }
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid = self.pid,
                    error = %error,
                    "failed to start monitor thread"
                );
            }
        }
    }

    /// Asks the monitor to stop after the line it is currently waiting for.
    pub fn stop_monitor(&self) {
        if let Some(monitor) = lock(&self.monitor).as_ref() {
            monitor.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Stops consuming output without starting a monitor.
    pub(crate) fn release_output(&self) {
        lock(&self.lines).take();
    }

    /// Kills the process and reaps it, tolerating an already-exited child.
    pub(crate) fn terminate(&self) -> Result<(), AgentError> {
        self.stop_monitor();
        let mut child = lock(&self.child);
        match child.kill() {
            Ok(()) => {}
            Err(error) if already_exited(&error) => {
                debug!(target: PROCESS_TARGET, pid = self.pid, "ngrok process already exited");
            }
            Err(error) => {
                return Err(AgentError::daemon(format!(
                    "failed to kill ngrok process {}: {error}",
                    self.pid
                )));
            }
        }
        if let Err(error) = child.wait() {
            debug!(
                target: PROCESS_TARGET,
                pid = self.pid,
                error = %error,
                "ngrok process already reaped"
            );
        }
        Ok(())
    }
}

fn monitor_loop(receiver: &Receiver<String>, sink: &LogSink, stop: &AtomicBool) {
    for line in receiver {
        sink.record(&line);
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!(target: PROCESS_TARGET, pid = sink.pid, "monitor thread finished");
}

fn spawn_reader(pid: u32, stdout: ChildStdout, sender: Sender<String>) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("ngrok-stdout-{pid}"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buffer = Vec::new();
            let mut forwarding = true;
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buffer).trim_end().to_owned();
                        if forwarding && sender.send(text).is_err() {
                            forwarding = false;
                        }
                    }
                }
            }
        })
        .map(|_| ())
}

fn start_command(config: &AgentConfig) -> Command {
    let mut command = Command::new(config.executable_path());
    command.args(["start", "--none", "--log=stdout"]);
    if let Some(path) = config.config_path() {
        info!(
            target: PROCESS_TARGET,
            path = %path.display(),
            "starting ngrok with config file"
        );
        command.arg(format!("--config={}", path.display()));
    }
    if let Some(token) = config.auth_token() {
        info!(target: PROCESS_TARGET, "overriding default auth token");
        command.arg(format!("--authtoken={token}"));
    }
    if let Some(region) = config.region() {
        info!(target: PROCESS_TARGET, region, "starting ngrok in region");
        command.arg(format!("--region={region}"));
    }
    if let Some(key) = config.api_key() {
        command.env(API_KEY_ENV, key);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    isolate_session(&mut command, config);
    command
}

#[cfg(unix)]
fn isolate_session(command: &mut Command, config: &AgentConfig) {
    use std::os::unix::process::CommandExt;

    if config.start_new_session() {
        command.process_group(0);
    }
}

#[cfg(not(unix))]
fn isolate_session(_command: &mut Command, config: &AgentConfig) {
    if config.start_new_session() {
        warn!(
            target: PROCESS_TARGET,
            "ignoring start_new_session, process groups are not supported on this platform"
        );
    }
}

fn already_exited(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::InvalidInput || error.raw_os_error() == Some(NO_SUCH_PROCESS)
}

fn kill_quietly(child: &mut Child) {
    if child.kill().is_ok() {
        if let Err(error) = child.wait() {
            debug!(target: PROCESS_TARGET, error = %error, "failed to reap ngrok process");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
