//! Error taxonomy shared by every supervisor operation.
//!
//! Each variant carries enough context for a caller to decide whether to
//! retry, report, or ignore the failure without parsing message text:
//! daemon failures carry the captured log history, HTTP failures carry the
//! status, headers and raw body.

use std::collections::BTreeMap;

use thiserror::Error;
use warden_installer::InstallerError;

use crate::log_record::LogRecord;

/// Errors raised by the tunnel agent.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// A failure that fits no narrower category.
    #[error("{message}")]
    General {
        /// Human-readable failure description.
        message: String,
    },

    /// A configuration value would make the daemon unsupervisable.
    #[error("{message}")]
    Configuration {
        /// Description of the incompatible setting.
        message: String,
    },

    /// A URL outside the HTTP allow-list was used.
    #[error("URL must start with \"http\": {url}")]
    Security {
        /// The rejected URL.
        url: String,
    },

    /// Installing the daemon binary failed.
    #[error("failed to install ngrok: {message}")]
    Install {
        /// Human-readable failure description.
        message: String,
    },

    /// The daemon could not be started or invoked.
    #[error("{message}")]
    Daemon {
        /// Human-readable failure description.
        message: String,
        /// Log lines captured before the failure.
        logs: Vec<LogRecord>,
        /// The `err` field of the fatal log line, when there was one.
        cause: Option<String>,
    },

    /// The control plane answered with a non-2xx status.
    #[error("ngrok client API returned {}: {}", .0.status, .0.body)]
    Http(Box<HttpFailure>),

    /// The control plane could not be reached.
    #[error("ngrok client exception, URLError: {reason}")]
    Transport {
        /// Underlying transport failure, `timed out` for timeouts.
        reason: String,
    },
}

/// Details of a non-2xx control-plane response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    /// Requested URL.
    pub url: String,
    /// Response status code.
    pub status: u16,
    /// Reason phrase supplied by the transport, if any.
    pub message: Option<String>,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Raw response body, usually the daemon's own JSON error.
    pub body: String,
}

impl AgentError {
    pub(crate) fn general(message: impl Into<String>) -> Self {
        Self::General {
            message: message.into(),
        }
    }

    pub(crate) fn daemon(message: impl Into<String>) -> Self {
        Self::Daemon {
            message: message.into(),
            logs: Vec::new(),
            cause: None,
        }
    }

    /// Captured daemon logs, empty for non-daemon errors.
    #[must_use]
    pub fn logs(&self) -> &[LogRecord] {
        match self {
            Self::Daemon { logs, .. } => logs,
            _ => &[],
        }
    }

    /// Root cause reported by the daemon, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::Daemon { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// HTTP status of a control-plane rejection.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(failure) => Some(failure.status),
            _ => None,
        }
    }
}

impl From<InstallerError> for AgentError {
    fn from(error: InstallerError) -> Self {
        match error {
            InstallerError::Install { message } => Self::Install { message },
            InstallerError::Security { url } => Self::Security { url },
            InstallerError::Configuration { message } => Self::Configuration { message },
            InstallerError::Yaml { .. } => Self::Configuration {
                message: error.to_string(),
            },
            InstallerError::UnsupportedVersion { .. } | InstallerError::Io { .. } => {
                Self::General {
                    message: error.to_string(),
                }
            }
        }
    }
}
