//! Error surface for configuration and binary installation.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::DaemonVersion;

/// Errors raised while installing the daemon or handling its config file.
#[derive(Debug, Clone, Error)]
pub enum InstallerError {
    /// Downloading or unpacking the daemon binary failed.
    #[error("failed to install ngrok: {message}")]
    Install {
        /// Human-readable failure description.
        message: String,
    },

    /// A download URL did not use an HTTP scheme.
    #[error("URL must start with \"http\": {url}")]
    Security {
        /// The rejected URL.
        url: String,
    },

    /// A configuration value is incompatible with supervision.
    #[error("{message}")]
    Configuration {
        /// Description of the incompatible setting.
        message: String,
    },

    /// The requested operation is not available for this daemon version.
    #[error("operation is not supported for ngrok {version}")]
    UnsupportedVersion {
        /// Version that was requested.
        version: DaemonVersion,
    },

    /// Reading or writing a file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The configuration file is not valid YAML or not a mapping.
    #[error("failed to parse ngrok config '{path}': {message}")]
    Yaml {
        /// Path of the offending file.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },
}

impl InstallerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn install(message: impl Into<String>) -> Self {
        Self::Install {
            message: message.into(),
        }
    }
}
