//! Failures reported by the `warden` binary before or while handing over to
//! `ngrok`.

use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;
use warden_agent::AgentError;

use crate::telemetry::TelemetryError;

/// Errors surfaced on stderr with a failing exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Flags, environment or config files could not be merged.
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<OrthoError>),
    /// `log_format` named an unknown format.
    #[error("unsupported log format '{value}', expected json or compact")]
    LogFormat {
        /// The rejected value.
        value: String,
    },
    /// Logging could not be set up.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// Installing or running `ngrok` failed.
    #[error(transparent)]
    Agent(#[from] AgentError),
}
