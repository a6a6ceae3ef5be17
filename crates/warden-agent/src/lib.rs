//! Supervision of a local `ngrok` daemon and the tunnels it serves.
//!
//! The crate launches the daemon as a child process, infers readiness from
//! its `key=value` log stream, and drives its local HTTP control plane to
//! open, list and close tunnels.
//!
//! The layers, leaves first:
//!
//! - [`LogRecord`] parses one daemon log line.
//! - [`Supervisor`] owns the daemon processes, keyed by executable path,
//!   and runs one-shot administrative commands.
//! - [`ControlPlane`] is the seam for control-plane calls;
//!   [`HttpControlPlane`] implements it over HTTP.
//! - [`TunnelSession`] composes installation, supervision and the tunnel
//!   cache behind `connect`, `list`, `disconnect` and `kill`.
//!
//! Every operation takes an [`AgentConfig`] and reports failures as an
//! [`AgentError`].

mod config;
mod control_plane;
mod error;
mod log_record;
mod session;
mod supervisor;
mod tunnel;

pub use config::{API_KEY_ENV, AUTH_TOKEN_ENV, AgentConfig, LogEventCallback};
pub use control_plane::{
    AgentStatus, ApiRequest, CapturedRequest, ControlPlane, HttpControlPlane, HttpMethod,
    ensure_http,
};
pub use error::{AgentError, HttpFailure};
pub use log_record::{LogLevel, LogRecord};
pub use session::TunnelSession;
pub use supervisor::{DaemonProcess, StartupState, Supervisor};
pub use tunnel::{
    BindTls, DEFAULT_ADDR, DEFAULT_PROTO, DEFAULT_TUNNEL_DEFINITION, Tunnel, TunnelPlan,
    TunnelRequest, plan_tunnel, upgrade_legacy_options,
};
pub use warden_installer::DaemonVersion;

#[cfg(test)]
mod tests;
