//! Typed views over the agent status and request-inspection endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response of `GET /api/status`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentStatus {
    /// Agent state, `online` once connected.
    pub status: Option<String>,
    /// Version reported by the daemon.
    pub agent_version: Option<String>,
    /// Session details, passed through untouched.
    pub session: Value,
    /// Resource URI of the status document.
    pub uri: Option<String>,
}

/// One request captured by the daemon's inspection interface.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CapturedRequest {
    /// Capture identifier, used to replay the request.
    pub id: Option<String>,
    /// Resource URI of the capture.
    pub uri: Option<String>,
    /// Tunnel that received the request.
    pub tunnel_name: Option<String>,
    /// Address of the remote client.
    pub remote_addr: Option<String>,
    /// Start timestamp.
    pub start: Option<String>,
    /// Round-trip duration in nanoseconds.
    pub duration: Option<u64>,
    /// Captured request, passed through untouched.
    pub request: Value,
    /// Captured response, passed through untouched.
    pub response: Value,
}
