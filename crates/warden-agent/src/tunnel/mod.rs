//! Tunnels reported by the control plane, and the planning of new ones.

mod plan;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::control_plane::{ApiRequest, ControlPlane};
use crate::error::AgentError;

pub use self::plan::{
    BindTls, DEFAULT_ADDR, DEFAULT_PROTO, DEFAULT_TUNNEL_DEFINITION, TunnelPlan, TunnelRequest,
    plan_tunnel, upgrade_legacy_options,
};

/// Log target for tunnel operations.
const TUNNEL_TARGET: &str = "warden_agent::tunnel";

/// An active tunnel as described by the control plane.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tunnel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "ID", skip_serializing)]
    legacy_id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    public_url: String,
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    metrics: Map<String, Value>,
    #[serde(skip)]
    api_url: String,
}

impl Tunnel {
    /// Decodes a tunnel resource returned by the control plane at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::General`] when the document is not a tunnel or
    /// carries no public URL.
    pub fn from_response(value: Value, api_url: &str) -> Result<Self, AgentError> {
        let mut tunnel: Self = serde_json::from_value(value).map_err(|error| {
            AgentError::general(format!("ngrok returned an invalid tunnel: {error}"))
        })?;
        if tunnel.public_url.is_empty() {
            return Err(AgentError::general(format!(
                "ngrok returned a tunnel without a public_url: {}",
                tunnel.name
            )));
        }
        let legacy_id = tunnel.legacy_id.take();
        tunnel.id = tunnel.id.take().or(legacy_id);
        api_url.clone_into(&mut tunnel.api_url);
        Ok(tunnel)
    }

    /// Control-plane identifier; older agents omit it.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Friendly name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public protocol (`https`, `http`, `tcp`, `tls`).
    #[must_use]
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Control-plane URI relative to the API base.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Public URL; never empty.
    #[must_use]
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Tunnel configuration as reported by the daemon.
    #[must_use]
    pub const fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    /// Local address traffic is forwarded to.
    #[must_use]
    pub fn forward_addr(&self) -> Option<&str> {
        self.config.get("addr").and_then(Value::as_str)
    }

    /// Traffic metrics from the most recent fetch.
    #[must_use]
    pub const fn metrics(&self) -> &Map<String, Value> {
        &self.metrics
    }

    /// Control-plane base URL the tunnel was read from.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Absolute URL of this tunnel's control-plane resource.
    #[must_use]
    pub fn resource_url(&self) -> String {
        self.resource_url_at(&self.api_url)
    }

    /// URL of this tunnel's resource under another control-plane base.
    #[must_use]
    pub fn resource_url_at(&self, api_url: &str) -> String {
        format!("{api_url}{}", self.uri.replace('+', "%20"))
    }

    /// Re-fetches the tunnel and replaces its metrics.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::General`] when the response carries no
    /// `metrics`, or any error of [`ControlPlane::request`].
    pub fn refresh_metrics(
        &mut self,
        control_plane: &dyn ControlPlane,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        let response =
            control_plane.request(&ApiRequest::get(self.resource_url()).with_timeout(timeout))?;
        let Some(metrics) = response.get("metrics").and_then(Value::as_object) else {
            return Err(AgentError::general(format!(
                "the ngrok API did not return \"metrics\" in the response for {}",
                self.public_url
            )));
        };
        debug!(target: TUNNEL_TARGET, name = %self.name, "refreshed tunnel metrics");
        self.metrics = metrics.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
