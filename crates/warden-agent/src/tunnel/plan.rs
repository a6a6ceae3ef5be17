//! Turns a caller's tunnel request into the body sent to the control plane.
//!
//! Planning is pure: it merges the request over an optional named tunnel
//! definition from the daemon's config file, fills in defaults, names the
//! tunnel, and rewrites legacy options into their current shape.

use std::num::FpCategory;

use serde_json::{Map, Value};
use uuid::Uuid;
use warden_installer::DaemonVersion;

use crate::error::AgentError;

/// Tunnel definition used when the caller names none.
pub const DEFAULT_TUNNEL_DEFINITION: &str = "default";
/// Local address tunnelled when neither caller nor definition sets one.
pub const DEFAULT_ADDR: &str = "80";
/// Protocol used when neither caller nor definition sets one.
pub const DEFAULT_PROTO: &str = "http";

const FILE_SCHEME: &str = "file://";

/// A declarative request for a new tunnel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelRequest {
    addr: Option<String>,
    proto: Option<String>,
    name: Option<String>,
    options: Map<String, Value>,
}

impl TunnelRequest {
    /// An empty request: every field falls back to a definition or default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local address, a port, `host:port`, or `file://` URL.
    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Sets the tunnel protocol.
    #[must_use]
    pub fn with_proto(mut self, proto: impl Into<String>) -> Self {
        self.proto = Some(proto.into());
        self
    }

    /// Names the tunnel, selecting the definition of the same name if any.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a tunnel option; caller options win over definition options.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Requested local address.
    #[must_use]
    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    /// Requested protocol.
    #[must_use]
    pub fn proto(&self) -> Option<&str> {
        self.proto.as_deref()
    }

    /// Requested name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Extra tunnel options.
    #[must_use]
    pub const fn options(&self) -> &Map<String, Value> {
        &self.options
    }
}

/// The resolved create-tunnel call.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelPlan {
    /// Tunnel name, from the caller, the definition, or synthesised.
    pub name: String,
    /// Resolved protocol.
    pub proto: String,
    /// Resolved local address.
    pub addr: String,
    /// JSON body for `POST /api/tunnels`.
    pub body: Map<String, Value>,
    /// Whether the agent answers with its TLS tunnel and opens a plaintext
    /// twin that has to be fetched separately.
    pub fetch_plaintext_variant: bool,
}

/// The legacy `bind_tls` option, read without truthiness coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTls {
    /// `true`, `"true"` or `1`: HTTPS only.
    Https,
    /// `false`, `"false"`, `0`, empty or null: plain HTTP only.
    Http,
    /// Anything else, notably `"both"`.
    Both,
}

impl BindTls {
    /// Classifies a raw `bind_tls` value.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Self::Https,
            Value::Bool(false) | Value::Null => Self::Http,
            Value::String(text) => match text.as_str() {
                "true" => Self::Https,
                "false" | "" => Self::Http,
                _ => Self::Both,
            },
            Value::Number(number) if number.as_u64() == Some(1) => Self::Https,
            Value::Number(number)
                if number.as_f64().map(f64::classify) == Some(FpCategory::Zero) =>
            {
                Self::Http
            }
            Value::Number(_) | Value::Array(_) | Value::Object(_) => Self::Both,
        }
    }

    /// Equivalent `schemes` list.
    #[must_use]
    pub fn schemes(self) -> Vec<Value> {
        let names: &[&str] = match self {
            Self::Https => &["https"],
            Self::Http => &["http"],
            Self::Both => &["http", "https"],
        };
        names.iter().map(|name| Value::from(*name)).collect()
    }
}

/// Resolves `request` against `definitions`, the `tunnels` map of the
/// daemon's config file.
///
/// # Errors
///
/// Returns [`AgentError::Configuration`] when the selected definition is
/// not a mapping.
pub fn plan_tunnel(
    request: &TunnelRequest,
    definitions: Option<&Map<String, Value>>,
    version: DaemonVersion,
) -> Result<TunnelPlan, AgentError> {
    let lookup = request.name().unwrap_or(DEFAULT_TUNNEL_DEFINITION);
    let definition = match definitions.and_then(|tunnels| tunnels.get(lookup)) {
        None => None,
        Some(Value::Object(definition)) => Some(definition),
        Some(_) => {
            return Err(AgentError::Configuration {
                message: format!("tunnel definition '{lookup}' must be a mapping"),
            });
        }
    };
    let resolved_name = match (request.name(), definition) {
        (Some(name), _) => Some(name.to_owned()),
        (None, Some(_)) => Some(DEFAULT_TUNNEL_DEFINITION.to_owned()),
        (None, None) => None,
    };

    let addr = request
        .addr()
        .map(str::to_owned)
        .or_else(|| definition.and_then(|fields| scalar(fields.get("addr"))))
        .unwrap_or_else(|| DEFAULT_ADDR.to_owned());
    let proto = request
        .proto()
        .map(str::to_owned)
        .or_else(|| definition.and_then(|fields| scalar(fields.get("proto"))))
        .unwrap_or_else(|| DEFAULT_PROTO.to_owned());
    let name = resolved_name.unwrap_or_else(|| synthesise_name(&proto, &addr));

    let mut body = definition.cloned().unwrap_or_default();
    for (key, value) in request.options() {
        body.insert(key.clone(), value.clone());
    }

    let fetch_plaintext_variant = version == DaemonVersion::V2
        && proto == DEFAULT_PROTO
        && body
            .get("bind_tls")
            .is_none_or(|value| BindTls::from_value(value) == BindTls::Both);
    if version == DaemonVersion::V3 {
        upgrade_legacy_options(&mut body);
    }

    body.insert("name".to_owned(), Value::from(name.as_str()));
    body.insert("addr".to_owned(), Value::from(addr.as_str()));
    body.insert("proto".to_owned(), Value::from(proto.as_str()));

    Ok(TunnelPlan {
        name,
        proto,
        addr,
        body,
        fetch_plaintext_variant,
    })
}

/// Rewrites 2.x-style options into the 3.x request shape.
///
/// `bind_tls` becomes a `schemes` list, and an `auth` credential string or
/// list becomes a `basic_auth` list. Any other `auth` value and every other
/// key is left alone.
pub fn upgrade_legacy_options(options: &mut Map<String, Value>) {
    if let Some(bind_tls) = options.remove("bind_tls") {
        options.insert(
            "schemes".to_owned(),
            Value::Array(BindTls::from_value(&bind_tls).schemes()),
        );
    }
    let credentials = match options.get("auth") {
        Some(Value::String(single)) => vec![Value::from(single.as_str())],
        Some(Value::Array(list)) => list.clone(),
        _ => return,
    };
    options.remove("auth");
    options.insert("basic_auth".to_owned(), Value::Array(credentials));
}

fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn synthesise_name(proto: &str, addr: &str) -> String {
    let id = Uuid::new_v4();
    if addr.starts_with(FILE_SCHEME) {
        format!("{proto}-file-{id}")
    } else {
        format!("{proto}-{addr}-{id}")
    }
}
