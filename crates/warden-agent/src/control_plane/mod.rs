//! Client for the daemon's local HTTP JSON API.
//!
//! [`ControlPlane`] is the seam the tunnel session talks through;
//! [`HttpControlPlane`] implements it with a blocking `reqwest` client.
//! Requests are stateless and may be issued concurrently.

mod agent;

use std::collections::BTreeMap;
use std::error::Error as _;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use strum::Display;
use tracing::debug;
use url::Url;

use crate::error::{AgentError, HttpFailure};

pub use self::agent::{AgentStatus, CapturedRequest};

/// Log target for control-plane traffic.
const CONTROL_PLANE_TARGET: &str = "warden_agent::control_plane";

/// Version header sent with authenticated requests.
const API_VERSION_HEADER: &str = "Ngrok-Version";
const API_VERSION: &str = "2";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

/// HTTP verbs the control plane accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Read a resource.
    Get,
    /// Create a resource.
    Post,
    /// Remove a resource.
    Delete,
}

/// A single control-plane call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    url: String,
    method: HttpMethod,
    body: Option<Value>,
    query: Vec<(String, String)>,
    timeout: Duration,
    bearer_token: Option<String>,
}

impl ApiRequest {
    /// Creates a request with no body, query or token.
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            query: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            bearer_token: None,
        }
    }

    /// Shorthand for a `GET`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Shorthand for a `POST` carrying `body`.
    #[must_use]
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    /// Shorthand for a `DELETE`.
    #[must_use]
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Attaches a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Authenticates the request with a bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Target URL without the query string.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP verb.
    #[must_use]
    pub const fn method(&self) -> HttpMethod {
        self.method
    }

    /// JSON body, if any.
    #[must_use]
    pub const fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Query parameters in insertion order.
    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bearer token, if any.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

/// Issues requests against the daemon's control plane.
pub trait ControlPlane: Send + Sync {
    /// Performs `request` and returns the decoded JSON response.
    ///
    /// An empty or `204` response decodes to an empty object.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Security`] when the URL is not HTTP, before any I/O.
    /// - [`AgentError::Http`] for non-2xx responses.
    /// - [`AgentError::Transport`] for timeouts and connection failures.
    fn request(&self, request: &ApiRequest) -> Result<Value, AgentError>;
}

/// [`ControlPlane`] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
}

impl HttpControlPlane {
    /// Builds the underlying HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Transport`] when the client cannot be
    /// initialised, for example when no TLS backend is available.
    pub fn new() -> Result<Self, AgentError> {
        let client = Client::builder()
            .build()
            .map_err(|error| transport_error(&error))?;
        Ok(Self { client })
    }

    fn build(&self, request: &ApiRequest) -> Result<(Url, RequestBuilder), AgentError> {
        let mut url = Url::parse(request.url()).map_err(|error| AgentError::Transport {
            reason: format!("invalid URL '{}': {error}", request.url()),
        })?;
        if !request.query().is_empty() {
            url.query_pairs_mut().extend_pairs(request.query());
        }

        let mut builder = match request.method() {
            HttpMethod::Get => self.client.get(url.clone()),
            HttpMethod::Post => self.client.post(url.clone()),
            HttpMethod::Delete => self.client.delete(url.clone()),
        }
        .timeout(request.timeout())
        .header(CONTENT_TYPE, "application/json");

        if let Some(token) = request.bearer_token() {
            builder = builder
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .header(API_VERSION_HEADER, API_VERSION);
        }
        if let Some(body) = request.body() {
            let encoded = serde_json::to_vec(body).map_err(|error| {
                AgentError::general(format!("failed to encode request body: {error}"))
            })?;
            builder = builder.body(encoded);
        }
        Ok((url, builder))
    }
}

impl ControlPlane for HttpControlPlane {
    fn request(&self, request: &ApiRequest) -> Result<Value, AgentError> {
        ensure_http(request.url())?;
        let (url, builder) = self.build(request)?;

        debug!(
            target: CONTROL_PLANE_TARGET,
            method = %request.method(),
            url = %url,
            "sending control-plane request"
        );
        let response = builder.send().map_err(|error| transport_error(&error))?;
        decode_response(url.as_str(), response)
    }
}

/// Rejects URLs outside the HTTP allow-list.
///
/// # Errors
///
/// Returns [`AgentError::Security`] naming the URL.
pub fn ensure_http(url: &str) -> Result<(), AgentError> {
    if url.to_ascii_lowercase().starts_with("http") {
        Ok(())
    } else {
        Err(AgentError::Security {
            url: url.to_owned(),
        })
    }
}

fn decode_response(url: &str, response: Response) -> Result<Value, AgentError> {
    let status = response.status();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response.text().map_err(|error| transport_error(&error))?;

    debug!(
        target: CONTROL_PLANE_TARGET,
        url,
        status = status.as_u16(),
        body_bytes = body.len(),
        "received control-plane response"
    );

    if !status.is_success() {
        return Err(AgentError::Http(Box::new(HttpFailure {
            url: url.to_owned(),
            status: status.as_u16(),
            message: status.canonical_reason().map(str::to_owned),
            headers,
            body,
        })));
    }
    if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(&body).map_err(|error| {
        AgentError::general(format!("ngrok client API returned invalid JSON: {error}"))
    })
}

fn transport_error(error: &reqwest::Error) -> AgentError {
    if error.is_timeout() {
        return AgentError::Transport {
            reason: "timed out".to_owned(),
        };
    }
    let mut reason = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        reason = cause.to_string();
        source = cause.source();
    }
    AgentError::Transport { reason }
}
