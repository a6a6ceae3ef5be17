//! The composed entry point: installation, supervision and tunnels.
//!
//! A [`TunnelSession`] owns every piece of mutable state the agent needs:
//! the process registry, the tunnel cache keyed by public URL, the config
//! file store, and the default configuration slot. Independent sessions can
//! coexist in one process without sharing any of it.
//!
//! Every operation takes optional [`AgentConfig`] overrides; `None` selects the
//! session default.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use warden_installer::{BinaryInstaller, CdnInstaller, ConfigMap, ConfigStore};

use crate::config::AgentConfig;
use crate::control_plane::{
    AgentStatus, ApiRequest, CapturedRequest, ControlPlane, HttpControlPlane,
};
use crate::error::AgentError;
use crate::supervisor::{DaemonProcess, Supervisor};
use crate::tunnel::{Tunnel, TunnelRequest, plan_tunnel};

/// Log target for session operations.
const SESSION_TARGET: &str = "warden_agent::session";

/// URI suffix of the plaintext twin 2.x agents open for `http` tunnels.
const PLAINTEXT_VARIANT_SUFFIX: &str = "%20%28http%29";

/// Installs, starts and talks to the daemon on behalf of a caller.
pub struct TunnelSession<C = HttpControlPlane, I = CdnInstaller> {
    supervisor: Supervisor,
    control_plane: C,
    installer: I,
    config_store: Arc<ConfigStore>,
    tunnels: Mutex<HashMap<String, Tunnel>>,
    default_config: RwLock<Arc<AgentConfig>>,
}

impl TunnelSession {
    /// Creates a session with the HTTP control plane and the CDN installer.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Transport`] when the HTTP client cannot be built.
    pub fn new() -> Result<Self, AgentError> {
        Ok(Self::with_parts(HttpControlPlane::new()?, CdnInstaller::new()))
    }
}

impl<C, I> TunnelSession<C, I>
where
    C: ControlPlane,
    I: BinaryInstaller,
{
    /// Creates a session from explicit collaborators.
    #[must_use]
    pub fn with_parts(control_plane: C, installer: I) -> Self {
        let config_store = Arc::new(ConfigStore::new());
        Self {
            supervisor: Supervisor::new(Arc::clone(&config_store)),
            control_plane,
            installer,
            config_store,
            tunnels: Mutex::new(HashMap::new()),
            default_config: RwLock::new(Arc::new(AgentConfig::from_env())),
        }
    }

    /// Configuration used when an operation is given none.
    #[must_use]
    pub fn default_config(&self) -> Arc<AgentConfig> {
        self.default_config
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    /// Replaces the default configuration.
    pub fn set_default_config(&self, config: AgentConfig) {
        *self
            .default_config
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Arc::new(config);
    }

    /// Process registry backing this session.
    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Config file store backing this session.
    #[must_use]
    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    /// Control plane used for tunnel calls.
    #[must_use]
    pub const fn control_plane(&self) -> &C {
        &self.control_plane
    }

    /// Installs the daemon binary and its default config file when either
    /// is missing.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Install`] or [`AgentError::Security`] when the
    /// binary cannot be fetched, and [`AgentError::Configuration`] when the
    /// existing config file fails validation during the merge.
    pub fn install(&self, overrides: Option<&AgentConfig>) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        self.install_with(&config)
    }

    /// Returns the running daemon, installing and starting it if necessary.
    ///
    /// # Errors
    ///
    /// Propagates installation failures and [`Supervisor::get_or_start`]
    /// failures.
    pub fn get_process(
        &self,
        overrides: Option<&AgentConfig>,
    ) -> Result<Arc<DaemonProcess>, AgentError> {
        let config = self.resolve(overrides);
        self.process_for(&config)
    }

    /// Opens a tunnel and caches it by public URL.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Configuration`] for a malformed tunnel definition or
    ///   an incompatible config file.
    /// - [`AgentError::Daemon`] when the daemon cannot be started.
    /// - [`AgentError::Http`] or [`AgentError::Transport`] from the create
    ///   call.
    /// - [`AgentError::General`] when the created tunnel has no public URL.
    pub fn connect(
        &self,
        request: &TunnelRequest,
        overrides: Option<&AgentConfig>,
    ) -> Result<Tunnel, AgentError> {
        let config = self.resolve(overrides);
        self.install_with(&config)?;
        let definitions = self.tunnel_definitions(&config)?;
        let plan = plan_tunnel(request, definitions.as_ref(), config.daemon_version())?;

        let api_url = self.process_for(&config)?.api_url()?;
        info!(
            target: SESSION_TARGET,
            name = %plan.name,
            proto = %plan.proto,
            addr = %plan.addr,
            "opening tunnel"
        );
        let response = self.call(
            &config,
            ApiRequest::post(format!("{api_url}/api/tunnels"), Value::Object(plan.body)),
        )?;
        let mut tunnel = Tunnel::from_response(response, &api_url)?;

        if plan.fetch_plaintext_variant {
            let twin_url = format!("{}{PLAINTEXT_VARIANT_SUFFIX}", tunnel.resource_url());
            debug!(target: SESSION_TARGET, url = %twin_url, "fetching plaintext tunnel");
            let twin = self.call(&config, ApiRequest::get(twin_url))?;
            tunnel = Tunnel::from_response(twin, &api_url)?;
        }

        self.lock_tunnels()
            .insert(tunnel.public_url().to_owned(), tunnel.clone());
        Ok(tunnel)
    }

    /// Fetches every tunnel from the daemon and replaces the cache with them.
    ///
    /// # Errors
    ///
    /// Propagates start-up and control-plane failures, and returns
    /// [`AgentError::General`] when the response has no `tunnels` list.
    pub fn list(&self, overrides: Option<&AgentConfig>) -> Result<Vec<Tunnel>, AgentError> {
        let config = self.resolve(overrides);
        let api_url = self.process_for(&config)?.api_url()?;
        let response = self.call(&config, ApiRequest::get(format!("{api_url}/api/tunnels")))?;
        let Some(Value::Array(entries)) = response.get("tunnels") else {
            return Err(AgentError::general(
                "the ngrok API did not return \"tunnels\" in the response",
            ));
        };
        let tunnels = entries
            .iter()
            .map(|entry| Tunnel::from_response(entry.clone(), &api_url))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cache = self.lock_tunnels();
        cache.clear();
        for tunnel in &tunnels {
            cache.insert(tunnel.public_url().to_owned(), tunnel.clone());
        }
        debug!(target: SESSION_TARGET, count = tunnels.len(), "tunnel cache refreshed");
        Ok(tunnels)
    }

    /// Closes the tunnel with `public_url`.
    ///
    /// Nothing happens when the daemon is not running or the tunnel is
    /// unknown even after a refresh.
    ///
    /// # Errors
    ///
    /// Propagates control-plane failures of the refresh and delete calls.
    pub fn disconnect(
        &self,
        public_url: &str,
        overrides: Option<&AgentConfig>,
    ) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        if !self.supervisor.is_running(config.executable_path()) {
            debug!(target: SESSION_TARGET, public_url, "ngrok is not running, nothing to disconnect");
            return Ok(());
        }

        let cached = self.lock_tunnels().get(public_url).cloned();
        let tunnel = match cached {
            Some(tunnel) => tunnel,
            None => {
                self.list(Some(&config))?;
                let Some(tunnel) = self.lock_tunnels().get(public_url).cloned() else {
                    debug!(target: SESSION_TARGET, public_url, "tunnel already closed");
                    return Ok(());
                };
                tunnel
            }
        };

        // the daemon may have restarted elsewhere since the tunnel was cached
        let api_url = self.process_for(&config)?.api_url()?;
        info!(target: SESSION_TARGET, public_url, api_url = %api_url, "closing tunnel");
        self.call(&config, ApiRequest::delete(tunnel.resource_url_at(&api_url)))?;
        self.lock_tunnels().remove(public_url);
        Ok(())
    }

    /// Kills the daemon for the configured executable and forgets every
    /// cached tunnel.
    ///
    /// # Errors
    ///
    /// Propagates [`Supervisor::kill`] failures; the cache is cleared either
    /// way.
    pub fn kill(&self, overrides: Option<&AgentConfig>) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        let result = self.supervisor.kill(config.executable_path());
        self.lock_tunnels().clear();
        result
    }

    /// Snapshot of the tunnel cache.
    #[must_use]
    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.lock_tunnels().values().cloned().collect()
    }

    /// Re-fetches the metrics of `tunnel` and updates the cached copy.
    ///
    /// # Errors
    ///
    /// See [`Tunnel::refresh_metrics`].
    pub fn refresh_metrics(
        &self,
        tunnel: &mut Tunnel,
        overrides: Option<&AgentConfig>,
    ) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        tunnel.refresh_metrics(&self.control_plane, config.request_timeout())?;
        if let Some(cached) = self.lock_tunnels().get_mut(tunnel.public_url()) {
            cached.clone_from(tunnel);
        }
        Ok(())
    }

    /// Status of the running agent.
    ///
    /// # Errors
    ///
    /// Propagates start-up and control-plane failures.
    pub fn agent_status(&self, overrides: Option<&AgentConfig>) -> Result<AgentStatus, AgentError> {
        let config = self.resolve(overrides);
        let api_url = self.process_for(&config)?.api_url()?;
        let response = self.call(&config, ApiRequest::get(format!("{api_url}/api/status")))?;
        decode(response, "agent status")
    }

    /// Requests captured by the inspection interface, optionally only those
    /// received by `tunnel_name`.
    ///
    /// # Errors
    ///
    /// Propagates start-up and control-plane failures, and returns
    /// [`AgentError::General`] when the response has no `requests` list.
    pub fn captured_requests(
        &self,
        tunnel_name: Option<&str>,
        overrides: Option<&AgentConfig>,
    ) -> Result<Vec<CapturedRequest>, AgentError> {
        let config = self.resolve(overrides);
        let api_url = self.process_for(&config)?.api_url()?;
        let mut request = ApiRequest::get(format!("{api_url}/api/requests/http"));
        if let Some(name) = tunnel_name {
            request = request.with_query("tunnel_name", name);
        }
        let mut response = self.call(&config, request)?;
        let Some(requests) = response.get_mut("requests").map(Value::take) else {
            return Err(AgentError::general(
                "the ngrok API did not return \"requests\" in the response",
            ));
        };
        decode(requests, "captured requests")
    }

    /// A single captured request.
    ///
    /// # Errors
    ///
    /// Propagates start-up and control-plane failures.
    pub fn captured_request(
        &self,
        id: &str,
        overrides: Option<&AgentConfig>,
    ) -> Result<CapturedRequest, AgentError> {
        let config = self.resolve(overrides);
        let api_url = self.process_for(&config)?.api_url()?;
        let response = self.call(
            &config,
            ApiRequest::get(format!("{api_url}/api/requests/http/{id}")),
        )?;
        decode(response, "captured request")
    }

    /// Replays a captured request, optionally through another tunnel.
    ///
    /// # Errors
    ///
    /// Propagates start-up and control-plane failures.
    pub fn replay_request(
        &self,
        id: &str,
        tunnel_name: Option<&str>,
        overrides: Option<&AgentConfig>,
    ) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        let api_url = self.process_for(&config)?.api_url()?;
        let mut body = Map::new();
        body.insert("id".to_owned(), json!(id));
        if let Some(name) = tunnel_name {
            body.insert("tunnel_name".to_owned(), json!(name));
        }
        self.call(
            &config,
            ApiRequest::post(format!("{api_url}/api/requests/http"), Value::Object(body)),
        )?;
        Ok(())
    }

    /// Deletes every captured request.
    ///
    /// # Errors
    ///
    /// Propagates start-up and control-plane failures.
    pub fn delete_captured_requests(&self, overrides: Option<&AgentConfig>) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        let api_url = self.process_for(&config)?.api_url()?;
        self.call(
            &config,
            ApiRequest::delete(format!("{api_url}/api/requests/http")),
        )?;
        Ok(())
    }

    /// Installs the daemon if needed and saves `token` in its config file.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::set_auth_token`].
    pub fn set_auth_token(&self, token: &str, overrides: Option<&AgentConfig>) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        self.install_with(&config)?;
        self.supervisor.set_auth_token(&config, token)
    }

    /// Installs the daemon if needed and saves `key` in its config file.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::set_api_key`].
    pub fn set_api_key(&self, key: &str, overrides: Option<&AgentConfig>) -> Result<(), AgentError> {
        let config = self.resolve(overrides);
        self.install_with(&config)?;
        self.supervisor.set_api_key(&config, key)
    }

    /// Installs the daemon if needed and reports its version.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::version`].
    pub fn version(&self, overrides: Option<&AgentConfig>) -> Result<String, AgentError> {
        let config = self.resolve(overrides);
        self.install_with(&config)?;
        self.supervisor.version(&config)
    }

    /// Installs the daemon if needed and runs its self-update.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::update`].
    pub fn update(&self, overrides: Option<&AgentConfig>) -> Result<String, AgentError> {
        let config = self.resolve(overrides);
        self.install_with(&config)?;
        self.supervisor.update(&config)
    }

    /// Installs the daemon if needed and runs `ngrok api <args>`.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::api`].
    pub fn api<A, S>(&self, args: A, overrides: Option<&AgentConfig>) -> Result<Value, AgentError>
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = self.resolve(overrides);
        self.install_with(&config)?;
        self.supervisor.api(&config, args)
    }

    fn resolve(&self, overrides: Option<&AgentConfig>) -> Arc<AgentConfig> {
        overrides.map_or_else(|| self.default_config(), |explicit| Arc::new(explicit.clone()))
    }

    fn install_with(&self, config: &AgentConfig) -> Result<(), AgentError> {
        let executable = config.executable_path();
        if !executable.exists() {
            info!(
                target: SESSION_TARGET,
                path = %executable.display(),
                version = %config.daemon_version(),
                "installing ngrok"
            );
            self.installer
                .ensure_binary(executable, config.daemon_version())?;
        }

        let config_path = config.resolved_config_path();
        if !config_path.exists() {
            info!(
                target: SESSION_TARGET,
                path = %config_path.display(),
                "installing default ngrok config"
            );
            self.config_store.install_default_config(
                &config_path,
                &ConfigMap::new(),
                config.daemon_version(),
            )?;
        }
        Ok(())
    }

    fn process_for(&self, config: &AgentConfig) -> Result<Arc<DaemonProcess>, AgentError> {
        self.install_with(config)?;
        self.supervisor.get_or_start(config)
    }

    fn tunnel_definitions(&self, config: &AgentConfig) -> Result<Option<ConfigMap>, AgentError> {
        let path = config.resolved_config_path();
        if !path.exists() {
            return Ok(None);
        }
        let parsed = self
            .config_store
            .read_config(&path, true, config.daemon_version())?;
        Ok(parsed.get("tunnels").and_then(Value::as_object).cloned())
    }

    fn call(&self, config: &AgentConfig, request: ApiRequest) -> Result<Value, AgentError> {
        self.control_plane
            .request(&request.with_timeout(config.request_timeout()))
    }

    fn lock_tunnels(&self) -> MutexGuard<'_, HashMap<String, Tunnel>> {
        self.tunnels
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, AgentError> {
    serde_json::from_value(value)
        .map_err(|error| AgentError::general(format!("ngrok returned invalid {what}: {error}")))
}
