//! One-shot administrative invocations of the daemon executable.

use serde_json::Value;
use tracing::info;
use warden_installer::DaemonVersion;

use super::{SUPERVISOR_TARGET, Supervisor};
use crate::config::AgentConfig;
use crate::error::AgentError;

const AUTH_TOKEN_SAVED: &str = "Authtoken saved";
const API_KEY_SAVED: &str = "API key saved";

impl Supervisor {
    /// Stores `token` in the daemon's config file.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the command fails or does not
    /// confirm that the token was saved.
    pub fn set_auth_token(&self, config: &AgentConfig, token: &str) -> Result<(), AgentError> {
        let base = match config.daemon_version() {
            DaemonVersion::V2 => vec![
                "authtoken".to_owned(),
                token.to_owned(),
                "--log=stdout".to_owned(),
            ],
            DaemonVersion::V3 => vec![
                "config".to_owned(),
                "add-authtoken".to_owned(),
                token.to_owned(),
                "--log=stdout".to_owned(),
            ],
        };
        let output = self.run_blocking_captured(config.executable_path(), admin_args(config, base))?;
        if !output.contains(AUTH_TOKEN_SAVED) {
            return Err(AgentError::daemon(format!(
                "An error occurred when saving the auth token: {}",
                output.trim()
            )));
        }
        info!(target: SUPERVISOR_TARGET, "ngrok auth token saved");
        Ok(())
    }

    /// Stores `key` in the daemon's config file. Only 3.x agents support
    /// API keys.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::General`] for 2.x agents and
    /// [`AgentError::Daemon`] when the command fails or does not confirm
    /// that the key was saved.
    pub fn set_api_key(&self, config: &AgentConfig, key: &str) -> Result<(), AgentError> {
        if config.daemon_version() == DaemonVersion::V2 {
            return Err(AgentError::general(
                "setting an API key is only supported by ngrok v3",
            ));
        }
        let base = vec![
            "config".to_owned(),
            "add-api-key".to_owned(),
            key.to_owned(),
            "--log=stdout".to_owned(),
        ];
        let output = self.run_blocking_captured(config.executable_path(), admin_args(config, base))?;
        if !output.contains(API_KEY_SAVED) {
            return Err(AgentError::daemon(format!(
                "An error occurred when saving the API key: {}",
                output.trim()
            )));
        }
        info!(target: SUPERVISOR_TARGET, "ngrok API key saved");
        Ok(())
    }

    /// Version reported by `ngrok --version`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the command fails and
    /// [`AgentError::General`] when the output names no version.
    pub fn version(&self, config: &AgentConfig) -> Result<String, AgentError> {
        let output = self.run_blocking_captured(config.executable_path(), ["--version"])?;
        parse_version(&output)
    }

    /// Runs the daemon's self-update and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the update command fails.
    pub fn update(&self, config: &AgentConfig) -> Result<String, AgentError> {
        let base = vec!["update".to_owned(), "--log=stdout".to_owned()];
        self.run_blocking_captured(config.executable_path(), admin_args(config, base))
    }

    /// Runs `ngrok api <args>` and decodes the JSON it prints.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Daemon`] when the command fails and
    /// [`AgentError::General`] when the output holds no valid JSON object.
    pub fn api<I, S>(&self, config: &AgentConfig, args: I) -> Result<Value, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec!["api".to_owned()];
        command.extend(args.into_iter().map(Into::into));
        if let Some(key) = config.api_key() {
            command.push(format!("--api-key={key}"));
        }
        let output =
            self.run_blocking_captured(config.executable_path(), admin_args(config, command))?;
        parse_api_output(&output)
    }
}

fn admin_args(config: &AgentConfig, mut args: Vec<String>) -> Vec<String> {
    if let Some(path) = config.config_path() {
        args.push(format!("--config={}", path.display()));
    }
    args
}

fn parse_version(output: &str) -> Result<String, AgentError> {
    output
        .split_once("version ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(str::to_owned)
        .ok_or_else(|| AgentError::general(format!("unrecognised ngrok version output: {output}")))
}

/// Decodes the JSON document that follows any status text.
fn parse_api_output(output: &str) -> Result<Value, AgentError> {
    let document = output
        .find('{')
        .and_then(|start| output.get(start..))
        .ok_or_else(|| AgentError::general(format!("ngrok api returned no JSON: {}", output.trim())))?;
    serde_json::from_str(document.trim_end())
        .map_err(|error| AgentError::general(format!("ngrok api returned invalid JSON: {error}")))
}
