//! Configuration loading for the `warden` binary.
//!
//! Only the leading configuration flags are handed to `ortho_config`; the
//! remaining tokens belong to `ngrok` and are forwarded untouched.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use warden_agent::AgentConfig;

use crate::error::CliError;
use crate::telemetry::LogFormat;

/// Flags consumed by the configuration loader.
///
/// Keep in sync with the fields of [`CliConfig`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--ngrok-path",
    "--ngrok-config",
    "--log-filter",
    "--log-format",
];

const DEFAULT_LOG_FILTER: &str = "warn";

/// Settings for the `warden` binary, layered from files, `WARDEN_*`
/// environment variables and the leading command-line flags.
#[derive(Debug, Clone, Default, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "WARDEN")]
pub struct CliConfig {
    /// Explicit `ngrok` executable. When unset the managed default location
    /// is used and the binary is installed there on first use.
    pub ngrok_path: Option<PathBuf>,
    /// `ngrok` configuration file created alongside a managed install.
    pub ngrok_config: Option<PathBuf>,
    /// Tracing filter expression, `warn` when unset.
    pub log_filter: Option<String>,
    /// Log output format, `json` or `compact`.
    pub log_format: Option<String>,
}

impl CliConfig {
    /// Filter used when none is configured.
    pub(crate) fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    pub(crate) fn log_format(&self) -> Result<LogFormat, CliError> {
        self.log_format.as_deref().map_or_else(
            || Ok(LogFormat::default()),
            |value| {
                value.parse().map_err(|_| CliError::LogFormat {
                    value: value.to_owned(),
                })
            },
        )
    }

    /// Whether the binary lives at the managed location and may be installed.
    pub(crate) const fn manages_install(&self) -> bool {
        self.ngrok_path.is_none()
    }

    /// Agent settings with credentials from the environment and the paths
    /// chosen here.
    pub(crate) fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::from_env();
        if let Some(path) = &self.ngrok_path {
            config = config.with_executable_path(path);
        }
        if let Some(path) = &self.ngrok_config {
            config = config.with_config_path(path);
        }
        config
    }
}

pub(crate) trait ConfigLoader {
    /// Loads configuration from the leading flags in `args`.
    ///
    /// Configuration flags must precede every `ngrok` token; anything after
    /// the first foreign token is forwarded even if it looks like one of
    /// ours.
    fn load(&self, args: &[OsString]) -> Result<CliConfig, CliError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<CliConfig, CliError> {
        CliConfig::load_from_iter(args.iter().cloned()).map_err(CliError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

fn process_config_flag(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Skip;
    }
    let (flag, has_inline_value) = text
        .split_once('=')
        .map_or((&*text, false), |(flag, _)| (flag, true));
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !has_inline_value,
        }
    } else {
        FlagAction::Skip
    }
}

/// Arguments split into the loader's share and the forwarded tail.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_start: usize,
}

impl ConfigArgumentSplit {
    /// Tokens destined for `ngrok`, without a leading `--` separator.
    pub(crate) fn forwarded<'a>(&self, args: &'a [OsString]) -> &'a [OsString] {
        let rest = args.get(self.command_start..).unwrap_or_default();
        if rest.first().is_some_and(|first| first == "--") {
            rest.get(1..).unwrap_or_default()
        } else {
            rest
        }
    }
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let mut remaining = args.iter();
    let Some(program) = remaining.next() else {
        return ConfigArgumentSplit::default();
    };

    let mut config_arguments = vec![program.clone()];
    let mut pending_value = false;
    for argument in remaining {
        if pending_value {
            pending_value = false;
        } else {
            match process_config_flag(argument) {
                FlagAction::Include { needs_value } => pending_value = needs_value,
                FlagAction::Skip => break,
            }
        }
        config_arguments.push(argument.clone());
    }

    let command_start = config_arguments.len();
    ConfigArgumentSplit {
        config_arguments,
        command_start,
    }
}
