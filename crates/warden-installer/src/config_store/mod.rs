//! Cached access to the daemon's YAML configuration file.
//!
//! Several supervisor sessions may point at the same on-disk file, so the
//! store guards its cache and every read/merge/write sequence with a single
//! mutex. Parsed files are kept as JSON maps; the supervisor only inspects a
//! handful of keys and tunnel definitions, never the full schema.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};
use tracing::debug;

use crate::{DaemonVersion, InstallerError};

/// Log target for configuration store operations.
const CONFIG_TARGET: &str = "warden_installer::config";

/// Parsed contents of a daemon configuration file.
pub type ConfigMap = Map<String, Value>;

/// Thread-safe, per-path cache of parsed configuration files.
#[derive(Debug, Default)]
pub struct ConfigStore {
    cache: Mutex<HashMap<PathBuf, ConfigMap>>,
}

impl ConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parsed configuration at `path`.
    ///
    /// With `use_cache` set, a previously parsed copy is returned when one
    /// exists. An empty file yields [`default_config`] for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Io`] when the file cannot be read and
    /// [`InstallerError::Yaml`] when it is not a YAML mapping.
    pub fn read_config(
        &self,
        path: &Path,
        use_cache: bool,
        version: DaemonVersion,
    ) -> Result<ConfigMap, InstallerError> {
        let mut cache = self.lock();
        load_locked(&mut cache, path, use_cache, version)
    }

    /// Drops any cached copy of `path` so the next read hits the disk.
    pub fn invalidate(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Merges `data` and the version defaults into the file at `path`.
    ///
    /// Missing parent directories and the file itself are created first. The
    /// merged result is validated before it is written back, so an
    /// incompatible setting never lands on disk.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Configuration`] when the merged file fails
    /// [`validate_config`], or an I/O or YAML error from reading and writing.
    pub fn install_default_config(
        &self,
        path: &Path,
        data: &ConfigMap,
        version: DaemonVersion,
    ) -> Result<(), InstallerError> {
        let mut cache = self.lock();

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| InstallerError::io(dir, source))?;
        }
        if !path.exists() {
            fs::write(path, "").map_err(|source| InstallerError::io(path, source))?;
        }

        let mut config = load_locked(&mut cache, path, false, version)?;
        for (key, value) in data {
            config.insert(key.clone(), value.clone());
        }
        for (key, value) in default_config(version) {
            config.insert(key, value);
        }
        validate_config(&config)?;

        let yaml = serde_saphyr::to_string(&Value::Object(config.clone())).map_err(|error| {
            InstallerError::Yaml {
                path: path.to_path_buf(),
                message: error.to_string(),
            }
        })?;
        debug!(
            target: CONFIG_TARGET,
            path = %path.display(),
            "installing default ngrok config"
        );
        fs::write(path, yaml).map_err(|source| InstallerError::io(path, source))?;
        cache.insert(path.to_path_buf(), config);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, ConfigMap>> {
        self.cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn load_locked(
    cache: &mut HashMap<PathBuf, ConfigMap>,
    path: &Path,
    use_cache: bool,
    version: DaemonVersion,
) -> Result<ConfigMap, InstallerError> {
    if use_cache {
        if let Some(config) = cache.get(path) {
            return Ok(config.clone());
        }
    }

    let contents = fs::read_to_string(path).map_err(|source| InstallerError::io(path, source))?;
    let config = parse_config(path, &contents, version)?;
    cache.insert(path.to_path_buf(), config.clone());
    Ok(config)
}

fn parse_config(
    path: &Path,
    contents: &str,
    version: DaemonVersion,
) -> Result<ConfigMap, InstallerError> {
    if contents.trim().is_empty() {
        return Ok(default_config(version));
    }

    let parsed: Value = serde_saphyr::from_str(contents).map_err(|error| InstallerError::Yaml {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    match parsed {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(default_config(version)),
        other => Err(InstallerError::Yaml {
            path: path.to_path_buf(),
            message: format!("expected a mapping at the document root, found {other}"),
        }),
    }
}

/// Returns the configuration keys the given daemon version expects by default.
#[must_use]
pub fn default_config(version: DaemonVersion) -> ConfigMap {
    let mut config = ConfigMap::new();
    if version == DaemonVersion::V3 {
        config.insert("version".into(), Value::String("2".into()));
        config.insert("region".into(), Value::String("us".into()));
    }
    config
}

/// Rejects configuration values that would break supervision.
///
/// The supervisor depends on the control-plane web address being enabled and
/// on logs arriving as `key=value` text at `info` or `debug` verbosity.
///
/// # Errors
///
/// Returns [`InstallerError::Configuration`] naming the offending key.
pub fn validate_config(config: &ConfigMap) -> Result<(), InstallerError> {
    if config.get("web_addr") == Some(&Value::Bool(false)) {
        return Err(InstallerError::Configuration {
            message: "\"web_addr\" cannot be false, as the ngrok API is required for supervision"
                .into(),
        });
    }
    if config.get("log_format").and_then(Value::as_str) == Some("json") {
        return Err(InstallerError::Configuration {
            message: "\"log_format\" must be \"term\" or \"logfmt\" so daemon logs can be parsed"
                .into(),
        });
    }
    let log_level = config.get("log_level").map_or(Some("info"), Value::as_str);
    if !matches!(log_level, Some("info" | "debug")) {
        return Err(InstallerError::Configuration {
            message: "\"log_level\" must be \"info\" or \"debug\" so startup events are logged"
                .into(),
        });
    }
    Ok(())
}
