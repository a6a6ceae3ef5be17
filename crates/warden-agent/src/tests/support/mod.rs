//! Doubles shared by the unit and behaviour tests.

pub(crate) mod fake_control_plane;
#[cfg(unix)]
pub(crate) mod fake_daemon;

use std::path::Path;
use std::sync::Mutex;

use mockall::mock;
use serde_json::Value;
use warden_installer::{BinaryInstaller, DaemonVersion, InstallerError};

use crate::control_plane::{ApiRequest, ControlPlane};
use crate::error::AgentError;

mock! {
    pub(crate) Api {}
    impl ControlPlane for Api {
        fn request(&self, request: &ApiRequest) -> Result<Value, AgentError>;
    }
}

/// Installer double that records requested installs and writes `script`
/// at the target path instead of downloading anything.
#[derive(Debug, Default)]
pub(crate) struct StubInstaller {
    script: Option<String>,
    installs: Mutex<Vec<(std::path::PathBuf, DaemonVersion)>>,
}

impl StubInstaller {
    /// An installer that fails every install.
    pub(crate) fn failing() -> Self {
        Self::default()
    }

    /// An installer that writes `script` as the daemon executable.
    pub(crate) fn writing(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            installs: Mutex::default(),
        }
    }

    pub(crate) fn installs(&self) -> Vec<(std::path::PathBuf, DaemonVersion)> {
        self.installs
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl BinaryInstaller for StubInstaller {
    fn ensure_binary(&self, path: &Path, version: DaemonVersion) -> Result<(), InstallerError> {
        self.installs
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push((path.to_path_buf(), version));
        let Some(script) = &self.script else {
            return Err(InstallerError::Install {
                message: "downloads are disabled in tests".to_owned(),
            });
        };
        write_executable(path, script)
    }
}

#[cfg(unix)]
fn write_executable(path: &Path, script: &str) -> Result<(), InstallerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("ngrok");
    std::fs::create_dir_all(dir).map_err(|error| InstallerError::Install {
        message: error.to_string(),
    })?;
    fake_daemon::write_script(dir, name, script)
        .map(drop)
        .map_err(|error| InstallerError::Install {
            message: error.to_string(),
        })
}

#[cfg(not(unix))]
fn write_executable(path: &Path, script: &str) -> Result<(), InstallerError> {
    std::fs::write(path, script).map_err(|error| InstallerError::Install {
        message: error.to_string(),
    })
}
