//! Downloads and unpacks the `ngrok` agent binary.
//!
//! [`CdnInstaller`] resolves the archive for the host platform, fetches it
//! with a blocking `reqwest` client, and extracts the executable next to the
//! requested path. Transient transport failures (timeouts and refused
//! connections) are retried a bounded number of times; every other failure
//! is reported as [`InstallerError::Install`].

use std::fs;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::{DaemonVersion, InstallerError};

/// Log target for binary installation.
const INSTALL_TARGET: &str = "warden_installer::binary";

/// CDN prefix for 3.x agent archives.
const CDN_V3_URL_PREFIX: &str = "https://bin.equinox.io/c/bNyj1mQVY4c/";

/// Default per-attempt download timeout.
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(6);

/// Pause between download attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Installs the daemon binary at a path.
///
/// The production implementation is [`CdnInstaller`]; tests substitute a
/// double that writes a script instead of touching the network.
pub trait BinaryInstaller: Send + Sync {
    /// Downloads and installs the binary for `version` at `path`, replacing
    /// anything already there.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Install`] when the download or extraction
    /// fails, or when the host platform has no published archive.
    fn ensure_binary(&self, path: &Path, version: DaemonVersion) -> Result<(), InstallerError>;
}

/// Host operating system and architecture, named the way the CDN names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    system: &'static str,
    arch: &'static str,
}

impl Platform {
    /// Creates a platform from CDN system and architecture names.
    #[must_use]
    pub const fn new(system: &'static str, arch: &'static str) -> Self {
        Self { system, arch }
    }

    /// Detects the platform this process runs on.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Install`] for operating systems or
    /// architectures the vendor does not publish.
    pub fn current() -> Result<Self, InstallerError> {
        let system = match std::env::consts::OS {
            "macos" => "darwin",
            "linux" => "linux",
            "freebsd" => "freebsd",
            "windows" => "windows",
            other => {
                return Err(InstallerError::install(format!(
                    "\"{other}\" is not a supported system"
                )));
            }
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "x86" => "386",
            "aarch64" => "arm64",
            "arm" => "arm",
            "s390x" => "s390x",
            "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
            "powerpc64" => "ppc64",
            other => {
                return Err(InstallerError::install(format!(
                    "\"{other}\" is not a supported architecture"
                )));
            }
        };
        Ok(Self { system, arch })
    }

    /// Name of the executable inside the published archive.
    #[must_use]
    pub fn binary_name(&self) -> &'static str {
        if self.system == "windows" {
            "ngrok.exe"
        } else {
            "ngrok"
        }
    }
}

/// Returns the archive URL for `version` on `platform`.
///
/// # Errors
///
/// Returns [`InstallerError::UnsupportedVersion`] for 2.x agents, which are
/// only published as zip archives, and [`InstallerError::Install`] for
/// platform combinations without a tarball.
pub fn download_url(version: DaemonVersion, platform: Platform) -> Result<String, InstallerError> {
    if version == DaemonVersion::V2 {
        return Err(InstallerError::UnsupportedVersion { version });
    }
    let supported = matches!(
        (platform.system, platform.arch),
        ("darwin", "amd64" | "arm64")
            | (
                "linux",
                "386" | "arm" | "amd64" | "arm64" | "s390x" | "ppc64" | "ppc64le"
            )
            | ("freebsd", "386" | "amd64" | "arm")
    );
    if !supported {
        return Err(InstallerError::install(format!(
            "\"{}_{}\" is not a supported platform",
            platform.system, platform.arch
        )));
    }
    Ok(format!(
        "{CDN_V3_URL_PREFIX}ngrok-v3-stable-{}-{}.tgz",
        platform.system, platform.arch
    ))
}

/// Installs the agent from the vendor CDN.
#[derive(Debug, Clone)]
pub struct CdnInstaller {
    timeout: Duration,
    retries: u32,
}

impl Default for CdnInstaller {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            retries: 0,
        }
    }
}

impl CdnInstaller {
    /// Creates an installer with the default timeout and no retries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt download timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how many times a transient download failure is retried.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Fetches `url` into memory, retrying transient transport failures.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Security`] for non-HTTP URLs and
    /// [`InstallerError::Install`] for any other failure.
    pub fn download(&self, url: &str) -> Result<Vec<u8>, InstallerError> {
        if !url.to_ascii_lowercase().starts_with("http") {
            return Err(InstallerError::Security { url: url.to_owned() });
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|error| InstallerError::install(error.to_string()))?;

        let mut attempt = 0;
        loop {
            debug!(target: INSTALL_TARGET, url, attempt, "downloading ngrok");
            match fetch(&client, url) {
                Ok(bytes) => return Ok(bytes),
                Err(FetchFailure::Transient(error)) if attempt < self.retries => {
                    warn!(
                        target: INSTALL_TARGET,
                        url,
                        attempt,
                        error = %error,
                        "ngrok download failed, retrying"
                    );
                    attempt += 1;
                    thread::sleep(RETRY_DELAY);
                }
                Err(FetchFailure::Transient(error) | FetchFailure::Fatal(error)) => {
                    return Err(InstallerError::install(format!(
                        "an error occurred while downloading ngrok from {url}: {error}"
                    )));
                }
            }
        }
    }
}

impl BinaryInstaller for CdnInstaller {
    fn ensure_binary(&self, path: &Path, version: DaemonVersion) -> Result<(), InstallerError> {
        let platform = Platform::current()?;
        let url = download_url(version, platform)?;
        info!(
            target: INSTALL_TARGET,
            path = %path.display(),
            %version,
            "installing ngrok"
        );

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| InstallerError::io(dir, source))?;
        }
        let archive = self.download(&url)?;
        extract_binary(&archive, platform.binary_name(), path)
    }
}

enum FetchFailure {
    Transient(String),
    Fatal(String),
}

fn fetch(client: &reqwest::blocking::Client, url: &str) -> Result<Vec<u8>, FetchFailure> {
    let response = client.get(url).send().map_err(classify)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchFailure::Fatal(format!(
            "download failed, status code: {}",
            status.as_u16()
        )));
    }
    response
        .bytes()
        .map(|bytes| bytes.to_vec())
        .map_err(classify)
}

fn classify(error: reqwest::Error) -> FetchFailure {
    if error.is_timeout() || error.is_connect() {
        FetchFailure::Transient(error.to_string())
    } else {
        FetchFailure::Fatal(error.to_string())
    }
}

/// Unpacks `binary_name` from a gzipped tarball into `target`.
fn extract_binary(archive: &[u8], binary_name: &str, target: &Path) -> Result<(), InstallerError> {
    let mut tarball = tar::Archive::new(GzDecoder::new(archive));
    let entries = tarball
        .entries()
        .map_err(|error| InstallerError::install(format!("invalid archive: {error}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|error| InstallerError::install(format!("invalid archive: {error}")))?;
        let is_binary = entry
            .path()
            .ok()
            .and_then(|path| path.file_name().map(|name| name == binary_name))
            .unwrap_or(false);
        if !is_binary {
            continue;
        }
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|source| InstallerError::io(target, source))?;
        fs::write(target, contents).map_err(|source| InstallerError::io(target, source))?;
        return make_executable(target);
    }

    Err(InstallerError::install(format!(
        "archive does not contain {binary_name}"
    )))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), InstallerError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|source| InstallerError::io(path, source))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), InstallerError> {
    Ok(())
}
