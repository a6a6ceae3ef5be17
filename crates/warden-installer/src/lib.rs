//! Installation helpers for the `ngrok` daemon supervised by `warden`.
//!
//! The crate owns two concerns that sit outside the supervisor proper:
//!
//! - the daemon's YAML configuration file, read through a [`ConfigStore`]
//!   that caches parsed files per path and serialises every
//!   read/merge/write sequence behind one lock;
//! - the daemon binary itself, fetched from the vendor CDN by a
//!   [`CdnInstaller`] and unpacked next to the configured executable path.
//!
//! Both are consumed by `warden-agent` through narrow calls
//! ([`ConfigStore::read_config`], [`validate_config`],
//! [`BinaryInstaller::ensure_binary`]) so tests can swap the binary installer
//! for a double without touching the network.

mod binary;
mod config_store;
mod error;
mod version;

pub use binary::{BinaryInstaller, CdnInstaller, Platform, download_url};
pub use config_store::{ConfigMap, ConfigStore, default_config, validate_config};
pub use error::InstallerError;
pub use version::DaemonVersion;
