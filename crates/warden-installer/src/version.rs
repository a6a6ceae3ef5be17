//! Major versions of the daemon that the installer and supervisor understand.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Major version of the `ngrok` agent being managed.
///
/// The version decides which CDN archive is fetched, which default
/// configuration is written, and which spelling the administrative
/// subcommands use.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DaemonVersion {
    /// Legacy agent (`ngrok` 2.x).
    V2,
    /// Current agent (`ngrok` 3.x).
    #[default]
    V3,
}
