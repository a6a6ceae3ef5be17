//! Parsing of the daemon's `key=value` log lines.
//!
//! The daemon writes one event per line to standard output, for example:
//!
//! ```text
//! t=2024-05-01T10:00:00+0000 lvl=info msg="starting web service" obj=web addr=127.0.0.1:4040
//! ```
//!
//! Tokens are split with shell-word rules so quoted values keep their spaces
//! and embedded `=` characters. Keys the supervisor relies on get typed
//! fields; every other key is preserved in [`LogRecord::extra`].

use std::collections::BTreeMap;

use strum::{Display, EnumString};

/// Severity of a daemon log line.
///
/// The daemon abbreviates several levels on the wire (`eror`, `crit`,
/// `warn`). Parsing is case-insensitive through [`LogLevel::from_wire`] and
/// any unknown spelling maps to [`LogLevel::NotSet`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString, Display)]
pub enum LogLevel {
    /// Unrecognised or absent level.
    #[default]
    #[strum(to_string = "NOTSET")]
    NotSet,
    /// Informational event.
    #[strum(to_string = "INFO")]
    Info,
    /// Something unexpected that the daemon recovered from.
    #[strum(to_string = "WARNING", serialize = "WARN")]
    Warning,
    /// A failure, typically fatal during startup.
    #[strum(to_string = "ERROR", serialize = "ERR", serialize = "EROR")]
    Error,
    /// An unrecoverable failure.
    #[strum(to_string = "CRITICAL", serialize = "CRIT")]
    Critical,
}

impl LogLevel {
    /// Maps a raw `lvl` value onto the closed level set.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        value.to_ascii_uppercase().parse().unwrap_or_default()
    }

    /// Returns `true` for levels that abort daemon startup.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

/// One parsed line of daemon output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    line: String,
    timestamp: Option<String>,
    level: LogLevel,
    message: Option<String>,
    error: Option<String>,
    addr: Option<String>,
    object: Option<String>,
    extra: BTreeMap<String, String>,
}

impl LogRecord {
    /// Parses a single line, returning `None` when it is blank.
    ///
    /// Tokens without `=` are ignored. A line with unbalanced quotes is
    /// split on whitespace instead so a malformed event is still captured.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let tokens = shlex::split(trimmed)
            .unwrap_or_else(|| trimmed.split_whitespace().map(str::to_owned).collect());

        let mut record = Self {
            line: trimmed.to_owned(),
            ..Self::default()
        };
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            record.assign(key, value);
        }
        Some(record)
    }

    fn assign(&mut self, key: &str, value: &str) {
        let owned = value.to_owned();
        match key {
            "" => {}
            "t" => self.timestamp = Some(owned),
            "lvl" => self.level = LogLevel::from_wire(value),
            "msg" => self.message = Some(owned),
            "err" => self.error = Some(owned),
            "addr" => self.addr = Some(owned),
            "obj" => self.object = Some(owned),
            _ => {
                self.extra.insert(key.to_owned(), owned);
            }
        }
    }

    /// The trimmed source line.
    #[must_use]
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Value of the `t` key.
    #[must_use]
    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    /// Normalised value of the `lvl` key.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// Value of the `msg` key.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Value of the `err` key.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Value of the `addr` key.
    #[must_use]
    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    /// Value of the `obj` key.
    #[must_use]
    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    /// Every other `key=value` pair on the line.
    #[must_use]
    pub const fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    /// Looks up any key, typed or not.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "t" => self.timestamp(),
            "msg" => self.message(),
            "err" => self.error(),
            "addr" => self.addr(),
            "obj" => self.object(),
            _ => self.extra.get(key).map(String::as_str),
        }
    }
}
