//! Common types used throughout the cloud save engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Well-known identifier of the shared, bidirectional target.
pub const GLOBAL_TARGET_ID: &str = "global";

/// Prefix for identifiers derived from a captured file.
const CAPTURE_PREFIX: &str = "capture:";

/// Identity of a sync target.
///
/// Three classes exist: the single global target, one target per
/// application (a positive integer), and single-file capture targets whose
/// identifier is derived from the captured file's full path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

/// Class of a target, recovered from its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Global,
    App(u64),
    Capture,
}

impl TargetId {
    /// The shared global target.
    pub fn global() -> Self {
        Self(GLOBAL_TARGET_ID.to_string())
    }

    /// Per-application target.
    ///
    /// # Errors
    /// - `app_id` is zero
    pub fn app(app_id: u64) -> crate::Result<Self> {
        if app_id == 0 {
            return Err(crate::Error::InvalidTarget(
                "Application id must be a positive integer".to_string(),
            ));
        }
        Ok(Self(app_id.to_string()))
    }

    /// Single-file capture target, keyed by the captured file's full path so
    /// same-named files in different directories stay distinct.
    ///
    /// # Errors
    /// - `path` is empty or has no file name
    pub fn capture(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(crate::Error::InvalidTarget(
                "Capture path cannot be empty".to_string(),
            ));
        }
        if path.file_name().map_or(true, |n| n.is_empty()) {
            return Err(crate::Error::InvalidTarget(format!(
                "Capture path has no file name: {}",
                path.display()
            )));
        }
        Ok(Self(format!("{}{}", CAPTURE_PREFIX, path.display())))
    }

    /// Parse a host-supplied identifier: `global` or a positive integer.
    pub fn parse(id: &str) -> crate::Result<Self> {
        let id = id.trim();
        if id == GLOBAL_TARGET_ID {
            return Ok(Self::global());
        }
        let app_id: u64 = id
            .parse()
            .map_err(|_| crate::Error::InvalidTarget(format!("Invalid target id: {:?}", id)))?;
        Self::app(app_id)
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Class of this target.
    pub fn kind(&self) -> TargetKind {
        if self.0 == GLOBAL_TARGET_ID {
            TargetKind::Global
        } else if let Ok(app_id) = self.0.parse::<u64>() {
            TargetKind::App(app_id)
        } else {
            TargetKind::Capture
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TargetId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// How the external tool moves data between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// One-directional, deletions are not mirrored.
    Copy,
    /// One-directional, destination mirrors source including deletions.
    Sync,
    /// Bidirectional reconciliation with conflict resolution.
    Bisync,
}

impl SyncMode {
    /// Subcommand passed to the external tool.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Copy => "copy",
            SyncMode::Sync => "sync",
            SyncMode::Bisync => "bisync",
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, SyncMode::Bisync)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side whose version survives a conflicting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncWinner {
    /// The device.
    Local,
    /// The remote backend.
    Cloud,
}

impl SyncWinner {
    /// Value understood by the tool's conflict flags (`path1` is the local side).
    pub fn as_flag(&self) -> &'static str {
        match self {
            SyncWinner::Local => "path1",
            SyncWinner::Cloud => "path2",
        }
    }
}

impl FromStr for SyncWinner {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "path1" => Ok(SyncWinner::Local),
            "cloud" | "path2" => Ok(SyncWinner::Cloud),
            other => Err(crate::Error::Config(format!("Unknown winner: {}", other))),
        }
    }
}

impl fmt::Display for SyncWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncWinner::Local => f.write_str("local"),
            SyncWinner::Cloud => f.write_str("cloud"),
        }
    }
}

/// Configured log threshold, named the way the settings file stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Verbosity flag for the external tool, if any.
    pub fn verbosity_flag(&self) -> Option<&'static str> {
        match self {
            LogLevel::Debug => Some("-vv"),
            LogLevel::Info | LogLevel::Warning => Some("-v"),
            LogLevel::Error | LogLevel::Critical => None,
        }
    }

    /// Value for the tool's `--log-format` flag.
    pub fn log_format(&self) -> &'static str {
        match self {
            LogLevel::Debug | LogLevel::Info | LogLevel::Warning => "none",
            LogLevel::Error | LogLevel::Critical => "nolevel",
        }
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(crate::Error::Config(format!("Unknown log level: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_global_id() {
        let id = TargetId::global();
        assert_eq!(id.as_str(), "global");
        assert_eq!(id.kind(), TargetKind::Global);
    }

    #[test]
    fn test_app_id_zero_fails() {
        assert!(matches!(
            TargetId::app(0),
            Err(crate::Error::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_capture_id_from_path() {
        let id = TargetId::capture("/tmp/shot.jpg").unwrap();
        assert_eq!(id.as_str(), "capture:/tmp/shot.jpg");
        assert_eq!(id.kind(), TargetKind::Capture);
    }

    #[test]
    fn test_same_named_captures_are_distinct() {
        let a = TargetId::capture("/home/deck/Pictures/a/shot.jpg").unwrap();
        let b = TargetId::capture("/home/deck/Pictures/b/shot.jpg").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, TargetId::capture("/home/deck/Pictures/a/shot.jpg").unwrap());
    }

    #[test]
    fn test_capture_empty_path_fails() {
        assert!(TargetId::capture("").is_err());
        assert!(TargetId::capture("/").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TargetId::parse("-3").is_err());
        assert!(TargetId::parse("0").is_err());
        assert!(TargetId::parse("abc").is_err());
        assert_eq!(TargetId::parse(" global ").unwrap(), TargetId::global());
    }

    #[test]
    fn test_winner_flags() {
        assert_eq!(SyncWinner::Local.as_flag(), "path1");
        assert_eq!(SyncWinner::Cloud.as_flag(), "path2");
        assert_eq!("CLOUD".parse::<SyncWinner>().unwrap(), SyncWinner::Cloud);
    }

    #[test]
    fn test_log_level_flags() {
        assert_eq!(LogLevel::Debug.verbosity_flag(), Some("-vv"));
        assert_eq!(LogLevel::Warning.verbosity_flag(), Some("-v"));
        assert_eq!(LogLevel::Error.verbosity_flag(), None);
        assert_eq!(LogLevel::Critical.log_format(), "nolevel");
    }

    #[test]
    fn test_log_level_serde() {
        let level: LogLevel = serde_json::from_str("\"WARNING\"").unwrap();
        assert_eq!(level, LogLevel::Warning);
    }

    proptest! {
        #[test]
        fn app_ids_parse_back(app_id in 1u64..u64::MAX) {
            let id = TargetId::app(app_id).unwrap();
            prop_assert_eq!(TargetId::parse(id.as_str()).unwrap(), id.clone());
            prop_assert_eq!(id.kind(), TargetKind::App(app_id));
        }
    }
}
