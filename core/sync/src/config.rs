//! Engine configuration: the settings snapshot, filesystem layout and the
//! external tool's command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use cloudsave_common::{Error, LogLevel, Result};

/// Remote name the backend is registered under in the tool's config file.
pub const REMOTE_NAME: &str = "backend";

/// Default port the tool listens on during backend authorization.
pub const DEFAULT_AUTH_PORT: u16 = 53682;

/// Settings read from the host's configuration store.
///
/// Missing keys fall back to their defaults, so a partially written
/// settings file still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Current log threshold.
    pub log_level: LogLevel,
    /// Local root that global and per-application targets sync from.
    pub sync_root: String,
    /// Remote directory for global and per-application targets.
    pub destination_directory: String,
    /// Extra arguments appended to every invocation.
    pub additional_sync_args: Vec<String>,
    /// Extra arguments appended to bidirectional invocations only.
    pub additional_bisync_args: Vec<String>,
    /// Remote directory for single-file captures.
    pub capture_destination: String,
    /// Per-application targets mirror deletions when set.
    pub strict_sync: bool,
    /// Tool log files kept per target.
    pub log_retention: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            sync_root: "/".to_string(),
            destination_directory: "decky-cloud-save".to_string(),
            additional_sync_args: Vec::new(),
            additional_bisync_args: Vec::new(),
            capture_destination: "deck-libraries/Pictures".to_string(),
            strict_sync: true,
            log_retention: 5,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await?;
        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Persist settings as pretty JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.log_retention == 0 {
            return Err(Error::Config("log_retention must be at least 1".to_string()));
        }
        if self.sync_root.is_empty() {
            return Err(Error::Config("sync_root cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Remote path for `directory` on the registered backend.
    pub fn remote(&self, directory: &str) -> String {
        format!("{}:{}", REMOTE_NAME, directory)
    }
}

/// The external tool's program and its fixed leading arguments.
///
/// Leading arguments let a launcher script or interpreter sit in front of
/// the real binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Add a fixed leading argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// A fresh `tokio` command with the leading arguments applied.
    pub(crate) fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }
}

/// Filesystem locations owned by the engine.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// Persistent filter files live here.
    pub settings_dir: PathBuf,
    /// Compiled filter programs, rewritten on every sync.
    pub runtime_dir: PathBuf,
    /// Per-target tool log directories.
    pub log_dir: PathBuf,
    /// The tool's own config file holding the registered backend.
    pub tool_config: PathBuf,
    /// Where the tool keeps bidirectional state and lock files.
    pub bisync_cache_dir: PathBuf,
}

impl EnginePaths {
    /// Conventional layout under a single base directory.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            settings_dir: base.join("settings"),
            runtime_dir: base.join("runtime"),
            log_dir: base.join("logs"),
            tool_config: base.join("settings").join("rclone.conf"),
            bisync_cache_dir: base.join("cache").join("bisync"),
        }
    }
}

/// Backend registration parameters.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Loopback port the authorization server listens on.
    pub auth_port: u16,
    /// Diagnostic lines scanned for the login URL before giving up.
    pub max_url_lines: usize,
    /// Overall wait for the login URL.
    pub url_timeout: Duration,
    /// Pause after killing a spawn so the OS releases the port.
    pub kill_grace: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            auth_port: DEFAULT_AUTH_PORT,
            max_url_lines: 5,
            url_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = SyncSettings::load(temp.path().join("config.json"))
            .await
            .unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[tokio::test]
    async fn test_partial_file_falls_back_per_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"log_level": "DEBUG", "additional_sync_args": ["--dry-run"]}"#,
        )
        .unwrap();

        let settings = SyncSettings::load(&path).await.unwrap();
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.additional_sync_args, vec!["--dry-run"]);
        assert_eq!(settings.destination_directory, "decky-cloud-save");
        assert_eq!(settings.log_retention, 5);
    }

    #[tokio::test]
    async fn test_zero_retention_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"log_retention": 0}"#).unwrap();
        assert!(matches!(
            SyncSettings::load(&path).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.json");
        let settings = SyncSettings {
            strict_sync: false,
            ..Default::default()
        };
        settings.save(&path).await.unwrap();
        assert_eq!(SyncSettings::load(&path).await.unwrap(), settings);
    }

    #[test]
    fn test_remote_path() {
        let settings = SyncSettings::default();
        assert_eq!(settings.remote("saves"), "backend:saves");
    }
}
