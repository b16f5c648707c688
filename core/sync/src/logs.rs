//! Per-target log files written by the external tool.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, error, warn};

use cloudsave_common::Result;

/// Returned by [`LogManager::read_last`] when nothing has been logged yet.
pub const NO_LOGS_MESSAGE: &str = "No logs available.";

const LOG_PREFIX: &str = "rclone ";
const LOG_SUFFIX: &str = ".log";

/// Allocates timestamped log files and keeps the most recent few.
#[derive(Debug)]
pub struct LogManager {
    root: PathBuf,
    /// Last file allocated per key in this process.
    last: Mutex<HashMap<String, PathBuf>>,
}

impl LogManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding the logs for `key`.
    pub fn dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Create a fresh log file for `key`, keeping at most `retention` files.
    ///
    /// Names have second resolution; two allocations within the same second
    /// share (and truncate) one file.
    pub async fn allocate(&self, key: &str, retention: usize) -> Result<PathBuf> {
        self.allocate_at(key, retention, Local::now()).await
    }

    async fn allocate_at(
        &self,
        key: &str,
        retention: usize,
        now: DateTime<Local>,
    ) -> Result<PathBuf> {
        let dir = self.dir(key);
        fs::create_dir_all(&dir).await?;

        let name = format!(
            "{}{}{}",
            LOG_PREFIX,
            now.format("%Y-%m-%d %H.%M.%S"),
            LOG_SUFFIX
        );
        let path = dir.join(&name);

        // Leave room for the new file.
        let mut existing: Vec<PathBuf> = list_logs(&dir)
            .await?
            .into_iter()
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(name.as_str()))
            .collect();
        existing.sort();
        let keep = retention.saturating_sub(1);
        if existing.len() > keep {
            let excess = existing.len() - keep;
            for old in existing.drain(..excess) {
                match fs::remove_file(&old).await {
                    Ok(()) => debug!("Removed old log {}", old.display()),
                    Err(e) => warn!("Failed to remove old log {}: {}", old.display(), e),
                }
            }
        }

        fs::write(&path, b"").await?;
        self.remember(key, &path);
        Ok(path)
    }

    /// Most recent log path for `key`: the one allocated last in this
    /// process, else the newest file on disk.
    pub async fn last_path(&self, key: &str) -> Option<PathBuf> {
        let tracked = self
            .last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();
        if tracked.is_some() {
            return tracked;
        }

        let logs = list_logs(&self.dir(key)).await.ok()?;
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in logs {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            // Names sort chronologically, which breaks mtime ties.
            let newer = match &newest {
                None => true,
                Some((t, p)) => (modified, &path) > (*t, p),
            };
            if newer {
                newest = Some((modified, path));
            }
        }
        newest.map(|(_, p)| p)
    }

    /// Contents of the most recent log for `key`.
    ///
    /// Never fails: a missing log yields [`NO_LOGS_MESSAGE`] and a read
    /// failure yields a description of the error.
    pub async fn read_last(&self, key: &str) -> String {
        let Some(path) = self.last_path(key).await else {
            return NO_LOGS_MESSAGE.to_string();
        };
        match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                let msg = format!("Error reading log file {}:\n{}", path.display(), e);
                error!("{}", msg);
                msg
            }
        }
    }

    fn remember(&self, key: &str, path: &Path) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), path.to_path_buf());
    }
}

async fn list_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut logs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX) {
            logs.push(entry.path());
        }
    }
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn base_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_retention_keeps_most_recent() {
        let temp = TempDir::new().unwrap();
        let logs = LogManager::new(temp.path());
        let retention = 5;

        let mut allocated = Vec::new();
        for i in 0..=retention {
            let at = base_time() + Duration::seconds(i as i64);
            allocated.push(logs.allocate_at("global", retention, at).await.unwrap());
        }

        let mut remaining = list_logs(&logs.dir("global")).await.unwrap();
        remaining.sort();
        assert_eq!(remaining.len(), retention);
        assert_eq!(remaining, allocated[1..].to_vec());
    }

    #[tokio::test]
    async fn test_same_second_reuses_file() {
        let temp = TempDir::new().unwrap();
        let logs = LogManager::new(temp.path());

        let first = logs.allocate_at("440", 5, base_time()).await.unwrap();
        std::fs::write(&first, "old run").unwrap();
        let second = logs.allocate_at("440", 5, base_time()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "");
        assert_eq!(list_logs(&logs.dir("440")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retention_of_one() {
        let temp = TempDir::new().unwrap();
        let logs = LogManager::new(temp.path());

        logs.allocate_at("k", 1, base_time()).await.unwrap();
        let newest = logs
            .allocate_at("k", 1, base_time() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(list_logs(&logs.dir("k")).await.unwrap(), vec![newest]);
    }

    #[tokio::test]
    async fn test_read_last_without_logs() {
        let temp = TempDir::new().unwrap();
        let logs = LogManager::new(temp.path());
        assert_eq!(logs.read_last("global").await, NO_LOGS_MESSAGE);
    }

    #[tokio::test]
    async fn test_read_last_tracked() {
        let temp = TempDir::new().unwrap();
        let logs = LogManager::new(temp.path());

        let path = logs.allocate("global", 5).await.unwrap();
        std::fs::write(&path, "Transferred: 3 files").unwrap();

        assert_eq!(logs.read_last("global").await, "Transferred: 3 files");
    }

    #[tokio::test]
    async fn test_read_last_falls_back_to_disk() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("440");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rclone 2024-01-01 10.00.00.log"), "older").unwrap();
        std::fs::write(dir.join("rclone 2024-01-02 10.00.00.log"), "newer").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        // A fresh manager has nothing tracked in memory.
        let logs = LogManager::new(temp.path());
        assert_eq!(logs.read_last("440").await, "newer");
    }

    #[tokio::test]
    async fn test_read_error_is_returned_as_text() {
        let temp = TempDir::new().unwrap();
        let logs = LogManager::new(temp.path());

        let path = logs.allocate("global", 5).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let text = logs.read_last("global").await;
        assert!(text.starts_with("Error reading log file"));
    }
}
