//! Supervision of the backend registration process.
//!
//! Registering a cloud backend runs the tool in its interactive config mode.
//! The tool starts a loopback web server and prints the login URL on its
//! diagnostic stream; the user completes authorization in a browser and the
//! process exits. At most one registration process exists at a time.

use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cloudsave_common::{Error, Result};

use crate::config::{BackendConfig, ToolCommand, REMOTE_NAME};

/// Lifecycle of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Idle,
    Spawning,
    AwaitingUrl,
    /// Login URL handed out, waiting for the user.
    Ready,
    Failed,
}

/// Outcome of scanning the diagnostic stream for the login URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlScan {
    Found(String),
    /// The line budget ran out without a match.
    NotFound,
    /// The stream ended first.
    StreamClosed,
    TimedOut,
}

/// Owns the single registration process.
#[derive(Debug)]
pub struct BackendManager {
    tool: ToolCommand,
    tool_config: PathBuf,
    bisync_cache_dir: PathBuf,
    config: BackendConfig,
    url_pattern: Regex,
    current: Mutex<Option<Child>>,
    state: StdMutex<BackendState>,
}

impl BackendManager {
    pub fn new(
        tool: ToolCommand,
        tool_config: impl Into<PathBuf>,
        bisync_cache_dir: impl Into<PathBuf>,
        config: BackendConfig,
    ) -> Result<Self> {
        let url_pattern = Regex::new(&format!(
            r"http://127\.0\.0\.1:{}/auth\?state=\S+",
            config.auth_port
        ))
        .map_err(|e| Error::Config(format!("Invalid URL pattern: {}", e)))?;

        Ok(Self {
            tool,
            tool_config: tool_config.into(),
            bisync_cache_dir: bisync_cache_dir.into(),
            config,
            url_pattern,
            current: Mutex::new(None),
            state: StdMutex::new(BackendState::Idle),
        })
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: BackendState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Start registering a backend of `backend_type` and return the login URL.
    ///
    /// A previous registration still running is killed first. An empty
    /// string means the tool never printed a URL; the process is killed and
    /// the caller may retry.
    ///
    /// # Errors
    /// - The auth port is held by another process
    /// - The tool could not be started
    pub async fn spawn(&self, backend_type: &str) -> Result<String> {
        info!("Registering backend of type {}", backend_type);

        let mut current = self.current.lock().await;
        self.kill(&mut current).await;

        if port_in_use(self.config.auth_port).await {
            self.set_state(BackendState::Failed);
            return Err(Error::PortInUse(self.config.auth_port));
        }

        self.set_state(BackendState::Spawning);
        let mut child = match self
            .tool
            .command()
            .arg("--config")
            .arg(&self.tool_config)
            .args(["config", "create", REMOTE_NAME, backend_type])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.set_state(BackendState::Failed);
                return Err(Error::Spawn(format!("{}: {}", self.tool.program.display(), e)));
            }
        };

        let Some(stderr) = child.stderr.take() else {
            self.set_state(BackendState::Failed);
            return Err(Error::Spawn("diagnostic stream was not captured".to_string()));
        };

        self.set_state(BackendState::AwaitingUrl);
        let mut lines = BufReader::new(stderr).lines();
        let scan = scan_for_url(
            &mut lines,
            &self.url_pattern,
            self.config.max_url_lines,
            self.config.url_timeout,
        )
        .await;

        match scan {
            UrlScan::Found(url) => {
                debug!("Login URL: {}", url);
                // Keep the pipe drained so the tool never blocks on a full buffer.
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!("Registration output: {}", line);
                    }
                });
                *current = Some(child);
                self.set_state(BackendState::Ready);
                Ok(url)
            }
            other => {
                warn!("Failed to extract URL from registration process: {:?}", other);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill registration process: {}", e);
                }
                tokio::time::sleep(self.config.kill_grace).await;
                self.set_state(BackendState::Failed);
                Ok(String::new())
            }
        }
    }

    /// Exit code of the tracked registration: `Some(0)` when none is
    /// tracked, `None` while it is still waiting for the user.
    pub async fn probe(&self) -> Result<Option<i32>> {
        let mut current = self.current.lock().await;
        let Some(child) = current.as_mut() else {
            return Ok(Some(0));
        };
        Ok(child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    /// Type of the configured backend, read from the second line of the
    /// tool's config file. Empty if unreadable.
    pub async fn backend_type(&self) -> String {
        match fs::read_to_string(&self.tool_config).await {
            Ok(content) => parse_backend_type(&content).unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read backend type from tool config: {}", e);
                String::new()
            }
        }
    }

    /// Kill any tracked registration. Called on shutdown.
    pub async fn cleanup(&self) {
        let mut current = self.current.lock().await;
        self.kill(&mut current).await;
        self.set_state(BackendState::Idle);
    }

    /// Remove stale bidirectional lock files left by an interrupted run.
    pub async fn delete_lock_files(&self) -> Result<usize> {
        info!("Deleting lock files");
        let mut entries = match fs::read_dir(&self.bisync_cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lck") {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn kill(&self, current: &mut Option<Child>) {
        let Some(mut child) = current.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            warn!("Killing previous registration process");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill registration process: {}", e);
            }
            tokio::time::sleep(self.config.kill_grace).await;
        }
    }
}

/// Read diagnostic lines until one matches `pattern`, at most `max_lines`
/// lines and at most `timeout` overall.
pub async fn scan_for_url<R>(
    lines: &mut Lines<R>,
    pattern: &Regex,
    max_lines: usize,
    timeout: Duration,
) -> UrlScan
where
    R: AsyncBufRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    for _ in 0..max_lines {
        match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Err(_) => return UrlScan::TimedOut,
            Ok(Ok(Some(line))) => {
                debug!("Registration output: {}", line);
                if let Some(m) = pattern.find(&line) {
                    return UrlScan::Found(m.as_str().to_string());
                }
            }
            Ok(Ok(None)) => return UrlScan::StreamClosed,
            Ok(Err(e)) => {
                warn!("Failed to read registration output: {}", e);
                return UrlScan::StreamClosed;
            }
        }
    }
    UrlScan::NotFound
}

fn parse_backend_type(config: &str) -> Option<String> {
    config
        .lines()
        .nth(1)?
        .split_whitespace()
        .last()
        .map(String::from)
}

async fn port_in_use(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pattern(port: u16) -> Regex {
        Regex::new(&format!(r"http://127\.0\.0\.1:{}/auth\?state=\S+", port)).unwrap()
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn manager(temp: &TempDir, script: &str, port: u16) -> BackendManager {
        let script_path = temp.path().join("tool.sh");
        std::fs::write(&script_path, script).unwrap();
        let tool = ToolCommand::new("/bin/sh").with_arg(script_path.display().to_string());
        let config = BackendConfig {
            auth_port: port,
            url_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(10),
            ..Default::default()
        };
        BackendManager::new(
            tool,
            temp.path().join("rclone.conf"),
            temp.path().join("bisync"),
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_scan_finds_url() {
        let input: &[u8] = b"2024/01/01 NOTICE: starting\n\
            NOTICE: go to http://127.0.0.1:53682/auth?state=xyz42 to log in\n";
        let mut lines = BufReader::new(input).lines();
        let scan = scan_for_url(&mut lines, &pattern(53682), 5, Duration::from_secs(1)).await;
        assert_eq!(
            scan,
            UrlScan::Found("http://127.0.0.1:53682/auth?state=xyz42".to_string())
        );
    }

    #[tokio::test]
    async fn test_scan_respects_line_budget() {
        let input: &[u8] = b"a\nb\nc\nhttp://127.0.0.1:53682/auth?state=late\n";
        let mut lines = BufReader::new(input).lines();
        let scan = scan_for_url(&mut lines, &pattern(53682), 3, Duration::from_secs(1)).await;
        assert_eq!(scan, UrlScan::NotFound);
    }

    #[tokio::test]
    async fn test_scan_stream_closed() {
        let input: &[u8] = b"only one line\n";
        let mut lines = BufReader::new(input).lines();
        let scan = scan_for_url(&mut lines, &pattern(53682), 5, Duration::from_secs(1)).await;
        assert_eq!(scan, UrlScan::StreamClosed);
    }

    #[tokio::test]
    async fn test_scan_ignores_other_ports() {
        let input: &[u8] = b"http://127.0.0.1:9999/auth?state=abc\n";
        let mut lines = BufReader::new(input).lines();
        let scan = scan_for_url(&mut lines, &pattern(53682), 5, Duration::from_secs(1)).await;
        assert_eq!(scan, UrlScan::StreamClosed);
    }

    #[test]
    fn test_parse_backend_type() {
        assert_eq!(
            parse_backend_type("[backend]\ntype = drive\nscope = drive\n"),
            Some("drive".to_string())
        );
        assert_eq!(parse_backend_type("[backend]\n"), None);
    }

    #[tokio::test]
    async fn test_backend_type_unreadable_is_empty() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, "exit 0\n", free_port());
        assert_eq!(manager.backend_type().await, "");

        std::fs::write(temp.path().join("rclone.conf"), "[backend]\ntype = onedrive\n").unwrap();
        assert_eq!(manager.backend_type().await, "onedrive");
    }

    #[tokio::test]
    async fn test_probe_without_spawn() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, "exit 0\n", free_port());
        assert_eq!(manager.probe().await.unwrap(), Some(0));
        assert_eq!(manager.state(), BackendState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_in_use_prevents_spawn() {
        let temp = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let marker = temp.path().join("started");
        let manager = manager(&temp, &format!("touch {}\n", marker.display()), port);

        let result = manager.spawn("drive").await;
        assert!(matches!(result, Err(Error::PortInUse(p)) if p == port));
        assert!(!marker.exists());
        assert_eq!(manager.probe().await.unwrap(), Some(0));
        assert_eq!(manager.state(), BackendState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_without_url_returns_empty() {
        let temp = TempDir::new().unwrap();
        let script = "for i in 1 2 3 4 5 6; do echo \"noise $i\" >&2; done\nexec sleep 30\n";
        let manager = manager(&temp, script, free_port());

        let url = manager.spawn("drive").await.unwrap();
        assert_eq!(url, "");
        assert_eq!(manager.probe().await.unwrap(), Some(0));
        assert_eq!(manager.state(), BackendState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_returns_url_and_tracks_process() {
        let temp = TempDir::new().unwrap();
        let port = free_port();
        let script = format!(
            "echo \"args: $*\" >&2\n\
             echo \"NOTICE: http://127.0.0.1:{}/auth?state=s3cr3t\" >&2\n\
             exec sleep 30\n",
            port
        );
        let manager = manager(&temp, &script, port);

        let url = manager.spawn("drive").await.unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{}/auth?state=s3cr3t", port));
        assert_eq!(manager.state(), BackendState::Ready);
        assert_eq!(manager.probe().await.unwrap(), None);

        manager.cleanup().await;
        assert_eq!(manager.probe().await.unwrap(), Some(0));
        assert_eq!(manager.state(), BackendState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_reports_exit_code() {
        let temp = TempDir::new().unwrap();
        let port = free_port();
        let script = format!(
            "echo \"http://127.0.0.1:{}/auth?state=ok\" >&2\nsleep 0.2\nexit 4\n",
            port
        );
        let manager = manager(&temp, &script, port);
        manager.spawn("drive").await.unwrap();

        let mut code = None;
        for _ in 0..50 {
            code = manager.probe().await.unwrap();
            if code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(code, Some(4));
    }

    #[tokio::test]
    async fn test_delete_lock_files() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, "exit 0\n", free_port());
        assert_eq!(manager.delete_lock_files().await.unwrap(), 0);

        let cache = temp.path().join("bisync");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("a.lck"), "").unwrap();
        std::fs::write(cache.join("b.lck"), "").unwrap();
        std::fs::write(cache.join("state.lst"), "").unwrap();

        assert_eq!(manager.delete_lock_files().await.unwrap(), 2);
        assert!(cache.join("state.lst").exists());
    }
}
