//! Building and running external tool invocations.

use std::path::Path;
use std::process::Stdio;
use tracing::{error, info};

use cloudsave_common::{Error, LogLevel, Result, SyncMode, SyncWinner};

use crate::config::ToolCommand;

/// Arguments the tool always receives.
const FIXED_ARGS: &[&str] = &["--copy-links", "--transfers", "8", "--checkers", "16"];

/// Argument list for one tool run, assembled in the tool's expected order.
#[derive(Debug, Clone)]
pub struct Invocation {
    args: Vec<String>,
}

impl Invocation {
    /// Start with `{mode} {source} {destination}`.
    pub fn new(mode: SyncMode, source: &str, destination: &str) -> Self {
        Self {
            args: vec![
                mode.as_str().to_string(),
                source.to_string(),
                destination.to_string(),
            ],
        }
    }

    /// `mkdir {remote}`: create a directory on the backend.
    pub fn mkdir(remote: &str) -> Self {
        Self {
            args: vec!["mkdir".to_string(), remote.to_string()],
        }
    }

    /// Point the tool at its config file.
    pub fn config(mut self, path: &Path) -> Self {
        self.args.push("--config".to_string());
        self.args.push(path.display().to_string());
        self
    }

    /// Append `--filter-from` for each file, preserving order.
    pub fn filters<'a>(mut self, files: impl IntoIterator<Item = &'a Path>) -> Self {
        for file in files {
            self.args.push("--filter-from".to_string());
            self.args.push(file.display().to_string());
        }
        self
    }

    pub fn fixed(mut self) -> Self {
        self.args.extend(FIXED_ARGS.iter().map(|a| a.to_string()));
        self
    }

    /// Log file plus format and verbosity for the configured level.
    pub fn logging(mut self, log_file: &Path, level: LogLevel) -> Self {
        self.args.push("--log-file".to_string());
        self.args.push(log_file.display().to_string());
        self.args.push("--log-format".to_string());
        self.args.push(level.log_format().to_string());
        if let Some(flag) = level.verbosity_flag() {
            self.args.push(flag.to_string());
        }
        self
    }

    pub fn conflict_resolve(mut self, winner: SyncWinner) -> Self {
        self.args.push("--conflict-resolve".to_string());
        self.args.push(winner.as_flag().to_string());
        self
    }

    /// Force a baseline reconciliation won by `winner`.
    pub fn resync(mut self, winner: SyncWinner) -> Self {
        self.args.push("--resync-mode".to_string());
        self.args.push(winner.as_flag().to_string());
        self.args.push("--resync".to_string());
        self
    }

    pub fn extra(mut self, args: &[String]) -> Self {
        self.args.extend(args.iter().cloned());
        self
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// What a finished tool run produced.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, `None` if the process died from a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Exit code, with death by signal reported as -1.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }

    fn combined(&self) -> String {
        let mut out = String::new();
        for part in [self.stdout.trim(), self.stderr.trim()] {
            if part.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(part);
        }
        out
    }
}

/// Runs the external tool to completion.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    tool: ToolCommand,
}

impl ToolRunner {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    /// Run with piped output and wait for exit.
    ///
    /// Captured output is logged at error level when present and the run
    /// is logged at info level otherwise. The exit code alone decides
    /// success.
    pub async fn run(&self, args: &[String]) -> Result<ToolOutput> {
        info!("Running command: {}", self.display(args));

        let output = self
            .tool
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Spawn(format!("{}: {}", self.tool.program.display(), e)))?;

        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        let captured = result.combined();
        if captured.is_empty() {
            info!("Tool finished with exit code {}", result.exit_code());
        } else {
            error!(
                "Tool finished with exit code {}, output:\n{}",
                result.exit_code(),
                captured
            );
        }

        Ok(result)
    }

    fn display(&self, args: &[String]) -> String {
        std::iter::once(self.tool.program.display().to_string())
            .chain(self.tool.leading_args.iter().cloned())
            .chain(args.iter().cloned())
            .map(|a| {
                if a.is_empty() || a.contains(char::is_whitespace) {
                    format!("\"{}\"", a)
                } else {
                    a
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
