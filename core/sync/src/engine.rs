//! The engine context: owns the process-wide state and runs syncs.

use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use cloudsave_common::{Error, Result, SyncWinner, TargetId};

use crate::backend::BackendManager;
use crate::config::{BackendConfig, EnginePaths, SyncSettings, ToolCommand};
use crate::filter::{FilterKind, FilterStore};
use crate::guard::SyncGuard;
use crate::logs::LogManager;
use crate::runner::{Invocation, ToolRunner};
use crate::target::SyncTarget;

/// Exit code the tool uses for less serious, non-retryable errors.
const TOOL_PARTIAL_SUCCESS: i32 = 6;

const VERBOSE_FLAG: &str = "-v";

/// Result of one sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Tool exit code; 0 for a skipped sync, -1 when the sync was rejected
    /// or could not run.
    pub exit_code: i32,
    /// Log written by this run, if the tool was started.
    pub log_path: Option<PathBuf>,
}

impl SyncOutcome {
    fn skipped() -> Self {
        Self {
            exit_code: 0,
            log_path: None,
        }
    }

    fn failed() -> Self {
        Self {
            exit_code: -1,
            log_path: None,
        }
    }

    /// Whether the host should treat this run as successful.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 || self.exit_code == TOOL_PARTIAL_SUCCESS
    }
}

/// Owns the concurrency registry, log bookkeeping and registration process.
///
/// One engine exists per process; share it behind an `Arc`.
#[derive(Debug)]
pub struct SyncEngine {
    settings: SyncSettings,
    paths: EnginePaths,
    filters: FilterStore,
    guard: SyncGuard,
    logs: LogManager,
    runner: ToolRunner,
    backend: BackendManager,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        paths: EnginePaths,
        tool: ToolCommand,
        backend_config: BackendConfig,
    ) -> Result<Self> {
        debug!("Tool path: {}", tool.program.display());
        debug!("Tool config path: {}", paths.tool_config.display());

        let backend = BackendManager::new(
            tool.clone(),
            &paths.tool_config,
            &paths.bisync_cache_dir,
            backend_config,
        )?;

        Ok(Self {
            filters: FilterStore::new(&paths.settings_dir, &paths.runtime_dir),
            logs: LogManager::new(&paths.log_dir),
            runner: ToolRunner::new(tool),
            guard: SyncGuard::new(),
            backend,
            settings,
            paths,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    pub fn guard(&self) -> &SyncGuard {
        &self.guard
    }

    pub fn backend(&self) -> &BackendManager {
        &self.backend
    }

    pub fn global_target(&self) -> SyncTarget {
        SyncTarget::global(&self.settings)
    }

    pub fn app_target(&self, app_id: i64) -> Result<SyncTarget> {
        SyncTarget::app(app_id, &self.settings)
    }

    pub fn capture_target(&self, path: impl AsRef<Path>) -> Result<SyncTarget> {
        SyncTarget::capture(path, &self.settings)
    }

    /// Resolve a host-supplied target id.
    pub fn target(&self, id: &TargetId) -> Result<SyncTarget> {
        SyncTarget::from_id(id, &self.settings)
    }

    /// Read a filter file. Not subject to the concurrency guard.
    pub async fn get_filters(&self, kind: FilterKind<'_>) -> Result<Vec<String>> {
        self.filters.read(kind).await
    }

    /// Replace a filter file; takes effect from the next sync.
    pub async fn set_filters(&self, kind: FilterKind<'_>, lines: &[String]) -> Result<()> {
        self.filters.write(kind, lines).await
    }

    /// Targets that have a filter file of their own.
    pub async fn available_targets(&self) -> Result<Vec<TargetId>> {
        self.filters.targets_with_filters().await
    }

    /// Run one sync of `target`.
    ///
    /// Returns the tool's exit code, 0 if a filtered target has no include
    /// rule, and -1 if the target is already syncing or the run could not
    /// be prepared or started. Never fails.
    pub async fn sync(&self, target: &SyncTarget, winner: SyncWinner) -> SyncOutcome {
        self.run_guarded(target, winner, false).await
    }

    /// Force a baseline reconciliation of a bidirectional target.
    pub async fn resync(&self, target: &SyncTarget, winner: SyncWinner) -> SyncOutcome {
        if !target.policy().supports_resync() {
            let e = Error::Unsupported(format!(
                "resync of target {} in {} mode",
                target.id(),
                target.mode()
            ));
            error!("{}", e);
            return SyncOutcome::failed();
        }
        self.run_guarded(target, winner, true).await
    }

    /// Create the destination directory on the backend so the first
    /// bidirectional run has a remote path to reconcile against.
    ///
    /// Returns the tool's exit code.
    pub async fn create_destination(&self) -> Result<i32> {
        let remote = self.settings.remote(&self.settings.destination_directory);
        info!("Creating cloud destination {}", remote);

        let args = Invocation::mkdir(&remote)
            .config(&self.paths.tool_config)
            .extra(&[VERBOSE_FLAG.to_string()])
            .into_args();
        let output = self.runner.run(&args).await?;
        Ok(output.exit_code())
    }

    /// Contents of the most recent tool log for `target`.
    pub async fn last_sync_log(&self, target: &SyncTarget) -> String {
        self.logs.read_last(target.log_key()).await
    }

    /// Release process-wide resources.
    pub async fn shutdown(&self) {
        self.backend.cleanup().await;
    }

    async fn run_guarded(&self, target: &SyncTarget, winner: SyncWinner, resync: bool) -> SyncOutcome {
        let _permit = match self.guard.admit(target.id()) {
            Ok(permit) => permit,
            Err(e) => {
                warn!("{}", e);
                return SyncOutcome::failed();
            }
        };

        match self.execute(target, winner, resync).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Sync for {} failed: {}", target.id(), e);
                SyncOutcome::failed()
            }
        }
    }

    async fn execute(&self, target: &SyncTarget, winner: SyncWinner, resync: bool) -> Result<SyncOutcome> {
        let id = target.id();
        let policy = target.policy();

        if policy.filtered && !self.filters.has_includes(id).await? {
            info!("No include filter for {}, nothing to sync", id);
            return Ok(SyncOutcome::skipped());
        }

        let log_path = self
            .logs
            .allocate(target.log_key(), self.settings.log_retention)
            .await?;

        let mut invocation = Invocation::new(target.mode(), target.source(), target.destination())
            .config(&self.paths.tool_config);

        if policy.filtered {
            let compiled = self.filters.compile(id).await?;
            invocation = invocation.filters(compiled.in_order());
        }

        invocation = invocation
            .fixed()
            .logging(&log_path, self.settings.log_level);

        if target.mode().is_bidirectional() {
            invocation = invocation
                .conflict_resolve(winner)
                .extra(&self.settings.additional_bisync_args);
            if resync {
                invocation = invocation.resync(winner);
            }
        } else {
            debug!("Winner {} ignored in {} mode", winner, target.mode());
        }

        invocation = invocation.extra(&self.settings.additional_sync_args);

        let output = self.runner.run(&invocation.into_args()).await?;
        info!(
            "Sync {} finished with exit code {}",
            log_path.display(),
            output.exit_code()
        );

        Ok(SyncOutcome {
            exit_code: output.exit_code(),
            log_path: Some(log_path),
        })
    }
}
