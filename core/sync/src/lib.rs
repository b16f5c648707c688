//! Cloud Save Sync Engine
//!
//! Drives an external synchronization tool as a subprocess to mirror
//! directories between the device and a cloud backend:
//! - Three target classes: global (bidirectional), per-application and
//!   single-file capture
//! - Filter files composed into a signed filter program per run
//! - At most one sync per target at a time
//! - Rotating per-target tool logs
//! - Supervision of the backend registration process

pub mod backend;
pub mod config;
pub mod engine;
pub mod filter;
pub mod guard;
pub mod logs;
pub mod runner;
pub mod target;

// Re-export main types
pub use backend::{BackendManager, BackendState, UrlScan};
pub use config::{BackendConfig, EnginePaths, SyncSettings, ToolCommand};
pub use engine::{SyncEngine, SyncOutcome};
pub use filter::{probe_sync_path, FilterKind, FilterRule, FilterStore, PROBE_FILE_LIMIT};
pub use guard::{SyncGuard, SyncPermit};
pub use logs::{LogManager, NO_LOGS_MESSAGE};
pub use runner::{Invocation, ToolOutput, ToolRunner};
pub use target::{SyncTarget, TargetPolicy};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _settings = SyncSettings::default();
        let _backend = BackendConfig::default();
        let _guard = SyncGuard::new();
        let _target = SyncTarget::global(&_settings);
    }
}
