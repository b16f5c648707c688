//! At-most-one-sync-per-target admission control.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use cloudsave_common::{Error, Result, TargetId};

/// Registry of targets with a sync in flight.
///
/// Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct SyncGuard {
    running: Arc<Mutex<HashSet<TargetId>>>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a sync for `id`, or fail if one is already running.
    ///
    /// The returned permit releases the slot when dropped.
    pub fn admit(&self, id: &TargetId) -> Result<SyncPermit> {
        if !self.lock().insert(id.clone()) {
            return Err(Error::AlreadyRunning(id.to_string()));
        }
        debug!("Admitted sync for {}", id);
        Ok(SyncPermit {
            guard: self.clone(),
            id: id.clone(),
        })
    }

    /// Only reachable through `SyncPermit::drop`, so the holder of the
    /// permit is the only one able to free the slot.
    fn release(&self, id: &TargetId) {
        if self.lock().remove(id) {
            debug!("Released sync slot for {}", id);
        }
    }

    pub fn is_running(&self, id: &TargetId) -> bool {
        self.lock().contains(id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<TargetId>> {
        // The set stays consistent even if a holder panicked.
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive ownership of one target's sync slot.
#[derive(Debug)]
pub struct SyncPermit {
    guard: SyncGuard,
    id: TargetId,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.guard.release(&self.id);
    }
}
