//! Run statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-orchestrator statistics
pub struct RunStats {
    pub objects_seen: AtomicU64,
    pub objects_created: AtomicU64,
    pub objects_adopted: AtomicU64,
    pub objects_already_done: AtomicU64,
    pub objects_skipped: AtomicU64,
    pub objects_failed: AtomicU64,
    pub create_retries: AtomicU64,
    pub ledger_saves: AtomicU64,
    pub rollback_deleted: AtomicU64,
    pub rollback_warnings: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            objects_seen: AtomicU64::new(0),
            objects_created: AtomicU64::new(0),
            objects_adopted: AtomicU64::new(0),
            objects_already_done: AtomicU64::new(0),
            objects_skipped: AtomicU64::new(0),
            objects_failed: AtomicU64::new(0),
            create_retries: AtomicU64::new(0),
            ledger_saves: AtomicU64::new(0),
            rollback_deleted: AtomicU64::new(0),
            rollback_warnings: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            objects_seen: self.objects_seen.load(Ordering::Relaxed),
            objects_created: self.objects_created.load(Ordering::Relaxed),
            objects_adopted: self.objects_adopted.load(Ordering::Relaxed),
            objects_already_done: self.objects_already_done.load(Ordering::Relaxed),
            objects_skipped: self.objects_skipped.load(Ordering::Relaxed),
            objects_failed: self.objects_failed.load(Ordering::Relaxed),
            create_retries: self.create_retries.load(Ordering::Relaxed),
            ledger_saves: self.ledger_saves.load(Ordering::Relaxed),
            rollback_deleted: self.rollback_deleted.load(Ordering::Relaxed),
            rollback_warnings: self.rollback_warnings.load(Ordering::Relaxed),
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStatsSnapshot {
    pub objects_seen: u64,
    pub objects_created: u64,
    pub objects_adopted: u64,
    pub objects_already_done: u64,
    pub objects_skipped: u64,
    pub objects_failed: u64,
    pub create_retries: u64,
    pub ledger_saves: u64,
    pub rollback_deleted: u64,
    pub rollback_warnings: u64,
}
