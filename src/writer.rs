//! Single-writer access to the ledger during a run

use crate::stats::RunStats;
use crate::store::{LedgerStore, StoreError};
use crate::{MigrationRun, ObjectKey, ObjectRecord};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Owns the in-memory run while phases execute.
///
/// Every mutation is applied and saved while holding the lock, so saves are
/// serialized even when Creates run concurrently.
pub(crate) struct LedgerWriter {
    run: Mutex<MigrationRun>,
    store: Arc<dyn LedgerStore>,
    stats: Arc<RunStats>,
}

impl LedgerWriter {
    pub(crate) fn new(run: MigrationRun, store: Arc<dyn LedgerStore>, stats: Arc<RunStats>) -> Self {
        Self {
            run: Mutex::new(run),
            store,
            stats,
        }
    }

    /// Apply a mutation and persist it
    pub(crate) async fn update<R>(&self, f: impl FnOnce(&mut MigrationRun) -> R) -> Result<R, StoreError> {
        let mut run = self.run.lock().await;
        let out = f(&mut run);
        self.store.save(&run)?;
        RunStats::bump(&self.stats.ledger_saves);
        Ok(out)
    }

    /// Look up or lazily create a record; persisted only when created
    pub(crate) async fn observe(
        &self,
        phase: &str,
        key: &ObjectKey,
        source_id: Option<&str>,
    ) -> Result<ObjectRecord, StoreError> {
        let mut run = self.run.lock().await;
        let known = run.record(phase, key).is_some();
        let record = run.observe(phase, key, source_id);
        if !known {
            self.store.save(&run)?;
            RunStats::bump(&self.stats.ledger_saves);
        }
        Ok(record)
    }

    /// Read without persisting
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&MigrationRun) -> R) -> R {
        let run = self.run.lock().await;
        f(&run)
    }

    /// Copy of the current run
    pub(crate) async fn snapshot(&self) -> MigrationRun {
        self.run.lock().await.clone()
    }
}
