//! Best-effort teardown of objects a run created
//!
//! Deletion is not transactional. Failures become warnings and the manager
//! moves on; the manifest itself is never edited. Policy-bearing objects may
//! have had effects while they existed that deletion does not undo.

use crate::observer::MigrationObserver;
use crate::orchestrator::Orchestrator;
use crate::processor::Processor;
use crate::stats::RunStats;
use crate::store::{FileLedger, LedgerStore};
use crate::{DeleteError, ManifestEntry, MigrationError, MigrationRun, StructuralError};
use std::path::Path;
use std::sync::Arc;

/// Deletion that did not succeed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollbackWarning {
    /// Phase the object belongs to
    pub phase: String,
    /// Object that was not deleted
    pub destination_id: String,
    /// Delete failure text
    pub error: String,
}

/// Outcome of a rollback
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Deleted, in deletion order
    pub deleted: Vec<ManifestEntry>,
    /// Already absent at the destination
    pub already_gone: Vec<ManifestEntry>,
    /// Deletions that did not succeed
    pub warnings: Vec<RollbackWarning>,
    /// Deleted objects whose effects may outlive them
    pub caveats: Vec<String>,
}

impl RollbackReport {
    /// No deletion failed
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Tears down a run's manifest using the orchestrator's processors
pub struct RollbackManager {
    /// Phases in reverse dependency order
    phases: Vec<(String, Arc<dyn Processor>)>,
    observer: Arc<dyn MigrationObserver>,
    stats: Arc<RunStats>,
}

impl RollbackManager {
    /// Manager for the phases registered on `orchestrator`
    pub fn new(orchestrator: &Orchestrator) -> Result<Self, StructuralError> {
        let mut phases: Vec<(String, Arc<dyn Processor>)> = orchestrator
            .ordered_phases()?
            .into_iter()
            .map(|p| (p.name.clone(), p.processor.clone()))
            .collect();
        phases.reverse();
        Ok(Self {
            phases,
            observer: orchestrator.observer().clone(),
            stats: orchestrator.run_stats().clone(),
        })
    }

    /// Delete every manifest entry, dependents before their dependencies and
    /// newest first within a phase
    pub async fn rollback(&self, run: &MigrationRun) -> RollbackReport {
        let mut report = RollbackReport::default();
        tracing::info!(run_id = %run.run_id, entries = run.rollback.len(), "Rolling back");

        for (phase, processor) in &self.phases {
            let entries: Vec<&ManifestEntry> = run.rollback.for_phase(phase).collect();
            for entry in entries.into_iter().rev() {
                match processor.delete(&entry.destination_id).await {
                    Ok(()) => {
                        if !processor.deletion_is_complete() {
                            report.caveats.push(format!(
                                "{} {} deleted; effects applied while it existed are not reverted",
                                processor.object_type(),
                                entry.destination_id
                            ));
                        }
                        RunStats::bump(&self.stats.rollback_deleted);
                        report.deleted.push(entry.clone());
                    }
                    Err(DeleteError::NotFound(_)) => {
                        tracing::debug!(phase = %phase, destination_id = %entry.destination_id, "Already gone");
                        report.already_gone.push(entry.clone());
                    }
                    Err(e) => self.warn(&mut report, phase, &entry.destination_id, e.to_string()),
                }
            }
        }

        for entry in run.rollback.entries() {
            if !self.phases.iter().any(|(name, _)| name == &entry.phase) {
                self.warn(
                    &mut report,
                    &entry.phase,
                    &entry.destination_id,
                    "no processor registered for phase".to_string(),
                );
            }
        }

        tracing::info!(
            deleted = report.deleted.len(),
            already_gone = report.already_gone.len(),
            warnings = report.warnings.len(),
            "Rollback finished"
        );
        report
    }

    /// Roll back the run whose ledger is at `path` and mark it rolled back
    pub async fn rollback_ledger(&self, path: &Path) -> Result<RollbackReport, MigrationError> {
        let ledger = FileLedger::new(path);
        let mut run = ledger.load()?;
        let report = self.rollback(&run).await;
        run.rolled_back_at_millis = Some(crate::now_millis());
        ledger.save(&run)?;
        Ok(report)
    }

    fn warn(&self, report: &mut RollbackReport, phase: &str, destination_id: &str, error: String) {
        RunStats::bump(&self.stats.rollback_warnings);
        self.observer.on_rollback_warning(phase, destination_id, &error);
        report.warnings.push(RollbackWarning {
            phase: phase.to_string(),
            destination_id: destination_id.to_string(),
            error,
        });
    }
}
