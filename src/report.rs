//! Read-only run reports and dry-run plans

use crate::store::{self, StoreError};
use crate::{MigrationRun, ObjectKey, ObjectStatus, PhaseState, PhaseStatus, RunId};
use std::path::Path;

/// Object counts per status for one phase
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Observed, not yet attempted
    pub pending: usize,
    /// Create started, outcome not recorded
    pub in_progress: usize,
    /// Exists at the destination
    pub completed: usize,
    /// Failed in the latest invocation
    pub failed: usize,
    /// Deliberately left out
    pub skipped: usize,
}

impl StatusCounts {
    fn of(phase: &PhaseState) -> Self {
        Self {
            pending: phase.count(ObjectStatus::Pending),
            in_progress: phase.count(ObjectStatus::InProgress),
            completed: phase.count(ObjectStatus::Completed),
            failed: phase.count(ObjectStatus::Failed),
            skipped: phase.count(ObjectStatus::Skipped),
        }
    }

    /// Count for one status
    pub fn get(&self, status: ObjectStatus) -> usize {
        match status {
            ObjectStatus::Pending => self.pending,
            ObjectStatus::InProgress => self.in_progress,
            ObjectStatus::Completed => self.completed,
            ObjectStatus::Failed => self.failed,
            ObjectStatus::Skipped => self.skipped,
        }
    }

    /// Total records
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }
}

/// Failed object with enough context to find it in the ledger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedObject {
    /// Phase name
    pub phase: String,
    /// Ledger key
    pub key: ObjectKey,
    /// Last error text
    pub error: String,
    /// Create calls in the latest invocation
    pub attempts: u32,
}

/// Status of one phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseReport {
    /// Phase name
    pub name: String,
    /// Current status
    pub status: PhaseStatus,
    /// Declared dependencies
    pub depends_on: Vec<String>,
    /// Records per status
    pub counts: StatusCounts,
    /// Phase-level failure or block reason
    pub last_error: Option<String>,
}

/// Summary of a run's ledger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Run identifier
    pub run_id: RunId,
    /// Source tenant identifier
    pub source_tenant: String,
    /// Destination tenant identifier
    pub destination_tenant: String,
    /// When the run was initialized (millis since UNIX epoch)
    pub started_at_millis: u64,
    /// Phases in dependency order
    pub phases: Vec<PhaseReport>,
    /// Failed objects, in phase order
    pub failures: Vec<FailedObject>,
    /// Rollback manifest length
    pub created_objects: usize,
    /// The run has been rolled back
    pub rolled_back: bool,
}

impl RunReport {
    /// Summarize a run
    pub fn from_run(run: &MigrationRun) -> Self {
        let ordered = ordered_phases(run);
        let phases = ordered
            .iter()
            .map(|phase| PhaseReport {
                name: phase.name.clone(),
                status: phase.status,
                depends_on: phase.depends_on.clone(),
                counts: StatusCounts::of(phase),
                last_error: phase.last_error.clone(),
            })
            .collect();
        let failures = ordered
            .iter()
            .flat_map(|phase| {
                phase
                    .objects
                    .values()
                    .filter(|r| r.status == ObjectStatus::Failed)
                    .map(|r| FailedObject {
                        phase: phase.name.clone(),
                        key: r.key.clone(),
                        error: r.last_error.clone().unwrap_or_default(),
                        attempts: r.attempts,
                    })
            })
            .collect();

        Self {
            run_id: run.run_id,
            source_tenant: run.source_tenant.clone(),
            destination_tenant: run.destination_tenant.clone(),
            started_at_millis: run.started_at_millis,
            phases,
            failures,
            created_objects: run.rollback.len(),
            rolled_back: run.rolled_back_at_millis.is_some(),
        }
    }

    /// Report for one phase
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Whether every phase reached Completed
    pub fn all_completed(&self) -> bool {
        self.phases.iter().all(|p| p.status == PhaseStatus::Completed)
    }
}

/// Summarize the ledger at `path` without modifying it
pub fn report(path: &Path) -> Result<RunReport, StoreError> {
    store::load(path).map(|run| RunReport::from_run(&run))
}

/// Dependency order when the ledger's graph is sound, name order otherwise
fn ordered_phases(run: &MigrationRun) -> Vec<&PhaseState> {
    let phases: Vec<&PhaseState> = run.phases.values().collect();
    let nodes: Vec<(&str, Vec<&str>)> = phases
        .iter()
        .map(|p| (p.name.as_str(), p.depends_on.iter().map(String::as_str).collect()))
        .collect();
    match crate::graph::execution_order(&nodes) {
        Ok(order) => order.into_iter().map(|i| phases[i]).collect(),
        Err(_) => phases,
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "run {} ({} -> {}){}",
            self.run_id,
            self.source_tenant,
            self.destination_tenant,
            if self.rolled_back { " [rolled back]" } else { "" }
        )?;
        writeln!(
            f,
            "{:<24} {:<12} {:>8} {:>11} {:>9} {:>6} {:>7}",
            "phase", "status", "pending", "in_progress", "completed", "failed", "skipped"
        )?;
        for phase in &self.phases {
            writeln!(
                f,
                "{:<24} {:<12} {:>8} {:>11} {:>9} {:>6} {:>7}",
                phase.name,
                phase.status.as_str(),
                phase.counts.pending,
                phase.counts.in_progress,
                phase.counts.completed,
                phase.counts.failed,
                phase.counts.skipped
            )?;
        }
        for failure in &self.failures {
            writeln!(f, "failed {}/{}: {}", failure.phase, failure.key, failure.error)?;
        }
        write!(f, "{} destination objects created", self.created_objects)
    }
}

/// What a phase would do
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhasePlan {
    /// Phase name
    pub name: String,
    /// Keys that would be created
    pub create: Vec<ObjectKey>,
    /// Keys left alone, with the reason
    pub skip: Vec<(ObjectKey, String)>,
    /// Enumeration failure
    pub error: Option<String>,
}

/// What a run would do, phase by phase in execution order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DryRunPlan {
    /// Per-phase plans
    pub phases: Vec<PhasePlan>,
}

impl DryRunPlan {
    /// Plan for one phase
    pub fn phase(&self, name: &str) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Every phase enumerated without error
    pub fn is_clean(&self) -> bool {
        self.phases.iter().all(|p| p.error.is_none())
    }

    /// Total objects that would be created
    pub fn create_count(&self) -> usize {
        self.phases.iter().map(|p| p.create.len()).sum()
    }
}
