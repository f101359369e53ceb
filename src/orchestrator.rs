//! Phase orchestration
//!
//! Phases run one at a time in dependency order. Within a phase, objects are
//! processed one at a time, or fanned out to at most `parallelism` concurrent
//! Creates. The ledger is saved after every object-level transition, and a
//! phase is promoted to Completed only after its records are re-checked.

use crate::observer::{MigrationObserver, TracingObserver};
use crate::processor::{PhaseContext, Processor, SourceObject};
use crate::report::{DryRunPlan, PhasePlan, RunReport};
use crate::stats::{RunStats, RunStatsSnapshot};
use crate::store::{self, FileLedger, LedgerStore, StoreError};
use crate::writer::LedgerWriter;
use crate::{
    CreateError, MigrationError, MigrationRun, ObjectStatus, PhaseStatus, RetryPolicy, RunConfig, RunId,
    StructuralError,
};
use futures::StreamExt;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub(crate) struct RegisteredPhase {
    pub(crate) name: String,
    pub(crate) depends_on: Vec<String>,
    pub(crate) processor: Arc<dyn Processor>,
}

/// Result of a run invocation
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Ledger summary after the invocation
    pub report: RunReport,
    /// Stopped early on a cancellation request
    pub cancelled: bool,
    /// Set for dry runs; no ledger was written
    pub plan: Option<DryRunPlan>,
}

impl RunOutcome {
    /// Run identifier
    pub fn run_id(&self) -> RunId {
        self.report.run_id
    }

    /// Every phase Completed (or, for a dry run, every phase enumerated)
    pub fn is_success(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.is_clean(),
            None => !self.cancelled && self.report.all_completed(),
        }
    }

    /// Process exit status for callers
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

enum PhaseEnd {
    Finished,
    Cancelled,
}

/// Dependency-ordered phase executor
pub struct Orchestrator {
    phases: Vec<RegisteredPhase>,
    observer: Arc<dyn MigrationObserver>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Orchestrator with no phases, logging through `tracing`
    pub fn new() -> Self {
        Self {
            phases: Vec::new(),
            observer: Arc::new(TracingObserver),
            stats: Arc::new(RunStats::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the observer
    pub fn with_observer(mut self, observer: Arc<dyn MigrationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Honor cancellation of `token` at object boundaries
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the run at the next object boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Counters accumulated across invocations
    pub fn stats(&self) -> RunStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn observer(&self) -> &Arc<dyn MigrationObserver> {
        &self.observer
    }

    pub(crate) fn run_stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    /// Register a phase. Ties in dependency order follow registration order.
    pub fn register(
        &mut self,
        name: &str,
        depends_on: &[&str],
        processor: Arc<dyn Processor>,
    ) -> Result<&mut Self, StructuralError> {
        if self.phases.iter().any(|p| p.name == name) {
            return Err(StructuralError::DuplicatePhase(name.to_string()));
        }
        self.phases.push(RegisteredPhase {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            processor,
        });
        Ok(self)
    }

    /// Phase names in execution order
    pub fn execution_order(&self) -> Result<Vec<String>, StructuralError> {
        Ok(self.ordered_phases()?.into_iter().map(|p| p.name.clone()).collect())
    }

    pub(crate) fn ordered_phases(&self) -> Result<Vec<&RegisteredPhase>, StructuralError> {
        let nodes: Vec<(&str, Vec<&str>)> = self
            .phases
            .iter()
            .map(|p| (p.name.as_str(), p.depends_on.iter().map(String::as_str).collect()))
            .collect();
        let order = crate::graph::execution_order(&nodes)?;
        Ok(order.into_iter().map(|i| &self.phases[i]).collect())
    }

    /// Start a new run. Dry runs only plan and write no ledger.
    pub async fn start(&self, config: RunConfig) -> Result<RunOutcome, MigrationError> {
        config.validate()?;
        let order = self.ordered_phases()?;

        let mut run = MigrationRun::new(config.source_tenant, config.destination_tenant, config.options);
        for phase in &order {
            run.ensure_phase(&phase.name, &phase.depends_on);
        }

        if run.options.dry_run {
            let plan = self.plan(&run).await?;
            tracing::info!(run_id = %run.run_id, creates = plan.create_count(), "Dry run planned");
            return Ok(RunOutcome {
                report: RunReport::from_run(&run),
                cancelled: false,
                plan: Some(plan),
            });
        }

        store::initialize(&config.ledger_path, &run)?;
        self.run(run, Arc::new(FileLedger::new(config.ledger_path))).await
    }

    /// Resume the run whose ledger is at `path`
    pub async fn resume(&self, path: &Path) -> Result<RunOutcome, MigrationError> {
        let ledger = FileLedger::new(path);
        let run = ledger.load()?;
        self.run(run, Arc::new(ledger)).await
    }

    /// Execute every eligible phase of `run`, persisting through `store`.
    ///
    /// Structural problems are reported before any phase executes. Object
    /// failures never abort the run; they are recorded in the ledger.
    pub async fn run(&self, mut run: MigrationRun, store: Arc<dyn LedgerStore>) -> Result<RunOutcome, MigrationError> {
        let order = self.ordered_phases()?;
        if run.rolled_back_at_millis.is_some() {
            return Err(StructuralError::RolledBack(run.run_id.to_string()).into());
        }
        if let Some(unknown) = run.phases.keys().find(|name| !order.iter().any(|p| &p.name == *name)) {
            return Err(StructuralError::UnregisteredPhase(unknown.clone()).into());
        }
        run.options.validate()?;

        let resumed = run.phases.values().any(|p| p.status != PhaseStatus::NotStarted);
        for phase in &order {
            run.ensure_phase(&phase.name, &phase.depends_on);
        }
        store.save(&run)?;
        RunStats::bump(&self.stats.ledger_saves);

        let run_id = run.run_id;
        self.observer.on_run_started(run_id, resumed);
        tracing::info!(run_id = %run_id, ledger = %store.location(), phases = order.len(), resumed, "Running phases");

        let writer = Arc::new(LedgerWriter::new(run, store, self.stats.clone()));
        let mut cancelled = false;

        for phase in order {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let (status, waiting_on) = writer
                .read(|run| {
                    let status = run.phase(&phase.name).map(|p| p.status);
                    let waiting: Vec<String> = phase
                        .depends_on
                        .iter()
                        .filter(|dep| run.phase(dep).map(|p| p.status) != Some(PhaseStatus::Completed))
                        .cloned()
                        .collect();
                    (status, waiting)
                })
                .await;

            if status == Some(PhaseStatus::Completed) {
                tracing::debug!(phase = %phase.name, "Phase already completed");
                continue;
            }
            if !waiting_on.is_empty() {
                let reason = format!("waiting on: {}", waiting_on.join(", "));
                writer
                    .update(|run| run.set_phase_status(&phase.name, PhaseStatus::Blocked, Some(reason)))
                    .await?;
                self.observer.on_phase_blocked(&phase.name, &waiting_on);
                continue;
            }

            if let PhaseEnd::Cancelled = self.run_phase(phase, &writer).await? {
                cancelled = true;
                break;
            }
        }

        let run = writer.snapshot().await;
        let report = RunReport::from_run(&run);
        let outcome = RunOutcome {
            report,
            cancelled,
            plan: None,
        };
        self.observer.on_run_finished(run_id, outcome.is_success(), cancelled);
        Ok(outcome)
    }

    async fn run_phase(&self, phase: &RegisteredPhase, writer: &Arc<LedgerWriter>) -> Result<PhaseEnd, StoreError> {
        let name = phase.name.as_str();
        let (context, policy, parallelism, create_timeout) = writer
            .update(|run| {
                run.set_phase_status(name, PhaseStatus::InProgress, None);
                (
                    Arc::new(phase_context(run, phase, false)),
                    run.options.retry_policy(),
                    run.options.parallelism.max(1),
                    run.options.create_timeout(),
                )
            })
            .await?;
        self.observer.on_phase_started(name);

        let slots = Arc::new(Semaphore::new(parallelism));
        let mut tasks: JoinSet<Result<(), StoreError>> = JoinSet::new();
        let mut seen = HashSet::new();
        let mut phase_error: Option<String> = None;
        let mut fatal: Option<StoreError> = None;
        let mut cancelled = false;

        let mut objects = phase.processor.enumerate(&context);
        loop {
            // A free slot means the previous object's save has completed
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            while let Some(done) = tasks.try_join_next() {
                absorb(name, done, &mut fatal);
            }
            if fatal.is_some() {
                break;
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let object = match objects.next().await {
                None => break,
                Some(Ok(object)) => object,
                Some(Err(e)) => {
                    phase_error = Some(e.to_string());
                    break;
                }
            };
            if !seen.insert(object.key.clone()) {
                tracing::warn!(phase = %name, object_key = %object.key, "Duplicate key in enumeration, ignoring");
                continue;
            }

            let worker = ObjectWorker {
                phase: name.to_string(),
                processor: phase.processor.clone(),
                context: context.clone(),
                policy: policy.clone(),
                create_timeout,
                writer: writer.clone(),
                observer: self.observer.clone(),
                stats: self.stats.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(object).await
            });
        }
        drop(objects);

        while let Some(done) = tasks.join_next().await {
            absorb(name, done, &mut fatal);
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        if cancelled {
            tracing::info!(phase = %name, "Cancellation requested, phase left in progress");
            return Ok(PhaseEnd::Cancelled);
        }

        // Re-check every record rather than trusting the processor
        let (status, reason, total) = writer
            .update(|run| {
                let (unresolved, total) = run
                    .phase(name)
                    .map(|p| (p.unresolved().count(), p.objects.len()))
                    .unwrap_or((0, 0));
                let (status, reason) = match (phase_error, unresolved) {
                    (Some(err), _) => (PhaseStatus::Failed, Some(err)),
                    (None, 0) => (PhaseStatus::Completed, None),
                    (None, n) => (PhaseStatus::Failed, Some(format!("{} objects unresolved", n))),
                };
                run.set_phase_status(name, status, reason.clone());
                (status, reason, total)
            })
            .await?;

        match status {
            PhaseStatus::Completed => self.observer.on_phase_completed(name, total),
            _ => self.observer.on_phase_failed(name, reason.as_deref().unwrap_or("unknown")),
        }
        Ok(PhaseEnd::Finished)
    }

    /// Enumerate every phase in order and report what a run would do.
    ///
    /// Contacts the source only; never creates and never writes a ledger.
    pub async fn plan(&self, run: &MigrationRun) -> Result<DryRunPlan, MigrationError> {
        let order = self.ordered_phases()?;
        let mut plan = DryRunPlan::default();

        for phase in order {
            let context = phase_context(run, phase, true);
            let mut entry = PhasePlan {
                name: phase.name.clone(),
                ..PhasePlan::default()
            };
            let mut objects = phase.processor.enumerate(&context);
            while let Some(next) = objects.next().await {
                match next {
                    Ok(object) => {
                        let done = run
                            .record(&phase.name, &object.key)
                            .map(|r| r.status.is_terminal())
                            .unwrap_or(false);
                        if done {
                            entry.skip.push((object.key, "already migrated".to_string()));
                        } else if let Some(reason) = phase.processor.skip_reason(&object) {
                            entry.skip.push((object.key, reason));
                        } else {
                            entry.create.push(object.key);
                        }
                    }
                    Err(e) => {
                        entry.error = Some(e.to_string());
                        break;
                    }
                }
            }
            plan.phases.push(entry);
        }
        Ok(plan)
    }
}

fn phase_context(run: &MigrationRun, phase: &RegisteredPhase, dry_run: bool) -> PhaseContext {
    PhaseContext {
        run_id: run.run_id,
        phase: phase.name.clone(),
        source_tenant: run.source_tenant.clone(),
        destination_tenant: run.destination_tenant.clone(),
        rewrite: run.options.rewrite.clone(),
        mappings: run.completed_mappings(&phase.depends_on),
        dry_run,
    }
}

fn absorb(
    phase: &str,
    done: Result<Result<(), StoreError>, tokio::task::JoinError>,
    fatal: &mut Option<StoreError>,
) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(phase = %phase, error = %e, "Ledger write failed, stopping phase");
            fatal.get_or_insert(e);
        }
        // The record stays InProgress and fails verification
        Err(e) => tracing::error!(phase = %phase, error = %e, "Object worker panicked"),
    }
}

/// Drives one object through its ledger transitions
struct ObjectWorker {
    phase: String,
    processor: Arc<dyn Processor>,
    context: Arc<PhaseContext>,
    policy: RetryPolicy,
    create_timeout: Duration,
    writer: Arc<LedgerWriter>,
    observer: Arc<dyn MigrationObserver>,
    stats: Arc<RunStats>,
}

impl ObjectWorker {
    async fn process(self, object: SourceObject) -> Result<(), StoreError> {
        let phase = self.phase.as_str();
        let key = &object.key;
        RunStats::bump(&self.stats.objects_seen);

        let record = self.writer.observe(phase, key, object.source_id.as_deref()).await?;
        if record.status.is_terminal() {
            RunStats::bump(&self.stats.objects_already_done);
            tracing::trace!(phase = %phase, object_key = %key, "Already migrated");
            return Ok(());
        }

        if let Some(reason) = self.processor.skip_reason(&object) {
            self.writer
                .update(|run| run.mark_skipped(phase, key, reason.clone()))
                .await?;
            RunStats::bump(&self.stats.objects_skipped);
            self.observer.on_object_skipped(phase, key, &reason);
            return Ok(());
        }

        // InProgress on entry means an earlier invocation stopped mid-create
        let interrupted = record.status == ObjectStatus::InProgress;
        let prior_unknown = record.create_outcome_unknown;
        self.writer.update(|run| run.mark_in_progress(phase, key)).await?;

        let operation = format!("{}/{}", phase, key);
        let result = self
            .policy
            .execute(&operation, |attempt| {
                let processor = &self.processor;
                let context = self.context.as_ref();
                let object = &object;
                let limit = self.create_timeout;
                async move {
                    tracing::trace!(phase = %context.phase, object_key = %object.key, attempt, "Create");
                    match tokio::time::timeout(limit, processor.create(context, object)).await {
                        Ok(result) => result,
                        Err(_) => Err(CreateError::transient(format!(
                            "create timed out after {}ms",
                            limit.as_millis()
                        ))),
                    }
                }
            })
            .await;

        match result {
            Ok(done) => {
                self.count_retries(done.attempts);
                self.writer
                    .update(|run| run.mark_completed(phase, key, &done.value, done.attempts, true))
                    .await?;
                RunStats::bump(&self.stats.objects_created);
                self.observer.on_object_completed(phase, key, &done.value, done.attempts);
            }
            Err(failure) if failure.error.is_conflict() => {
                self.count_retries(failure.attempts);
                // Any earlier attempt in this invocation ended transient, so it
                // may have created the object we now conflict with
                let ours = interrupted || prior_unknown || failure.attempts > 1;
                self.adopt_existing(&object, failure.error, failure.attempts, ours)
                    .await?;
            }
            Err(failure) => {
                self.count_retries(failure.attempts);
                let unknown = failure.attempts > 1 || matches!(failure.error, CreateError::RetryExhausted { .. });
                self.fail(key, failure.error.to_string(), failure.attempts, unknown || prior_unknown)
                    .await?;
            }
        }
        Ok(())
    }

    /// Conflict policy: an existing destination object is taken over.
    ///
    /// It joins the rollback manifest only when `ours` is set, meaning this
    /// run sent a Create for it whose outcome is unknown. Otherwise it
    /// predates the run.
    async fn adopt_existing(
        &self,
        object: &SourceObject,
        conflict: CreateError,
        attempts: u32,
        ours: bool,
    ) -> Result<(), StoreError> {
        let phase = self.phase.as_str();
        let key = &object.key;
        match self.processor.find_existing(&self.context, object).await {
            Ok(Some(existing)) => {
                self.writer
                    .update(|run| run.mark_completed(phase, key, &existing, attempts, ours))
                    .await?;
                RunStats::bump(&self.stats.objects_adopted);
                self.observer.on_object_adopted(phase, key, &existing);
                Ok(())
            }
            Ok(None) => {
                self.fail(
                    key,
                    format!("{}; no matching destination object found", conflict),
                    attempts,
                    ours,
                )
                .await
            }
            Err(e) => {
                self.fail(key, format!("{}; lookup failed: {}", conflict, e), attempts, ours)
                    .await
            }
        }
    }

    /// Record a failure; `outcome_unknown` keeps a possibly created object
    /// attributable to this run on a later conflict
    async fn fail(
        &self,
        key: &crate::ObjectKey,
        error: String,
        attempts: u32,
        outcome_unknown: bool,
    ) -> Result<(), StoreError> {
        let phase = self.phase.as_str();
        self.writer
            .update(|run| {
                run.mark_failed(phase, key, error.clone(), attempts);
                if outcome_unknown {
                    run.mark_outcome_unknown(phase, key);
                }
            })
            .await?;
        RunStats::bump(&self.stats.objects_failed);
        self.observer.on_object_failed(phase, key, &error);
        Ok(())
    }

    fn count_retries(&self, attempts: u32) {
        self.stats
            .create_retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedger;
    use crate::testing::{self, ScriptedProcessor};
    use crate::{ObjectKey, ObjectPayload, ProcessorError, RunOptions};

    fn fresh_run(options: RunOptions) -> MigrationRun {
        MigrationRun::new("contoso", "fabrikam", options)
    }

    fn users_and_groups(users: Arc<ScriptedProcessor>, groups: Arc<ScriptedProcessor>) -> Orchestrator {
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("groups", &["users"], groups).unwrap();
        orchestrator.register("users", &[], users).unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_dependencies_complete_before_dependents() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2"]));
        let groups = Arc::new(ScriptedProcessor::groups(&[("g1", &["u1", "u2"])]));
        let orchestrator = users_and_groups(users.clone(), groups.clone());
        assert_eq!(orchestrator.execution_order().unwrap(), vec!["users", "groups"]);

        let ledger = Arc::new(InMemoryLedger::new());
        let outcome = orchestrator.run(fresh_run(RunOptions::default()), ledger).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), 0);
        let resolved = groups.resolved_payloads();
        let ObjectPayload::Group(group) = &resolved[0].1 else {
            panic!("expected a group payload");
        };
        assert_eq!(group.member_ids, vec!["U1", "U2"]);
    }

    #[tokio::test]
    async fn test_failed_phase_blocks_dependents() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2"]));
        users.script("user:u2", [Err(CreateError::validation("upn rejected"))]);
        let groups = Arc::new(ScriptedProcessor::groups(&[("g1", &["u1"])]));
        let orchestrator = users_and_groups(users, groups.clone());

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        let report = &outcome.report;
        assert_eq!(report.phase("users").unwrap().status, PhaseStatus::Failed);
        let blocked = report.phase("groups").unwrap();
        assert_eq!(blocked.status, PhaseStatus::Blocked);
        assert_eq!(blocked.last_error.as_deref(), Some("waiting on: users"));
        assert_eq!(groups.enumerations(), 0);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_phase_runs() {
        let a = Arc::new(ScriptedProcessor::users(&["u1"]));
        let b = Arc::new(ScriptedProcessor::groups(&[]));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("a", &["b"], a.clone()).unwrap();
        orchestrator.register("b", &["a"], b).unwrap();

        let ledger = Arc::new(InMemoryLedger::new());
        let err = orchestrator
            .run(fresh_run(RunOptions::default()), ledger.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::Structural(StructuralError::Cycle(_))));
        assert_eq!(a.enumerations(), 0);
        assert_eq!(ledger.save_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_phases_rejected() {
        let users = Arc::new(ScriptedProcessor::users(&[]));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users.clone()).unwrap();
        assert!(matches!(
            orchestrator.register("users", &[], users.clone()),
            Err(StructuralError::DuplicatePhase(_))
        ));

        orchestrator.register("groups", &["people"], users).unwrap();
        assert!(matches!(
            orchestrator.execution_order(),
            Err(StructuralError::UnknownDependency { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_objects_are_not_recreated() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2"]));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users.clone()).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());

        orchestrator
            .run(fresh_run(RunOptions::default()), ledger.clone())
            .await
            .unwrap();
        let first = ledger.load().unwrap();

        // Phase is Completed, so force it back to exercise per-object skipping
        let mut again = first.clone();
        again.set_phase_status("users", PhaseStatus::InProgress, None);
        orchestrator.run(again, ledger.clone()).await.unwrap();

        assert_eq!(users.create_calls().len(), 2);
        assert_eq!(ledger.load().unwrap().rollback, first.rollback);
        assert_eq!(orchestrator.stats().objects_already_done, 2);
    }

    #[tokio::test]
    async fn test_conflict_adopts_existing_object() {
        let users = Arc::new(ScriptedProcessor::users(&["u1"]));
        users.script("user:u1", [Err(CreateError::conflict("upn taken"))]);
        users.exists_at_destination("user:u1", "X1");
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), ledger.clone())
            .await
            .unwrap();

        assert!(outcome.is_success());
        let run = ledger.load().unwrap();
        let record = run.record("users", &ObjectKey::from("user:u1")).unwrap();
        assert_eq!(record.status, ObjectStatus::Completed);
        assert_eq!(record.destination_id.as_deref(), Some("X1"));
        assert!(run.rollback.is_empty(), "pre-existing object must not be rolled back");
        assert_eq!(orchestrator.stats().objects_adopted, 1);
    }

    #[tokio::test]
    async fn test_conflict_after_interrupted_create_joins_manifest() {
        let users = Arc::new(ScriptedProcessor::users(&["u1"]));
        users.script("user:u1", [Err(CreateError::conflict("upn taken"))]);
        users.exists_at_destination("user:u1", "U1");
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users).unwrap();

        let key = ObjectKey::from("user:u1");
        let mut run = fresh_run(RunOptions::default());
        run.ensure_phase("users", &[]);
        run.observe("users", &key, Some("u1"));
        run.mark_in_progress("users", &key);
        run.set_phase_status("users", PhaseStatus::InProgress, None);

        let ledger = Arc::new(InMemoryLedger::new());
        orchestrator.run(run, ledger.clone()).await.unwrap();

        let run = ledger.load().unwrap();
        assert_eq!(run.rollback.destination_ids(), vec!["U1"]);
    }

    #[tokio::test]
    async fn test_conflict_without_match_fails_object() {
        let users = Arc::new(ScriptedProcessor::users(&["u1"]));
        users.script("user:u1", [Err(CreateError::conflict("upn taken"))]);
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users).unwrap();

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        assert_eq!(outcome.report.failures.len(), 1);
        assert!(outcome.report.failures[0].error.contains("no matching destination object"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_stop_at_retry_budget() {
        let users = Arc::new(ScriptedProcessor::users(&["u1"]));
        users.script("user:u1", (0..5).map(|_| Err(CreateError::transient("throttled"))));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users.clone()).unwrap();

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        assert_eq!(users.create_calls().len(), 3);
        let times = users.create_times();
        assert_eq!(times[1] - times[0], Duration::from_secs(2));
        assert_eq!(times[2] - times[1], Duration::from_secs(4));
        let failure = &outcome.report.failures[0];
        assert_eq!(failure.attempts, 3);
        assert!(failure.error.contains("gave up after 3 attempts"));
        assert_eq!(orchestrator.stats().create_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_timeout_counts_as_transient() {
        let users = Arc::new(ScriptedProcessor::users(&["u1"]));
        users.delay_creates(Duration::from_secs(5));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users.clone()).unwrap();
        let options = RunOptions {
            max_retry: 2,
            create_timeout_millis: 100,
            ..RunOptions::default()
        };

        let outcome = orchestrator
            .run(fresh_run(options), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        assert_eq!(users.create_calls().len(), 2);
        assert!(outcome.report.failures[0].error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_creates_stay_within_limit() {
        let ids: Vec<String> = (1..=8).map(|i| format!("u{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let users = Arc::new(ScriptedProcessor::users(&refs));
        users.delay_creates(Duration::from_millis(50));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users.clone()).unwrap();
        let options = RunOptions {
            parallelism: 3,
            ..RunOptions::default()
        };

        let ledger = Arc::new(InMemoryLedger::new());
        let outcome = orchestrator.run(fresh_run(options), ledger.clone()).await.unwrap();

        assert!(outcome.is_success());
        assert!(users.max_in_flight() <= 3);
        assert!(users.max_in_flight() >= 2);
        let run = ledger.load().unwrap();
        assert_eq!(run.phase("users").unwrap().count(ObjectStatus::Completed), 8);
        assert_eq!(run.rollback.len(), 8);
    }

    #[tokio::test]
    async fn test_enumeration_error_fails_phase_after_partial_progress() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2", "u3"]));
        users.fail_enumeration_after(1, ProcessorError::Enumerate("page 2 unavailable".into()));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users).unwrap();

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        let phase = outcome.report.phase("users").unwrap();
        assert_eq!(phase.status, PhaseStatus::Failed);
        assert_eq!(phase.counts.completed, 1);
        assert!(phase.last_error.as_deref().unwrap().contains("page 2 unavailable"));
    }

    #[tokio::test]
    async fn test_skipped_objects_do_not_block_completion() {
        let users = Arc::new(ScriptedProcessor::users(&["u1"]));
        users.push(crate::SourceObject::new(
            "guest",
            ObjectPayload::User(crate::UserPayload {
                user_principal_name: "bob_example.org#EXT#@contoso.com".into(),
                display_name: "Bob".into(),
                mail: None,
                account_enabled: true,
            }),
        ));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register("users", &[], users.clone()).unwrap();

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.report.phase("users").unwrap().counts.skipped, 1);
        assert_eq!(users.create_calls(), vec![ObjectKey::from("user:u1")]);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_object() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2"]));
        let token = CancellationToken::new();
        let mut orchestrator = Orchestrator::new().with_cancellation(token.clone());
        orchestrator.register("users", &[], users.clone()).unwrap();
        token.cancel();

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), Arc::new(InMemoryLedger::new()))
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code(), 1);
        assert!(users.create_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_create_finishes_object_in_flight() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2"]));
        let token = CancellationToken::new();
        users.cancel_during_create("user:u1", token.clone());
        let mut orchestrator = Orchestrator::new().with_cancellation(token);
        orchestrator.register("users", &[], users.clone()).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());

        let outcome = orchestrator
            .run(fresh_run(RunOptions::default()), ledger.clone())
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(users.create_calls(), vec![ObjectKey::from("user:u1")]);
        let run = ledger.load().unwrap();
        let u1 = run.record("users", &ObjectKey::from("user:u1")).unwrap();
        assert_eq!(u1.status, ObjectStatus::Completed);
        assert_eq!(u1.destination_id.as_deref(), Some("U1"));
        assert!(run.record("users", &ObjectKey::from("user:u2")).is_none());
        assert_eq!(run.phase("users").unwrap().status, PhaseStatus::InProgress);
        assert_eq!(run.rollback.destination_ids(), vec!["U1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_parallel_create_drains_in_flight_objects() {
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2", "u3"]));
        users.delay_creates(Duration::from_millis(50));
        let token = CancellationToken::new();
        users.cancel_during_create("user:u1", token.clone());
        let mut orchestrator = Orchestrator::new().with_cancellation(token);
        orchestrator.register("users", &[], users.clone()).unwrap();
        let options = RunOptions {
            parallelism: 2,
            ..RunOptions::default()
        };
        let ledger = Arc::new(InMemoryLedger::new());

        let outcome = orchestrator.run(fresh_run(options), ledger.clone()).await.unwrap();

        assert!(outcome.cancelled);
        let calls = users.create_calls();
        assert!(calls.contains(&ObjectKey::from("user:u1")));
        assert!(!calls.contains(&ObjectKey::from("user:u3")));
        let run = ledger.load().unwrap();
        // Whatever was already in flight is saved as completed
        for key in &calls {
            assert_eq!(run.record("users", key).unwrap().status, ObjectStatus::Completed);
        }
        assert!(run.record("users", &ObjectKey::from("user:u3")).is_none());
        assert_eq!(run.rollback.len(), calls.len());
    }

    #[tokio::test]
    async fn test_rolled_back_run_cannot_continue() {
        let mut orchestrator = Orchestrator::new();
        orchestrator
            .register("users", &[], Arc::new(ScriptedProcessor::users(&["u1"])))
            .unwrap();
        let mut run = fresh_run(RunOptions::default());
        run.rolled_back_at_millis = Some(1);

        let err = orchestrator.run(run, Arc::new(InMemoryLedger::new())).await.unwrap_err();
        assert!(matches!(err, MigrationError::Structural(StructuralError::RolledBack(_))));
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_ledger() {
        testing::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let users = Arc::new(ScriptedProcessor::users(&["u1", "u2"]));
        let groups = Arc::new(ScriptedProcessor::groups(&[("g1", &["u1"])]));
        let orchestrator = users_and_groups(users.clone(), groups);

        let config = RunConfig::new("contoso", "fabrikam", &path).with_options(RunOptions {
            dry_run: true,
            ..RunOptions::default()
        });
        let outcome = orchestrator.start(config).await.unwrap();

        let plan = outcome.plan.as_ref().unwrap();
        assert_eq!(plan.create_count(), 3);
        assert_eq!(plan.phases[0].name, "users");
        assert!(outcome.is_success());
        assert!(users.create_calls().is_empty());
        assert!(!path.exists());
    }
}
