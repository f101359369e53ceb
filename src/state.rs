//! Ledger data model: run, phases, object records and the rollback manifest
//!
//! All mutation of object records goes through [`MigrationRun`] so the
//! ledger invariants hold in one place:
//!
//! - exactly one [`ObjectRecord`] per (phase, key)
//! - a destination id is visible through [`IdMapping`] iff its record is Completed
//! - the [`RollbackManifest`] only grows

use crate::config::RunOptions;
use crate::{ObjectKey, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ledger document format written by this version
pub const FORMAT_VERSION: u32 = 1;

/// Status of a phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Never attempted
    NotStarted,
    /// Processor running, or interrupted while running
    InProgress,
    /// Every object Completed or Skipped
    Completed,
    /// At least one object unresolved after the processor returned
    Failed,
    /// A dependency was not Completed when the phase came up
    Blocked,
}

impl PhaseStatus {
    /// Label used in reports and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    /// Observed, not yet attempted
    Pending,
    /// Create issued, outcome not yet recorded
    InProgress,
    /// Created (or adopted) at the destination
    Completed,
    /// Last attempt failed
    Failed,
    /// Deliberately not migrated
    Skipped,
}

impl ObjectStatus {
    /// All statuses, in report column order
    pub const ALL: [ObjectStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
    ];

    /// Completed or Skipped - never touched again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Label used in reports and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry for one source object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Stable source key
    pub key: ObjectKey,
    /// Source-side identifier, when the source has one
    pub source_id: Option<String>,
    /// Destination identifier, set once created
    pub destination_id: Option<String>,
    /// Current status
    pub status: ObjectStatus,
    /// Create calls made during the most recent invocation
    pub attempts: u32,
    /// Text of the most recent failure
    pub last_error: Option<String>,
    /// Why the object was skipped
    pub skip_reason: Option<String>,
    /// A Create was sent whose outcome never came back (timeout, lost
    /// response); the object may exist at the destination on our account
    #[serde(default)]
    pub create_outcome_unknown: bool,
}

impl ObjectRecord {
    /// New Pending record
    pub fn new(key: ObjectKey, source_id: Option<String>) -> Self {
        Self {
            key,
            source_id,
            destination_id: None,
            status: ObjectStatus::Pending,
            attempts: 0,
            last_error: None,
            skip_reason: None,
            create_outcome_unknown: false,
        }
    }
}

/// Source-to-destination id index for one phase
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMapping(BTreeMap<String, String>);

impl IdMapping {
    /// Destination id for a source id
    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.0.get(source_id).map(String::as_str)
    }

    /// Number of mapped ids
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate (source, destination) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(s, d)| (s.as_str(), d.as_str()))
    }
}

/// Id mappings of every Completed phase, keyed by phase name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMappings(BTreeMap<String, IdMapping>);

impl IdMappings {
    /// Resolve a source id produced by `phase`
    pub fn resolve(&self, phase: &str, source_id: &str) -> Option<&str> {
        self.0.get(phase).and_then(|m| m.get(source_id))
    }

    /// Mapping for a single phase
    pub fn phase(&self, phase: &str) -> Option<&IdMapping> {
        self.0.get(phase)
    }

    /// Resolve a source id against every phase, first hit in phase name order
    pub fn resolve_any(&self, source_id: &str) -> Option<&str> {
        self.0.values().find_map(|m| m.get(source_id))
    }

    pub(crate) fn insert(&mut self, phase: String, mapping: IdMapping) {
        self.0.insert(phase, mapping);
    }
}

/// Ledger state of one phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    /// Phase name
    pub name: String,
    /// Declared dependencies
    pub depends_on: Vec<String>,
    /// Current status
    pub status: PhaseStatus,
    /// Phase-level failure or block reason
    pub last_error: Option<String>,
    /// Object records keyed by source key
    pub objects: BTreeMap<ObjectKey, ObjectRecord>,
}

impl PhaseState {
    /// New phase that has never run
    pub fn new(name: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            name: name.into(),
            depends_on,
            status: PhaseStatus::NotStarted,
            last_error: None,
            objects: BTreeMap::new(),
        }
    }

    /// Records that are neither Completed nor Skipped
    pub fn unresolved(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.objects.values().filter(|r| !r.status.is_terminal())
    }

    /// Count of records in a given status
    pub fn count(&self, status: ObjectStatus) -> usize {
        self.objects.values().filter(|r| r.status == status).count()
    }

    /// Source-to-destination index over Completed records
    pub fn id_mapping(&self) -> IdMapping {
        IdMapping(
            self.objects
                .values()
                .filter(|r| r.status == ObjectStatus::Completed)
                .filter_map(|r| Some((r.source_id.clone()?, r.destination_id.clone()?)))
                .collect(),
        )
    }
}

/// One destination object created during the run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Phase that created it
    pub phase: String,
    /// Source key it was created for
    pub key: ObjectKey,
    /// Destination identifier
    pub destination_id: String,
}

/// Append-only record of created destination objects
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollbackManifest {
    entries: Vec<ManifestEntry>,
}

impl RollbackManifest {
    /// Append an entry; a repeated (phase, destination id) is ignored
    pub fn append(&mut self, entry: ManifestEntry) -> bool {
        let exists = self
            .entries
            .iter()
            .any(|e| e.phase == entry.phase && e.destination_id == entry.destination_id);
        if exists {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// All entries in creation order
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Entries of one phase in creation order
    pub fn for_phase<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |e| e.phase == phase)
    }

    /// Destination ids in creation order
    pub fn destination_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.destination_id.as_str()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Durable state of one migration run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Ledger document version
    pub format_version: u32,
    /// Run identifier
    pub run_id: RunId,
    /// Source tenant identifier
    pub source_tenant: String,
    /// Destination tenant identifier
    pub destination_tenant: String,
    /// When the run was initialized (millis since UNIX epoch)
    pub started_at_millis: u64,
    /// Options the run was started with
    pub options: RunOptions,
    /// Phase states keyed by name
    pub phases: BTreeMap<String, PhaseState>,
    /// Created destination objects
    pub rollback: RollbackManifest,
    /// Set once the run has been rolled back; such a run cannot resume
    #[serde(default)]
    pub rolled_back_at_millis: Option<u64>,
}

impl MigrationRun {
    /// Fresh run with no phases
    pub fn new(
        source_tenant: impl Into<String>,
        destination_tenant: impl Into<String>,
        options: RunOptions,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            run_id: RunId::new(),
            source_tenant: source_tenant.into(),
            destination_tenant: destination_tenant.into(),
            started_at_millis: crate::now_millis(),
            options,
            phases: BTreeMap::new(),
            rollback: RollbackManifest::default(),
            rolled_back_at_millis: None,
        }
    }

    /// Phase state, if the phase is known to the ledger
    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.get(name)
    }

    /// Ensure a phase exists, refreshing its declared dependencies
    pub fn ensure_phase(&mut self, name: &str, depends_on: &[String]) -> &mut PhaseState {
        let phase = self
            .phases
            .entry(name.to_string())
            .or_insert_with(|| PhaseState::new(name, depends_on.to_vec()));
        phase.depends_on = depends_on.to_vec();
        phase
    }

    /// Set a phase status and its phase-level error
    pub fn set_phase_status(&mut self, name: &str, status: PhaseStatus, error: Option<String>) {
        if let Some(phase) = self.phases.get_mut(name) {
            phase.status = status;
            phase.last_error = error;
        }
    }

    /// Object record, if observed
    pub fn record(&self, phase: &str, key: &ObjectKey) -> Option<&ObjectRecord> {
        self.phases.get(phase).and_then(|p| p.objects.get(key))
    }

    /// Record an observation, creating a Pending record on first sight
    pub fn observe(&mut self, phase: &str, key: &ObjectKey, source_id: Option<&str>) -> ObjectRecord {
        let phase = self
            .phases
            .entry(phase.to_string())
            .or_insert_with(|| PhaseState::new(phase, Vec::new()));
        let record = phase
            .objects
            .entry(key.clone())
            .or_insert_with(|| ObjectRecord::new(key.clone(), source_id.map(str::to_string)));
        if record.source_id.is_none() {
            record.source_id = source_id.map(str::to_string);
        }
        record.clone()
    }

    /// Object is about to be created; attempt counter restarts for this invocation
    pub fn mark_in_progress(&mut self, phase: &str, key: &ObjectKey) {
        if let Some(record) = self.record_mut(phase, key) {
            record.status = ObjectStatus::InProgress;
            record.attempts = 0;
        }
    }

    /// Object exists at the destination.
    ///
    /// Appends to the rollback manifest when `created_by_run` is set.
    pub fn mark_completed(
        &mut self,
        phase: &str,
        key: &ObjectKey,
        destination_id: &str,
        attempts: u32,
        created_by_run: bool,
    ) {
        let Some(record) = self.record_mut(phase, key) else {
            return;
        };
        record.status = ObjectStatus::Completed;
        record.destination_id = Some(destination_id.to_string());
        record.attempts = attempts;
        record.last_error = None;
        record.create_outcome_unknown = false;
        if created_by_run {
            self.rollback.append(ManifestEntry {
                phase: phase.to_string(),
                key: key.clone(),
                destination_id: destination_id.to_string(),
            });
        }
    }

    /// Object could not be created in this invocation
    pub fn mark_failed(&mut self, phase: &str, key: &ObjectKey, error: String, attempts: u32) {
        if let Some(record) = self.record_mut(phase, key) {
            record.status = ObjectStatus::Failed;
            record.attempts = attempts;
            record.last_error = Some(error);
        }
    }

    /// A Create for this object may have taken effect without a response
    pub fn mark_outcome_unknown(&mut self, phase: &str, key: &ObjectKey) {
        if let Some(record) = self.record_mut(phase, key) {
            record.create_outcome_unknown = true;
        }
    }

    /// Object deliberately left out
    pub fn mark_skipped(&mut self, phase: &str, key: &ObjectKey, reason: String) {
        if let Some(record) = self.record_mut(phase, key) {
            record.status = ObjectStatus::Skipped;
            record.skip_reason = Some(reason);
        }
    }

    /// Snapshot of id mappings for the given phases that are Completed
    pub fn completed_mappings<'a>(&self, phases: impl IntoIterator<Item = &'a String>) -> IdMappings {
        let mut mappings = IdMappings::default();
        for name in phases {
            if let Some(phase) = self.phases.get(name) {
                if phase.status == PhaseStatus::Completed {
                    mappings.insert(name.clone(), phase.id_mapping());
                }
            }
        }
        mappings
    }

    /// Whether every phase in the ledger is Completed
    pub fn is_complete(&self) -> bool {
        self.phases.values().all(|p| p.status == PhaseStatus::Completed)
    }

    fn record_mut(&mut self, phase: &str, key: &ObjectKey) -> Option<&mut ObjectRecord> {
        self.phases.get_mut(phase).and_then(|p| p.objects.get_mut(key))
    }
}
