//! Test doubles for directory clients, processors and ledgers

use crate::directory::{DirectoryClient, DirectoryObject, ObjectFilter};
use crate::processor::{PhaseContext, Processor, SourceObject};
use crate::store::{LedgerStore, StoreError};
use crate::{
    CreateError, DeleteError, GroupPayload, MigrationRun, ObjectKey, ObjectKind, ObjectPayload, ProcessorError,
    UserPayload,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Install a fmt subscriber honoring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// User payload for `<name>@contoso.com`
pub fn user(name: &str) -> ObjectPayload {
    ObjectPayload::User(UserPayload {
        user_principal_name: format!("{}@contoso.com", name),
        display_name: name.to_string(),
        mail: Some(format!("{}@contoso.com", name)),
        account_enabled: true,
    })
}

/// Group payload with the given member source ids
pub fn group(name: &str, members: &[&str]) -> ObjectPayload {
    ObjectPayload::Group(GroupPayload {
        display_name: name.to_string(),
        mail_nickname: name.to_string(),
        member_ids: members.iter().map(|m| m.to_string()).collect(),
    })
}

#[derive(Default)]
struct DirectoryState {
    objects: BTreeMap<String, DirectoryObject>,
    managers: HashMap<String, String>,
    next_id: u64,
    create_faults: VecDeque<CreateError>,
    delete_faults: HashMap<String, DeleteError>,
    list_fault: Option<ProcessorError>,
    lost_responses: u32,
    create_calls: u64,
    created: Vec<(String, ObjectPayload)>,
}

/// In-memory tenant
pub struct InMemoryDirectory {
    prefix: String,
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    /// Empty tenant; created ids look like `<prefix>-<kind>-<n>`
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            state: Mutex::new(DirectoryState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object with a known id
    pub fn insert(&self, id: &str, payload: ObjectPayload) -> &Self {
        self.state().objects.insert(
            id.to_string(),
            DirectoryObject {
                id: id.to_string(),
                payload,
            },
        );
        self
    }

    /// Seed a user reporting to `manager_id`
    pub fn insert_report(&self, id: &str, payload: ObjectPayload, manager_id: &str) -> &Self {
        self.insert(id, payload);
        self.state().managers.insert(id.to_string(), manager_id.to_string());
        self
    }

    /// Fail upcoming Create calls with these errors, in order
    pub fn fail_next_creates(&self, errors: impl IntoIterator<Item = CreateError>) {
        self.state().create_faults.extend(errors);
    }

    /// Apply the next `n` creates but answer them with a transient error,
    /// like a gateway timing out after the write went through
    pub fn lose_next_create_responses(&self, n: u32) {
        self.state().lost_responses += n;
    }

    /// Fail deletion of one id
    pub fn fail_delete(&self, id: &str, error: DeleteError) {
        self.state().delete_faults.insert(id.to_string(), error);
    }

    /// Fail every listing
    pub fn fail_listing(&self, error: ProcessorError) {
        self.state().list_fault = Some(error);
    }

    /// Objects of one kind, in id order
    pub fn objects_of(&self, kind: ObjectKind) -> Vec<DirectoryObject> {
        self.state()
            .objects
            .values()
            .filter(|o| o.payload.kind() == kind)
            .cloned()
            .collect()
    }

    /// Object by id
    pub fn get(&self, id: &str) -> Option<DirectoryObject> {
        self.state().objects.get(id).cloned()
    }

    /// Total objects
    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create calls received, failed ones included
    pub fn create_calls(&self) -> u64 {
        self.state().create_calls
    }

    /// Successfully created (id, payload) pairs in creation order
    pub fn created(&self) -> Vec<(String, ObjectPayload)> {
        self.state().created.clone()
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn list_objects(
        &self,
        kind: ObjectKind,
        filter: &ObjectFilter,
    ) -> Result<Vec<DirectoryObject>, ProcessorError> {
        let state = self.state();
        if let Some(e) = &state.list_fault {
            return Err(e.clone());
        }
        Ok(state
            .objects
            .values()
            .filter(|o| o.payload.kind() == kind)
            .filter(|o| match filter {
                ObjectFilter::All => true,
                ObjectFilter::DirectReportsOf(manager) => state.managers.get(&o.id) == Some(manager),
            })
            .cloned()
            .collect())
    }

    async fn create_object(&self, kind: ObjectKind, payload: &ObjectPayload) -> Result<String, CreateError> {
        let mut state = self.state();
        state.create_calls += 1;
        if let Some(fault) = state.create_faults.pop_front() {
            return Err(fault);
        }
        let taken = state
            .objects
            .values()
            .any(|o| o.payload.kind() == kind && o.payload.natural_key() == payload.natural_key());
        if taken {
            return Err(CreateError::conflict(format!("{} '{}' already exists", kind, payload.natural_key())));
        }
        state.next_id += 1;
        let id = format!("{}-{}-{}", self.prefix, kind, state.next_id);
        state.objects.insert(
            id.clone(),
            DirectoryObject {
                id: id.clone(),
                payload: payload.clone(),
            },
        );
        state.created.push((id.clone(), payload.clone()));
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(CreateError::transient("gateway timeout"));
        }
        Ok(id)
    }

    async fn delete_object(&self, _kind: ObjectKind, id: &str) -> Result<(), DeleteError> {
        let mut state = self.state();
        if let Some(fault) = state.delete_faults.get(id) {
            return Err(fault.clone());
        }
        match state.objects.remove(id) {
            Some(_) => Ok(()),
            None => Err(DeleteError::NotFound(id.into())),
        }
    }

    async fn find_object(
        &self,
        kind: ObjectKind,
        payload: &ObjectPayload,
    ) -> Result<Option<String>, ProcessorError> {
        Ok(self
            .state()
            .objects
            .values()
            .find(|o| o.payload.kind() == kind && o.payload.natural_key() == payload.natural_key())
            .map(|o| o.id.clone()))
    }
}

/// Processor over a fixed object list with scripted Create outcomes.
///
/// Without a script, Create returns the upper-cased source id (`u1` -> `U1`).
/// References in payloads must resolve through the phase's id mappings.
pub struct ScriptedProcessor {
    label: &'static str,
    objects: Mutex<Vec<SourceObject>>,
    script: Mutex<HashMap<ObjectKey, VecDeque<Result<String, CreateError>>>>,
    existing: Mutex<HashMap<ObjectKey, String>>,
    enumerate_fault: Mutex<Option<(usize, ProcessorError)>>,
    create_delay: Mutex<Option<Duration>>,
    cancel_on: Mutex<Option<(ObjectKey, CancellationToken)>>,
    creates: Mutex<Vec<(ObjectKey, tokio::time::Instant)>>,
    resolved: Mutex<Vec<(ObjectKey, ObjectPayload)>>,
    deleted: Mutex<Vec<String>>,
    enumerations: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedProcessor {
    /// Processor over the given objects
    pub fn new(label: &'static str, objects: Vec<SourceObject>) -> Self {
        Self {
            label,
            objects: Mutex::new(objects),
            script: Mutex::default(),
            existing: Mutex::default(),
            enumerate_fault: Mutex::new(None),
            create_delay: Mutex::new(None),
            cancel_on: Mutex::new(None),
            creates: Mutex::default(),
            resolved: Mutex::default(),
            deleted: Mutex::default(),
            enumerations: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Users with the given source ids
    pub fn users(ids: &[&str]) -> Self {
        Self::new("user", ids.iter().map(|id| SourceObject::new(*id, user(id))).collect())
    }

    /// Groups given as (source id, member source ids)
    pub fn groups(groups: &[(&str, &[&str])]) -> Self {
        Self::new(
            "group",
            groups
                .iter()
                .map(|(id, members)| SourceObject::new(*id, group(id, members)))
                .collect(),
        )
    }

    /// Queue Create outcomes for one key; later calls fall back to the default
    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = Result<String, CreateError>>) {
        lock(&self.script)
            .entry(ObjectKey::from(key))
            .or_default()
            .extend(outcomes);
    }

    /// Destination object `find_existing` reports for a key
    pub fn exists_at_destination(&self, key: &str, destination_id: &str) {
        lock(&self.existing).insert(ObjectKey::from(key), destination_id.to_string());
    }

    /// Fail enumeration after yielding `after` objects
    pub fn fail_enumeration_after(&self, after: usize, error: ProcessorError) {
        *lock(&self.enumerate_fault) = Some((after, error));
    }

    /// Make every Create take this long
    pub fn delay_creates(&self, delay: Duration) {
        *lock(&self.create_delay) = Some(delay);
    }

    /// Cancel `token` as soon as Create is called for `key`
    pub fn cancel_during_create(&self, key: &str, token: CancellationToken) {
        *lock(&self.cancel_on) = Some((ObjectKey::from(key), token));
    }

    /// Add a source object
    pub fn push(&self, object: SourceObject) {
        lock(&self.objects).push(object);
    }

    /// Keys passed to Create, one entry per call
    pub fn create_calls(&self) -> Vec<ObjectKey> {
        lock(&self.creates).iter().map(|(k, _)| k.clone()).collect()
    }

    /// When each Create call started
    pub fn create_times(&self) -> Vec<tokio::time::Instant> {
        lock(&self.creates).iter().map(|(_, t)| *t).collect()
    }

    /// Payloads after reference translation, per successful resolution
    pub fn resolved_payloads(&self) -> Vec<(ObjectKey, ObjectPayload)> {
        lock(&self.resolved).clone()
    }

    /// Ids passed to Delete
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    /// Times enumerate was called
    pub fn enumerations(&self) -> u64 {
        self.enumerations.load(Ordering::Relaxed)
    }

    /// Highest number of concurrent Create calls seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn object_type(&self) -> &str {
        self.label
    }

    fn enumerate<'a>(&'a self, _context: &'a PhaseContext) -> BoxStream<'a, Result<SourceObject, ProcessorError>> {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
        let objects = lock(&self.objects).clone();
        let fault = lock(&self.enumerate_fault).clone();
        let items: Vec<Result<SourceObject, ProcessorError>> = match fault {
            Some((after, error)) => objects
                .into_iter()
                .take(after)
                .map(Ok)
                .chain(std::iter::once(Err(error)))
                .collect(),
            None => objects.into_iter().map(Ok).collect(),
        };
        stream::iter(items).boxed()
    }

    async fn create(&self, context: &PhaseContext, object: &SourceObject) -> Result<String, CreateError> {
        lock(&self.creates).push((object.key.clone(), tokio::time::Instant::now()));
        let cancel_on = lock(&self.cancel_on).clone();
        if let Some((key, token)) = cancel_on {
            if key == object.key {
                token.cancel();
            }
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *lock(&self.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = lock(&self.script).get_mut(&object.key).and_then(|q| q.pop_front());
        if let Some(outcome) = scripted {
            return outcome;
        }

        let payload = object
            .payload
            .rewrite_principals(&context.rewrite)
            .remap(|_, id| context.mappings.resolve_any(id).map(str::to_string))
            .map_err(|e| CreateError::validation(e.to_string()))?;
        lock(&self.resolved).push((object.key.clone(), payload));

        let source_id = object.source_id.as_deref().unwrap_or(object.key.as_str());
        Ok(source_id.to_uppercase())
    }

    async fn delete(&self, destination_id: &str) -> Result<(), DeleteError> {
        lock(&self.deleted).push(destination_id.to_string());
        Ok(())
    }

    async fn find_existing(
        &self,
        _context: &PhaseContext,
        object: &SourceObject,
    ) -> Result<Option<String>, ProcessorError> {
        Ok(lock(&self.existing).get(&object.key).cloned())
    }

    fn skip_reason(&self, object: &SourceObject) -> Option<String> {
        object.payload.skip_reason()
    }
}

/// Ledger that stops persisting after a number of saves, as if the process died
pub struct CrashingLedger {
    inner: Arc<dyn LedgerStore>,
    remaining: AtomicU64,
}

impl CrashingLedger {
    /// Allow `saves` successful saves through to `inner`, then fail
    pub fn new(inner: Arc<dyn LedgerStore>, saves: u64) -> Self {
        Self {
            inner,
            remaining: AtomicU64::new(saves),
        }
    }
}

impl LedgerStore for CrashingLedger {
    fn load(&self) -> Result<MigrationRun, StoreError> {
        self.inner.load()
    }

    fn save(&self, run: &MigrationRun) -> Result<(), StoreError> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StoreError::Io {
                location: self.inner.location(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated crash"),
            });
        }
        self.inner.save(run)
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}
