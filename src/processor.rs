//! Processor contract and the directory-backed processor
//!
//! A [`Processor`] owns one object type: it enumerates source objects and
//! creates them at the destination. The orchestrator drives it, keeps the
//! ledger, applies retries and decides what to skip.
//!
//! # Example
//!
//! ```rust,ignore
//! let users = DirectoryProcessor::new(ObjectKind::User, source.clone(), destination.clone());
//! let groups = DirectoryProcessor::new(ObjectKind::Group, source, destination)
//!     .with_reference_phase(ObjectKind::User, "users");
//!
//! let mut orchestrator = Orchestrator::new();
//! orchestrator.register("users", &[], Arc::new(users))?;
//! orchestrator.register("groups", &["users"], Arc::new(groups))?;
//! ```

use crate::directory::{DirectoryClient, ObjectFilter};
use crate::{
    CreateError, DeleteError, IdMappings, ObjectKey, ObjectKind, ObjectPayload, ProcessorError,
    RewriteTable, RunId,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One enumerated source object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceObject {
    /// Stable ledger key
    pub key: ObjectKey,
    /// Source-side id, used for cross-phase mapping
    pub source_id: Option<String>,
    /// Typed payload as read from the source
    pub payload: ObjectPayload,
}

impl SourceObject {
    /// Source object keyed by kind and source id
    pub fn new(source_id: impl Into<String>, payload: ObjectPayload) -> Self {
        let source_id = source_id.into();
        Self {
            key: ObjectKey::for_source(payload.kind().as_str(), &source_id),
            source_id: Some(source_id),
            payload,
        }
    }
}

/// What a processor sees of the run while its phase executes
#[derive(Clone, Debug)]
pub struct PhaseContext {
    /// Run identifier
    pub run_id: RunId,
    /// Phase being executed
    pub phase: String,
    /// Source tenant identifier
    pub source_tenant: String,
    /// Destination tenant identifier
    pub destination_tenant: String,
    /// Principal rewrites
    pub rewrite: RewriteTable,
    /// Id mappings of the phase's Completed dependencies
    pub mappings: IdMappings,
    /// Planning only
    pub dry_run: bool,
}

/// Pluggable per-object-type migration unit
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Object type label for logs
    fn object_type(&self) -> &str;

    /// Lazily enumerate source objects. One pass per phase invocation.
    fn enumerate<'a>(&'a self, context: &'a PhaseContext) -> BoxStream<'a, Result<SourceObject, ProcessorError>>;

    /// Create the object at the destination, returning its identifier
    async fn create(&self, context: &PhaseContext, object: &SourceObject) -> Result<String, CreateError>;

    /// Delete a destination object created by this processor
    async fn delete(&self, destination_id: &str) -> Result<(), DeleteError>;

    // === Optional Hooks ===

    /// Find the destination object a Conflict refers to
    async fn find_existing(
        &self,
        _context: &PhaseContext,
        _object: &SourceObject,
    ) -> Result<Option<String>, ProcessorError> {
        Ok(None)
    }

    /// Reason to leave an object out of the migration
    fn skip_reason(&self, _object: &SourceObject) -> Option<String> {
        None
    }

    /// Whether deleting an object fully reverts having created it
    fn deletion_is_complete(&self) -> bool {
        true
    }
}

/// Processor for one [`ObjectKind`] over a [`DirectoryClient`].
///
/// Rewrites principals, translates references through the id mappings of
/// completed phases, and creates at the destination.
pub struct DirectoryProcessor<C: DirectoryClient> {
    kind: ObjectKind,
    source: Arc<C>,
    destination: Arc<C>,
    filter: ObjectFilter,
    reference_phases: BTreeMap<ObjectKind, String>,
}

impl<C: DirectoryClient> DirectoryProcessor<C> {
    /// Processor copying every object of `kind`
    pub fn new(kind: ObjectKind, source: Arc<C>, destination: Arc<C>) -> Self {
        Self {
            kind,
            source,
            destination,
            filter: ObjectFilter::All,
            reference_phases: BTreeMap::new(),
        }
    }

    /// Restrict a user phase to the transitive reports of one manager
    pub fn reports_of(mut self, manager_id: impl Into<String>) -> Self {
        self.filter = ObjectFilter::DirectReportsOf(manager_id.into());
        self
    }

    /// Resolve references of `kind` through the mapping of `phase`.
    ///
    /// Without this, references resolve against any dependency's mapping.
    pub fn with_reference_phase(mut self, kind: ObjectKind, phase: impl Into<String>) -> Self {
        self.reference_phases.insert(kind, phase.into());
        self
    }

    fn destination_payload(&self, context: &PhaseContext, object: &SourceObject) -> Result<ObjectPayload, CreateError> {
        let rewritten = object.payload.rewrite_principals(&context.rewrite);
        rewritten
            .remap(|kind, source_id| {
                let resolved = match self.reference_phases.get(&kind) {
                    Some(phase) => context.mappings.resolve(phase, source_id),
                    None => context.mappings.resolve_any(source_id),
                };
                resolved.map(str::to_string)
            })
            .map_err(|e| CreateError::validation(e.to_string()))
    }
}

#[async_trait]
impl<C: DirectoryClient> Processor for DirectoryProcessor<C> {
    fn object_type(&self) -> &str {
        self.kind.as_str()
    }

    fn enumerate<'a>(&'a self, _context: &'a PhaseContext) -> BoxStream<'a, Result<SourceObject, ProcessorError>> {
        let kind = self.kind;
        match &self.filter {
            ObjectFilter::All => stream::once(self.source.list_objects(kind, &self.filter))
                .flat_map(|listed| match listed {
                    Ok(objects) => stream::iter(
                        objects
                            .into_iter()
                            .map(|o| Ok::<_, ProcessorError>(SourceObject::new(o.id, o.payload))),
                    )
                    .boxed(),
                    Err(e) => stream::iter(vec![Err(e)]).boxed(),
                })
                .boxed(),
            ObjectFilter::DirectReportsOf(root) => stream::once(crate::org::reports_of(self.source.as_ref(), root))
                .flat_map(|collected| match collected {
                    Ok(entries) => stream::iter(
                        entries
                            .into_iter()
                            .map(|e| Ok::<_, ProcessorError>(SourceObject::new(e.object.id, e.object.payload))),
                    )
                    .boxed(),
                    Err(e) => stream::iter(vec![Err(e)]).boxed(),
                })
                .boxed(),
        }
    }

    async fn create(&self, context: &PhaseContext, object: &SourceObject) -> Result<String, CreateError> {
        let payload = self.destination_payload(context, object)?;
        self.destination.create_object(self.kind, &payload).await
    }

    async fn delete(&self, destination_id: &str) -> Result<(), DeleteError> {
        self.destination.delete_object(self.kind, destination_id).await
    }

    async fn find_existing(
        &self,
        context: &PhaseContext,
        object: &SourceObject,
    ) -> Result<Option<String>, ProcessorError> {
        let payload = object.payload.rewrite_principals(&context.rewrite);
        self.destination.find_object(self.kind, &payload).await
    }

    fn skip_reason(&self, object: &SourceObject) -> Option<String> {
        object.payload.skip_reason()
    }

    fn deletion_is_complete(&self) -> bool {
        !self.kind.is_policy_bearing()
    }
}
