//! Resumable Tenant-to-Tenant Directory Migration
//!
//! Copies directory configuration objects (users, groups, applications,
//! policies) from a source tenant to a destination tenant in dependency
//! order. Every object-level transition is written to a durable ledger, so an
//! interrupted run resumes without duplicating what already exists.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. One processor per object type, over an authenticated directory client
//! let users = DirectoryProcessor::new(ObjectKind::User, source.clone(), destination.clone());
//! let groups = DirectoryProcessor::new(ObjectKind::Group, source, destination);
//!
//! // 2. Register phases with their dependencies
//! let mut orchestrator = Orchestrator::new();
//! orchestrator.register("users", &[], Arc::new(users))?;
//! orchestrator.register("groups", &["users"], Arc::new(groups))?;
//!
//! // 3. Start, and resume from the same ledger after any interruption
//! let outcome = orchestrator.start(RunConfig::new("contoso", "fabrikam", "run.json")).await?;
//! let outcome = orchestrator.resume(Path::new("run.json")).await?;
//!
//! // 4. Tear down what the run created
//! RollbackManager::new(&orchestrator)?.rollback_ledger(Path::new("run.json")).await?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod config;
mod context;
mod errors;
mod payload;
mod rewrite;
mod state;

// === Directory Access ===
mod directory;
mod org;
mod processor;

// === Storage ===
mod store;
mod writer;

// === Execution ===
mod graph;
mod orchestrator;
mod retry;
mod rollback;

// === Observability ===
mod observer;
mod report;
mod stats;

// === Test Support ===
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// === Re-exports ===

// Types
pub use config::{RunConfig, RunOptions};
pub use context::{now_millis, ObjectKey, RunId};
pub use rewrite::{RewriteRule, RewriteTable};

// Payloads
pub use payload::{
    ApplicationPayload, ConditionalAccessPolicyPayload, DeviceConfigurationPayload, GroupPayload,
    NamedLocationPayload, ObjectKind, ObjectPayload, PolicyState, Reference, UnresolvedReference, UserPayload,
};

// Ledger state
pub use state::{
    IdMapping, IdMappings, ManifestEntry, MigrationRun, ObjectRecord, ObjectStatus, PhaseState, PhaseStatus,
    RollbackManifest, FORMAT_VERSION,
};

// Errors
pub use errors::{CreateError, DeleteError, MigrationError, ProcessorError, StructuralError};

// Directory access
pub use directory::{DirectoryClient, DirectoryObject, ObjectFilter};
pub use org::{collect_reports, reports_of, OrgEntry};
pub use processor::{DirectoryProcessor, PhaseContext, Processor, SourceObject};

// Storage
pub use store::{
    initialize as initialize_ledger, load as load_ledger, save as save_ledger, FileLedger, InMemoryLedger,
    LedgerStore, StoreError,
};

// Execution
pub use graph::execution_order;
pub use orchestrator::{Orchestrator, RunOutcome};
pub use retry::{AttemptFailure, Attempted, RetryPolicy};
pub use rollback::{RollbackManager, RollbackReport, RollbackWarning};

// Observability
pub use observer::{MigrationObserver, NoOpObserver, TracingObserver};
pub use report::{report, DryRunPlan, FailedObject, PhasePlan, PhaseReport, RunReport, StatusCounts};
pub use stats::{RunStats, RunStatsSnapshot};
