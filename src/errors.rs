//! Error types for object creation, deletion and run structure

use crate::store::StoreError;
use serde::{Deserialize, Serialize};

/// Error from a single Create call against the destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CreateError {
    /// Network, throttling or timeout failure - retried with backoff
    #[error("transient failure: {reason}")]
    Transient {
        /// Error description
        reason: Box<str>,
    },
    /// Destination object already exists
    #[error("conflict: {reason}")]
    Conflict {
        /// Error description
        reason: Box<str>,
    },
    /// Payload rejected by the destination - never retried
    #[error("validation failed: {reason}")]
    Validation {
        /// Error description
        reason: Box<str>,
    },
    /// Retry budget spent on transient failures
    #[error("{last} (gave up after {attempts} attempts)")]
    RetryExhausted {
        /// Number of Create calls made
        attempts: u32,
        /// Final failure
        last: Box<CreateError>,
    },
}

impl CreateError {
    /// Transient error from any message
    pub fn transient(reason: impl Into<Box<str>>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Conflict error from any message
    pub fn conflict(reason: impl Into<Box<str>>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Validation error from any message
    pub fn validation(reason: impl Into<Box<str>>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Check if this is an "already exists" conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Error from deleting a destination object during rollback
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeleteError {
    /// Object is already gone
    #[error("object not found: {0}")]
    NotFound(Box<str>),
    /// Deletion was refused or failed
    #[error("delete failed: {0}")]
    Failed(Box<str>),
}

/// Phase-level processor failure (enumeration, source access)
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Source enumeration failed
    #[error("enumeration failed: {0}")]
    Enumerate(Box<str>),
    /// Directory client failure outside of Create/Delete
    #[error("directory error: {0}")]
    Directory(Box<str>),
}

/// Structural problem with the phase graph or ledger
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    /// Phase dependencies form a cycle
    #[error("cyclic phase dependency involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
    /// A phase depends on a name nothing registered
    #[error("phase '{phase}' depends on unknown phase '{dependency}'")]
    UnknownDependency {
        /// Declaring phase
        phase: String,
        /// Missing dependency
        dependency: String,
    },
    /// The same phase name was registered twice
    #[error("phase '{0}' registered more than once")]
    DuplicatePhase(String),
    /// The ledger references a phase with no registered processor
    #[error("ledger references unregistered phase '{0}'")]
    UnregisteredPhase(String),
    /// The run was rolled back and must not continue
    #[error("run {0} was rolled back; start a new run")]
    RolledBack(String),
    /// Rejected run configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Top-level error for run entry points.
///
/// Object-level failures never surface here; they are recorded in the ledger.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Fatal structural problem detected before any phase executed
    #[error(transparent)]
    Structural(#[from] StructuralError),
    /// Ledger could not be loaded or saved
    #[error(transparent)]
    Store(#[from] StoreError),
}
