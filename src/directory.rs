//! Directory service client boundary
//!
//! The engine never talks to a tenant directly. Implementations of
//! [`DirectoryClient`] wrap an already-authenticated session.

use crate::{CreateError, DeleteError, ObjectKind, ObjectPayload, ProcessorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which objects of a kind to list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectFilter {
    /// Every object of the kind
    All,
    /// Users whose manager is the given id
    DirectReportsOf(String),
}

/// Object as listed from a tenant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    /// Tenant-side identifier
    pub id: String,
    /// Typed payload
    pub payload: ObjectPayload,
}

/// Directory service capability used by processors
#[async_trait]
pub trait DirectoryClient: Send + Sync + 'static {
    /// List objects of a kind
    async fn list_objects(
        &self,
        kind: ObjectKind,
        filter: &ObjectFilter,
    ) -> Result<Vec<DirectoryObject>, ProcessorError>;

    /// Create an object, returning its new identifier
    async fn create_object(&self, kind: ObjectKind, payload: &ObjectPayload) -> Result<String, CreateError>;

    /// Delete an object by identifier
    async fn delete_object(&self, kind: ObjectKind, id: &str) -> Result<(), DeleteError>;

    /// Look up an existing object matching the payload's natural key
    async fn find_object(
        &self,
        kind: ObjectKind,
        payload: &ObjectPayload,
    ) -> Result<Option<String>, ProcessorError>;
}
