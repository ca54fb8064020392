//! Remote document service boundary.
//!
//! The multi-device document store is consumed, not implemented, by the
//! sync engine. [`RemoteDocumentService`] is the seam; [`memory::MemoryRemote`]
//! is an in-process implementation with fault injection, used for local
//! development and throughout the tests.
//!
//! Reads hand back [`StoredProject`] so documents written by older clients
//! are migrated by the caller at load time, never deeper in the engine.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::project::{Project, StoredProject};

/// The authenticated user the engine syncs for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("network unavailable")]
    Offline,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out")]
    Timeout,
    #[error("permission denied: {message}")]
    PermissionDenied { message: String, transient: bool },
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid document: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RemoteError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Offline | RemoteError::Unavailable(_) | RemoteError::Timeout => true,
            RemoteError::PermissionDenied { transient, .. } => *transient,
            RemoteError::NotFound(_) | RemoteError::Invalid(_) | RemoteError::Other(_) => false,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, RemoteError::Offline)
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Push feed of the identity's full project list. Dropping the receiver
/// unsubscribes.
pub type ProjectFeed = mpsc::UnboundedReceiver<Vec<StoredProject>>;

#[async_trait]
pub trait RemoteDocumentService: Send + Sync {
    /// Human-readable backend name (e.g., "memory").
    fn backend_name(&self) -> &str;

    async fn get_projects_for_identity(&self, identity: &Identity) -> RemoteResult<Vec<StoredProject>>;

    async fn create_project(&self, identity: &Identity, project: &Project) -> RemoteResult<()>;

    /// Write the project, creating it if the store has never seen it.
    async fn update_project(&self, identity: &Identity, project: &Project) -> RemoteResult<()>;

    async fn delete_project(&self, identity: &Identity, id: &str) -> RemoteResult<()>;

    /// Subscribe to change notifications for the identity's projects. Every
    /// notification carries the complete current list, including echoes of
    /// this client's own writes.
    fn subscribe_to_projects(&self, identity: &Identity) -> RemoteResult<ProjectFeed>;

    async fn test_connection(&self) -> bool;

    fn set_offline_support(&self, enabled: bool);
}
