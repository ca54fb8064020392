//! skein: optimistic local-write / background-sync engine for knitting
//! pattern projects.
//!
//! Local edits land in the in-memory [`store::ProjectStore`] and the
//! [`storage::PersistentCache`] immediately; a background task then pushes
//! them to a [`remote::RemoteDocumentService`] with retry and backoff. Remote
//! change notifications are admitted only when they cannot clobber a fresher
//! local edit. [`coordinator::SyncCoordinator`] ties it together.

pub mod config;
pub mod coordinator;
pub mod network;
pub mod pattern;
pub mod project;
pub mod remote;
pub mod state;
pub mod storage;
pub mod store;
pub mod subscription;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{Config, DeviceProfile};
pub use coordinator::SyncCoordinator;
pub use network::NetworkMonitor;
pub use project::{Project, ProjectId, StoredProject};
pub use remote::{Identity, RemoteDocumentService, RemoteError};
pub use state::{StatusIndicator, SyncEvent, SyncOutcome, SyncState, SyncStatus};
pub use storage::PersistentCache;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
