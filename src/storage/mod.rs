//! Durable local mirror of the project store.
//!
//! - [`disk::DiskBackend`]: redb file (default, survives restarts)
//! - [`memory::MemoryBackend`]: process memory (tests, ephemeral sessions)
//!
//! [`PersistentCache`] owns a `Box<dyn KeyValueBackend>` and all snapshot
//! persistence goes through it. Keys are `{namespace}:{identity}`, so one
//! user's snapshot is never read for another, and guests (no identity)
//! never touch the backend at all.

pub mod disk;
pub mod memory;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::{Project, ProjectId, StoredProject};
use crate::remote::Identity;

pub const SNAPSHOT_VERSION: u32 = 2;

/// Synchronous string key-value storage.
pub trait KeyValueBackend: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;
}

/// Everything needed to bootstrap the engine offline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub version: u32,
    pub projects: Vec<Project>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_project_id: Option<ProjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// On-disk form. Projects may still be in the legacy layout.
#[derive(Deserialize)]
struct StoredSnapshot {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    projects: Vec<StoredProject>,
    #[serde(default)]
    current_project_id: Option<ProjectId>,
    #[serde(default)]
    last_sync_time: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(
        projects: Vec<Project>,
        current_project_id: Option<ProjectId>,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            projects,
            current_project_id,
            last_sync_time,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize snapshot")
    }

    /// Parse a stored snapshot, migrating legacy projects. Every timestamp
    /// comes back as a `DateTime`, not a string.
    pub fn from_json(json: &str) -> Result<Self> {
        let stored: StoredSnapshot =
            serde_json::from_str(json).context("Failed to parse snapshot")?;
        if stored.version > SNAPSHOT_VERSION {
            anyhow::bail!(
                "snapshot version {} is newer than supported version {}",
                stored.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(Self {
            version: SNAPSHOT_VERSION,
            projects: stored
                .projects
                .into_iter()
                .map(StoredProject::into_project)
                .collect(),
            current_project_id: stored.current_project_id,
            last_sync_time: stored.last_sync_time,
        })
    }
}

pub struct PersistentCache {
    backend: Box<dyn KeyValueBackend>,
    namespace: String,
}

impl PersistentCache {
    pub fn new(backend: Box<dyn KeyValueBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(memory::MemoryBackend::new()), crate::config::DEFAULT_NAMESPACE)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    pub fn key_for(&self, identity: &Identity) -> String {
        cache_key(&self.namespace, identity)
    }

    /// Load the identity's snapshot. Missing identity, missing entry and
    /// unreadable entries all come back as `None`.
    pub fn load(&self, identity: Option<&Identity>) -> Option<Snapshot> {
        let identity = identity?;
        let key = self.key_for(identity);

        let raw = match self.backend.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Could not read cached snapshot {}: {:#}", key, e);
                return None;
            }
        };

        match Snapshot::from_json(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Cached snapshot {} is corrupt, starting fresh: {:#}", key, e);
                None
            }
        }
    }

    /// Persist the snapshot. Guests have nowhere to write to and succeed.
    pub fn save(&self, identity: Option<&Identity>, snapshot: &Snapshot) -> Result<()> {
        let Some(identity) = identity else {
            return Ok(());
        };
        let json = snapshot.to_json()?;
        self.backend
            .set(&self.key_for(identity), &json)
            .with_context(|| format!("Failed to write snapshot for {}", identity))
    }

    pub fn clear(&self, identity: Option<&Identity>) -> Result<()> {
        let Some(identity) = identity else {
            return Ok(());
        };
        self.backend.remove(&self.key_for(identity))
    }

    /// Identities with a snapshot under this cache's namespace.
    pub fn identities(&self) -> Result<Vec<Identity>> {
        let prefix = format!("{}:", self.namespace);
        let mut identities: Vec<Identity> = self
            .backend
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(Identity::new))
            .collect();
        identities.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(identities)
    }
}

pub fn cache_key(namespace: &str, identity: &Identity) -> String {
    format!("{}:{}", namespace, identity)
}
