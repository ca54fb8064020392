//! In-process remote document store.
//!
//! Behaves like the hosted store as far as the engine can tell: per-identity
//! project documents, full-list push notifications on every change (own
//! writes echo back), configurable latency, and scripted failures so retry
//! and offline paths can be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Identity, ProjectFeed, RemoteDocumentService, RemoteError, RemoteResult};
use crate::lock;
use crate::project::{Project, StoredProject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// One write call as seen by the store, successful or not.
#[derive(Debug, Clone)]
pub struct WriteAttempt {
    pub kind: WriteKind,
    pub project_id: String,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<Identity, Vec<StoredProject>>,
    subscribers: Vec<(Identity, mpsc::UnboundedSender<Vec<StoredProject>>)>,
    failures: VecDeque<RemoteError>,
    attempts: Vec<WriteAttempt>,
    latency: Duration,
    reachable: bool,
    offline_support: bool,
}

pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                reachable: true,
                ..Inner::default()
            }),
        }
    }

    /// Delay applied to every read and write.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.inner).latency = latency;
    }

    /// Answer for `test_connection`.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.inner).reachable = reachable;
    }

    /// Fail the next write with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: RemoteError) {
        lock(&self.inner).failures.push_back(error);
    }

    /// Fail the next `n` writes with errors built by `make`.
    pub fn fail_next_n(&self, n: usize, make: impl Fn() -> RemoteError) {
        let mut inner = lock(&self.inner);
        for _ in 0..n {
            inner.failures.push_back(make());
        }
    }

    pub fn attempts(&self) -> Vec<WriteAttempt> {
        lock(&self.inner).attempts.clone()
    }

    pub fn offline_support(&self) -> bool {
        lock(&self.inner).offline_support
    }

    pub fn project(&self, identity: &Identity, id: &str) -> Option<StoredProject> {
        lock(&self.inner)
            .documents
            .get(identity)
            .and_then(|docs| docs.iter().find(|d| d.id() == id).cloned())
    }

    /// Seed documents without notifying anyone.
    pub fn seed(&self, identity: &Identity, projects: Vec<StoredProject>) {
        lock(&self.inner).documents.insert(identity.clone(), projects);
    }

    /// Simulate a write made by another device: store it and notify.
    pub fn write_from_other_device(&self, identity: &Identity, project: Project) {
        let mut inner = lock(&self.inner);
        upsert(&mut inner, identity, StoredProject::Current(project));
        notify(&mut inner, identity);
    }

    async fn write(
        &self,
        kind: WriteKind,
        identity: &Identity,
        project_id: &str,
        apply: impl FnOnce(&mut Inner),
    ) -> RemoteResult<()> {
        let latency = lock(&self.inner).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = lock(&self.inner);
        let failure = inner.failures.pop_front();
        inner.attempts.push(WriteAttempt {
            kind,
            project_id: project_id.to_string(),
            at: Instant::now(),
            succeeded: failure.is_none(),
        });
        if let Some(error) = failure {
            tracing::debug!("memory remote: failing {:?} of {}: {}", kind, project_id, error);
            return Err(error);
        }

        apply(&mut inner);
        notify(&mut inner, identity);
        Ok(())
    }
}

fn upsert(inner: &mut Inner, identity: &Identity, project: StoredProject) {
    let docs = inner.documents.entry(identity.clone()).or_default();
    match docs.iter().position(|d| d.id() == project.id()) {
        Some(index) => docs[index] = project,
        None => docs.push(project),
    }
}

fn notify(inner: &mut Inner, identity: &Identity) {
    let snapshot = inner.documents.get(identity).cloned().unwrap_or_default();
    inner
        .subscribers
        .retain(|(who, tx)| who != identity || tx.send(snapshot.clone()).is_ok());
}

#[async_trait]
impl RemoteDocumentService for MemoryRemote {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn get_projects_for_identity(&self, identity: &Identity) -> RemoteResult<Vec<StoredProject>> {
        let latency = lock(&self.inner).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let inner = lock(&self.inner);
        if !inner.reachable {
            return Err(RemoteError::Unavailable("memory remote unreachable".to_string()));
        }
        Ok(inner.documents.get(identity).cloned().unwrap_or_default())
    }

    async fn create_project(&self, identity: &Identity, project: &Project) -> RemoteResult<()> {
        let stored = StoredProject::Current(project.clone());
        self.write(WriteKind::Create, identity, &project.id, |inner| {
            upsert(inner, identity, stored)
        })
        .await
    }

    async fn update_project(&self, identity: &Identity, project: &Project) -> RemoteResult<()> {
        let stored = StoredProject::Current(project.clone());
        self.write(WriteKind::Update, identity, &project.id, |inner| {
            upsert(inner, identity, stored)
        })
        .await
    }

    async fn delete_project(&self, identity: &Identity, id: &str) -> RemoteResult<()> {
        self.write(WriteKind::Delete, identity, id, |inner| {
            if let Some(docs) = inner.documents.get_mut(identity) {
                docs.retain(|d| d.id() != id);
            }
        })
        .await
    }

    fn subscribe_to_projects(&self, identity: &Identity) -> RemoteResult<ProjectFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        // Initial snapshot, like a fresh listener on the hosted store
        let snapshot = inner.documents.get(identity).cloned().unwrap_or_default();
        let _ = tx.send(snapshot);
        inner.subscribers.push((identity.clone(), tx));
        Ok(rx)
    }

    async fn test_connection(&self) -> bool {
        lock(&self.inner).reachable
    }

    fn set_offline_support(&self, enabled: bool) {
        lock(&self.inner).offline_support = enabled;
    }
}
