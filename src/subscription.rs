//! Remote change notifications and the policy that admits them.
//!
//! A notification carries the full remote project list. It only reaches the
//! store when nothing local could be clobbered: no write in flight, no
//! surfaced error, both cooldowns elapsed, and only for projects outside
//! their local-change protection window. Dropped notifications are not
//! queued; the next push or the next local round-trip catches up.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;

use crate::config::AdmissionConfig;
use crate::coordinator::Shared;
use crate::lock;
use crate::project::{Project, StoredProject};
use crate::remote::{Identity, RemoteDocumentService, RemoteResult};
use crate::state::{DropReason, Stamp, SyncEvent, SyncState};

/// A live subscription. Dropping it stops delivery.
pub struct RemoteChangeSubscription {
    task: JoinHandle<()>,
}

impl RemoteChangeSubscription {
    /// Deliver every remote notification for `identity` to `on_change`,
    /// legacy documents already migrated.
    pub fn subscribe(
        remote: &Arc<dyn RemoteDocumentService>,
        identity: &Identity,
        on_change: impl Fn(Vec<Project>) + Send + 'static,
    ) -> RemoteResult<Self> {
        let mut feed = remote.subscribe_to_projects(identity)?;
        tracing::info!("Subscribed to {} changes for {}", remote.backend_name(), identity);

        let task = tokio::spawn(async move {
            while let Some(documents) = feed.recv().await {
                let projects = documents
                    .into_iter()
                    .map(StoredProject::into_project)
                    .collect();
                on_change(projects);
            }
            tracing::debug!("Remote change feed closed");
        });

        Ok(Self { task })
    }

    /// Subscribe on behalf of the coordinator. Notifications are ignored
    /// once the session that started the subscription has ended.
    pub(crate) fn start(
        shared: &Arc<Shared>,
        identity: &Identity,
        remote: &Arc<dyn RemoteDocumentService>,
    ) -> RemoteResult<Self> {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let session = shared.session();
        Self::subscribe(remote, identity, move |projects| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.session() == session {
                on_remote_change(&shared, projects);
            }
        })
    }

    pub fn unsubscribe(self) {}
}

impl Drop for RemoteChangeSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Session-wide admission gates, checked before looking at any project.
pub fn check_gates(state: &SyncState, admission: &AdmissionConfig) -> Result<(), DropReason> {
    if state.is_syncing {
        return Err(DropReason::SyncInFlight);
    }
    if state.is_locally_updating {
        return Err(DropReason::LocalUpdateInFlight);
    }
    if state.error.is_some() {
        return Err(DropReason::ErrorActive);
    }
    let Some(last_sync) = state.last_sync_time else {
        return Err(DropReason::NeverSynced);
    };
    if last_sync.elapsed() < admission.sync_cooldown() {
        return Err(DropReason::SyncCooldown);
    }
    if let Some(last_local) = state.last_local_update_time {
        if last_local.elapsed() < admission.local_update_cooldown() {
            return Err(DropReason::LocalUpdateCooldown);
        }
    }
    Ok(())
}

/// Fold `incoming` into `local`, keeping the local copy of every protected
/// project. Unchanged projects keep their `Arc`, so an identical snapshot
/// yields a pointer-identical list.
///
/// Returns the merged list and how many projects it changed.
pub fn merge_remote(
    local: &[Arc<Project>],
    incoming: Vec<Project>,
    state: &SyncState,
) -> Result<(Vec<Arc<Project>>, usize), DropReason> {
    let mut incoming: HashMap<String, Project> =
        incoming.into_iter().map(|p| (p.id.clone(), p)).collect();
    let mut merged = Vec::with_capacity(local.len().max(incoming.len()));
    let mut changed = 0;
    let mut held_back = 0;

    for mine in local {
        match incoming.remove(&mine.id) {
            Some(theirs) if theirs.last_modified == mine.last_modified => {
                merged.push(Arc::clone(mine));
            }
            Some(theirs) => {
                if state.is_protected(&theirs.id) {
                    held_back += 1;
                    merged.push(Arc::clone(mine));
                } else {
                    changed += 1;
                    merged.push(Arc::new(theirs));
                }
            }
            // Gone remotely
            None => {
                if state.is_protected(&mine.id) {
                    held_back += 1;
                    merged.push(Arc::clone(mine));
                } else {
                    changed += 1;
                }
            }
        }
    }

    // New remote projects, in a stable order
    let mut added: Vec<Project> = incoming.into_values().collect();
    added.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    for theirs in added {
        if state.is_protected(&theirs.id) {
            held_back += 1;
        } else {
            changed += 1;
            merged.push(Arc::new(theirs));
        }
    }

    match (changed, held_back) {
        (0, 0) => Err(DropReason::Unchanged),
        (0, _) => Err(DropReason::Protected),
        _ => Ok((merged, changed)),
    }
}

/// Apply the admission policy to one notification.
pub(crate) fn on_remote_change(shared: &Shared, incoming: Vec<Project>) {
    let outcome = {
        let mut store = lock(&shared.store);
        let mut sync = lock(&shared.sync);
        check_gates(&sync, &shared.config.admission)
            .and_then(|()| merge_remote(store.all(), incoming, &sync))
            .map(|(merged, changed)| {
                store.replace_all(merged);
                sync.last_sync_time = Some(Stamp::now());
                changed
            })
    };

    match outcome {
        Ok(changed) => {
            tracing::info!("Admitted remote change ({} project(s))", changed);
            shared.publish_changes();
            shared.publish_status();
            shared.persist();
            shared.emit(SyncEvent::RemoteAdmitted { changed });
        }
        Err(reason) => {
            tracing::debug!("Dropped remote change: {:?}", reason);
            shared.emit(SyncEvent::RemoteDropped { reason });
        }
    }
}
