//! The sync coordinator.
//!
//! Every mutation runs in two halves:
//!
//! ```text
//! caller ──► stamp ──► store.replace ──► mark protected ──► cache.save ──► return
//!                                                                           │
//!                          background task ◄────────────────────────────────┘
//!                          wait for network ─► remote write ─► retry w/ backoff
//!                          ok:   last_sync_time, release protection after grace
//!                          fail: surface error (auto-clears), stay protected
//! ```
//!
//! The synchronous half never waits on the network, so the store always
//! reflects the latest local edit whatever the remote does. Progress is
//! observable through [`SyncCoordinator::status`] and
//! [`SyncCoordinator::events`], never through the mutation call itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::lock;
use crate::network::{ListenerHandle, NetworkMonitor};
use crate::project::{Project, ProjectId, StoredProject};
use crate::remote::{Identity, RemoteDocumentService, RemoteError, RemoteResult};
use crate::state::{Stamp, SyncEvent, SyncOutcome, SyncState, SyncStatus};
use crate::storage::{PersistentCache, Snapshot};
use crate::store::ProjectStore;
use crate::subscription::RemoteChangeSubscription;

const EVENT_CAPACITY: usize = 256;

const OFFLINE_MESSAGE: &str =
    "You're offline. Changes are saved locally and will sync when you reconnect.";
const FAILED_MESSAGE: &str = "Sync failed. Your changes are saved locally.";

/// State shared between the coordinator handle, its background writes and
/// the remote change subscription. Lock order: `persist_lock`, then `store`,
/// then `sync`.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) store: Mutex<ProjectStore>,
    pub(crate) sync: Mutex<SyncState>,
    pub(crate) network: Arc<NetworkMonitor>,
    identity: Mutex<Option<Identity>>,
    cache: PersistentCache,
    /// Held from snapshot capture through the cache write, so saves land in
    /// the order their snapshots were taken.
    persist_lock: Mutex<()>,
    remote: Option<Arc<dyn RemoteDocumentService>>,
    /// Bumped by teardown; work started under an older session leaves the
    /// state alone.
    session: AtomicU64,
    status_tx: watch::Sender<SyncStatus>,
    changes_tx: watch::Sender<u64>,
    events_tx: broadcast::Sender<SyncEvent>,
    subscription: Mutex<Option<RemoteChangeSubscription>>,
    _network_listener: ListenerHandle,
}

impl Shared {
    pub(crate) fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    fn remote_target(&self) -> Option<(Identity, Arc<dyn RemoteDocumentService>)> {
        let identity = self.identity()?;
        let remote = Arc::clone(self.remote.as_ref()?);
        Some((identity, remote))
    }

    /// Mutate the sync state and publish the resulting status.
    pub(crate) fn update_sync<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut state = lock(&self.sync);
        let result = f(&mut state);
        self.status_tx
            .send_replace(SyncStatus::from_state(&state, self.network.is_online()));
        result
    }

    /// Like `update_sync`, but a no-op once the session has been torn down.
    fn update_sync_in<R>(&self, session: u64, f: impl FnOnce(&mut SyncState) -> R) -> Option<R> {
        if self.session() != session {
            return None;
        }
        Some(self.update_sync(f))
    }

    pub(crate) fn publish_status(&self) {
        self.update_sync(|_| ());
    }

    pub(crate) fn publish_changes(&self) {
        let revision = lock(&self.store).revision();
        self.changes_tx.send_if_modified(|current| {
            if *current == revision {
                false
            } else {
                *current = revision;
                true
            }
        });
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    /// Mirror the store into the cache. Failures are logged; the in-memory
    /// store stays authoritative for the session.
    pub(crate) fn persist(&self) {
        let _persisting = lock(&self.persist_lock);
        let last_sync_time = lock(&self.sync).last_sync_time.map(|s| s.wall);
        let snapshot = {
            let store = lock(&self.store);
            Snapshot::new(
                store.all().iter().map(|p| (**p).clone()).collect(),
                store.current_id().map(str::to_string),
                last_sync_time,
            )
        };
        let identity = self.identity();
        if let Err(e) = self.cache.save(identity.as_ref(), &snapshot) {
            tracing::warn!("Could not persist snapshot: {:#}", e);
        }
    }
}

/// Surface a user-visible error that clears itself after the display window
/// unless a newer error replaced it.
fn show_error(shared: &Arc<Shared>, session: u64, message: &str) {
    let Some(generation) = shared.update_sync_in(session, |s| s.set_error(message.to_string()))
    else {
        return;
    };
    let shared = Arc::clone(shared);
    let display = shared.config.sync.error_display();
    tokio::spawn(async move {
        tokio::time::sleep(display).await;
        shared.update_sync_in(session, |s| s.clear_error_if(generation));
    });
}

enum WriteOp {
    Create(Project),
    Update(Project),
    Delete(ProjectId),
}

impl WriteOp {
    fn id(&self) -> &str {
        match self {
            WriteOp::Create(p) | WriteOp::Update(p) => &p.id,
            WriteOp::Delete(id) => id,
        }
    }

    async fn send(&self, remote: &dyn RemoteDocumentService, identity: &Identity) -> RemoteResult<()> {
        match self {
            WriteOp::Create(p) => remote.create_project(identity, p).await,
            WriteOp::Update(p) => remote.update_project(identity, p).await,
            WriteOp::Delete(id) => remote.delete_project(identity, id).await,
        }
    }
}

/// Handle to the sync engine. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl SyncCoordinator {
    /// Build an engine with no identity (guest mode). Call [`init`](Self::init)
    /// after sign-in.
    pub fn new(
        config: Config,
        cache: PersistentCache,
        remote: Option<Arc<dyn RemoteDocumentService>>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::from_state(
            &SyncState::default(),
            network.is_online(),
        ));
        let (changes_tx, _) = watch::channel(0);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let listener = network.add_listener(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.publish_status();
                }
            });
            Shared {
                config,
                store: Mutex::new(ProjectStore::new()),
                sync: Mutex::new(SyncState::default()),
                network,
                identity: Mutex::new(None),
                cache,
                persist_lock: Mutex::new(()),
                remote,
                session: AtomicU64::new(0),
                status_tx,
                changes_tx,
                events_tx,
                subscription: Mutex::new(None),
                _network_listener: listener,
            }
        });

        Self { shared }
    }

    /// Start a session for `identity` (or a guest session for `None`): load
    /// the cached snapshot, reconcile with the remote store and subscribe to
    /// remote changes. Remote trouble leaves the engine running on cached
    /// data with the error surfaced.
    ///
    /// Whatever the previous session held (guest projects included) is
    /// dropped first. A teardown while this is still awaiting the remote
    /// abandons the rest of it.
    pub async fn init(&self, identity: Option<Identity>) {
        self.teardown();
        let shared = &self.shared;
        let session = shared.session();
        *lock(&shared.identity) = identity.clone();

        match shared.cache.load(identity.as_ref()) {
            Some(snapshot) => {
                tracing::info!(
                    "Loaded {} cached project(s) from {}",
                    snapshot.projects.len(),
                    shared.cache.backend_name()
                );
                {
                    let mut store = lock(&shared.store);
                    store.replace_all(snapshot.projects.into_iter().map(Arc::new).collect());
                    if let Some(id) = &snapshot.current_project_id {
                        store.set_current(id);
                    }
                }
                shared.update_sync(|s| s.last_sync_time = snapshot.last_sync_time.map(Stamp::from_wall));
            }
            None => shared.publish_status(),
        }
        shared.publish_changes();

        let Some((identity, remote)) = shared.remote_target() else {
            tracing::info!("No signed-in identity or remote service; running local-only");
            return;
        };

        remote.set_offline_support(true);
        let reachable = shared.config.device.skip_connection_probe || remote.test_connection().await;

        if reachable {
            match remote.get_projects_for_identity(&identity).await {
                Ok(documents) => {
                    if !self.reconcile_initial(session, documents) {
                        tracing::info!("Session for {} ended during init", identity);
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Could not fetch remote projects for {}: {}", identity, e);
                    show_error(shared, session, "Could not load projects from the cloud. Showing saved data.");
                }
            }
        } else {
            tracing::warn!("{} remote unreachable; using cached projects", remote.backend_name());
            show_error(shared, session, OFFLINE_MESSAGE);
        }

        // Checked under the slot lock; teardown bumps the session before it
        // empties the slot
        let mut slot = lock(&shared.subscription);
        if shared.session() != session {
            return;
        }
        match RemoteChangeSubscription::start(shared, &identity, &remote) {
            Ok(subscription) => *slot = Some(subscription),
            Err(e) => tracing::warn!("Could not subscribe to remote changes: {}", e),
        }
    }

    /// Merge the remote project list into the cached one: the newer
    /// `last_modified` wins, local-only and locally newer projects are
    /// uploaded. Returns false, touching nothing, once `session` has ended.
    fn reconcile_initial(&self, session: u64, documents: Vec<StoredProject>) -> bool {
        let shared = &self.shared;
        let remote_projects: Vec<Project> = documents
            .into_iter()
            .map(StoredProject::into_project)
            .collect();

        let uploads = {
            let mut store = lock(&shared.store);
            if shared.session() != session {
                return false;
            }
            let local: HashMap<&str, &Arc<Project>> =
                store.all().iter().map(|p| (p.id.as_str(), p)).collect();
            let remote_ids: HashSet<String> = remote_projects.iter().map(|p| p.id.clone()).collect();

            let mut merged = Vec::with_capacity(remote_projects.len());
            let mut uploads = Vec::new();
            for remote_project in remote_projects {
                match local.get(remote_project.id.as_str()) {
                    Some(mine) if mine.last_modified > remote_project.last_modified => {
                        uploads.push((***mine).clone());
                        merged.push(Arc::clone(*mine));
                    }
                    Some(mine) if mine.last_modified == remote_project.last_modified => {
                        merged.push(Arc::clone(*mine));
                    }
                    _ => merged.push(Arc::new(remote_project)),
                }
            }
            for mine in store.all().iter().filter(|p| !remote_ids.contains(&p.id)) {
                uploads.push((**mine).clone());
                merged.push(Arc::clone(mine));
            }
            drop(local);

            store.replace_all(merged);
            uploads
        };

        if shared
            .update_sync_in(session, |s| s.last_sync_time = Some(Stamp::now()))
            .is_none()
        {
            return false;
        }
        shared.publish_changes();
        shared.persist();
        tracing::info!(
            "Initial sync complete: {} project(s), {} to upload",
            lock(&shared.store).all().len(),
            uploads.len()
        );

        for project in uploads {
            let Some(generation) = shared.update_sync_in(session, |s| s.mark_local_change(&project.id))
            else {
                return false;
            };
            self.spawn_write(WriteOp::Update(project), generation);
        }
        true
    }

    /// End the session (sign-out): stop listening for remote changes, reset
    /// the sync state and empty the store. In-flight writes run on but no
    /// longer touch the state.
    pub fn teardown(&self) {
        let shared = &self.shared;
        shared.session.fetch_add(1, Ordering::SeqCst);
        *lock(&shared.identity) = None;
        if let Some(subscription) = lock(&shared.subscription).take() {
            subscription.unsubscribe();
        }
        lock(&shared.store).clear();
        shared.update_sync(|s| *s = SyncState::default());
        shared.publish_changes();
        tracing::debug!("Sync session torn down");
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn projects(&self) -> Vec<Arc<Project>> {
        lock(&self.shared.store).all().to_vec()
    }

    pub fn project(&self, id: &str) -> Option<Arc<Project>> {
        lock(&self.shared.store).get(id).cloned()
    }

    pub fn current(&self) -> Option<Arc<Project>> {
        lock(&self.shared.store).current().cloned()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.shared.identity()
    }

    pub fn sync_state(&self) -> SyncState {
        lock(&self.shared.sync).clone()
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.shared.network
    }

    /// Latest status for a sync indicator.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Store revision; changes only when the project list actually changed.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events_tx.subscribe()
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Apply a local edit. The store and cache are updated before this
    /// returns; the remote write continues in the background. Awaiting the
    /// handle is optional.
    pub fn apply_local(&self, mut project: Project) -> JoinHandle<SyncOutcome> {
        project.stamp(Utc::now());
        let id = project.id.clone();
        let generation = self.commit_local(&id, |store| {
            store.replace(project.clone());
            true
        });
        self.spawn_write(WriteOp::Update(project), generation.unwrap_or_default())
    }

    /// Edit the current project in place; `None` when nothing is selected.
    pub fn update_current(&self, edit: impl FnOnce(&mut Project)) -> Option<JoinHandle<SyncOutcome>> {
        let mut project = (*self.current()?).clone();
        edit(&mut project);
        Some(self.apply_local(project))
    }

    /// Create a project, select it, and push it to the remote.
    pub fn create_project(&self, name: impl Into<String>) -> (ProjectId, JoinHandle<SyncOutcome>) {
        let project = Project::new(name);
        let id = project.id.clone();
        let generation = self.commit_local(&id, |store| {
            store.replace(project.clone());
            store.set_current(&project.id);
            true
        });
        let handle = self.spawn_write(WriteOp::Create(project), generation.unwrap_or_default());
        (id, handle)
    }

    /// Delete a project locally and remotely. The id stays protected so a
    /// stale remote echo cannot bring it back. `None` for an unknown id.
    pub fn delete_project(&self, id: &str) -> Option<JoinHandle<SyncOutcome>> {
        let generation = self.commit_local(id, |store| store.remove(id).is_some())?;
        Some(self.spawn_write(WriteOp::Delete(id.to_string()), generation))
    }

    /// Select the current project. Unknown ids are ignored.
    pub fn set_current(&self, id: &str) {
        lock(&self.shared.store).set_current(id);
        self.shared.publish_changes();
        self.shared.persist();
    }

    /// Push every project to the remote again, without re-stamping them.
    pub fn force_sync(&self) -> JoinHandle<SyncOutcome> {
        let shared = Arc::clone(&self.shared);
        let session = shared.session();
        let projects: Vec<Project> = self.projects().iter().map(|p| (**p).clone()).collect();
        let writes: Vec<(WriteOp, u64)> = shared.update_sync(|s| {
            projects
                .into_iter()
                .map(|p| {
                    let generation = s.mark_local_change(&p.id);
                    (WriteOp::Update(p), generation)
                })
                .collect()
        });
        tracing::info!("Force sync of {} project(s)", writes.len());

        tokio::spawn(async move {
            let mut outcome = if shared.remote_target().is_some() {
                SyncOutcome::Synced
            } else {
                SyncOutcome::LocalOnly
            };
            for (op, generation) in writes {
                let result = run_write(Arc::clone(&shared), session, op, generation).await;
                if !matches!(outcome, SyncOutcome::Failed { .. }) {
                    outcome = result;
                }
            }
            outcome
        })
    }

    /// Run `edit` against the store and, if it changed something, mark `id`
    /// as locally changed in the same critical section. Then publish and
    /// persist. Returns the change generation.
    fn commit_local(&self, id: &str, edit: impl FnOnce(&mut ProjectStore) -> bool) -> Option<u64> {
        let shared = &self.shared;
        let generation = {
            let mut store = lock(&shared.store);
            if !edit(&mut store) {
                return None;
            }
            let mut sync = lock(&shared.sync);
            sync.mark_local_change(id)
        };

        shared.publish_changes();
        shared.publish_status();
        shared.persist();
        shared.emit(SyncEvent::LocalApplied { id: id.to_string() });
        tracing::debug!("Applied local change to {} (generation {})", id, generation);
        Some(generation)
    }

    fn spawn_write(&self, op: WriteOp, generation: u64) -> JoinHandle<SyncOutcome> {
        let shared = Arc::clone(&self.shared);
        let session = shared.session();
        tokio::spawn(run_write(shared, session, op, generation))
    }
}

/// Background half of a local mutation.
async fn run_write(shared: Arc<Shared>, session: u64, op: WriteOp, generation: u64) -> SyncOutcome {
    let id = op.id().to_string();
    let Some((identity, remote)) = shared.remote_target() else {
        shared.update_sync_in(session, |s| {
            s.finish_write();
            s.release_protection(&id, generation);
        });
        return SyncOutcome::LocalOnly;
    };

    let max_retries = shared.config.sync.max_retries;
    let mut retry = 0;
    let result = loop {
        match attempt(&shared, session, remote.as_ref(), &identity, &op, retry + 1).await {
            Ok(()) => break Ok(()),
            Err(e) if e.is_retryable() && retry < max_retries => {
                retry += 1;
                let delay = shared.config.device.retry_delay(retry);
                tracing::warn!(
                    "Sync of {} failed ({}), retrying in {:?} ({}/{})",
                    id, e, delay, retry, max_retries
                );
                shared.update_sync_in(session, |s| {
                    s.set_info(format!("Sync failed, retrying ({}/{})...", retry, max_retries))
                });
                shared.emit(SyncEvent::Retrying {
                    id: id.clone(),
                    retry,
                    max_retries,
                    delay,
                });
                tokio::time::sleep(delay).await;
                // Clear before the next attempt so it never lingers
                shared.update_sync_in(session, |s| s.message = None);
            }
            Err(e) => break Err(e),
        }
    };

    match result {
        Ok(()) => {
            shared.update_sync_in(session, |s| {
                s.last_sync_time = Some(Stamp::now());
                s.error = None;
                s.message = None;
                s.finish_write();
            });
            tracing::info!("Synced project {}", id);
            shared.emit(SyncEvent::Synced { id: id.clone() });
            if shared.session() == session {
                shared.persist();
            }
            release_after_grace(shared, session, id, generation);
            SyncOutcome::Synced
        }
        Err(error) => {
            let offline = error.is_offline() || !shared.network.is_online();
            tracing::error!("Giving up syncing {}: {}", id, error);
            shared.update_sync_in(session, |s| {
                s.message = None;
                s.finish_write();
            });
            show_error(&shared, session, if offline { OFFLINE_MESSAGE } else { FAILED_MESSAGE });
            shared.emit(SyncEvent::Failed { id, offline });
            SyncOutcome::Failed {
                offline,
                error: error.to_string(),
            }
        }
    }
}

async fn attempt(
    shared: &Shared,
    session: u64,
    remote: &dyn RemoteDocumentService,
    identity: &Identity,
    op: &WriteOp,
    attempt: u32,
) -> RemoteResult<()> {
    let id = op.id();
    if !shared.network.is_online() {
        tracing::info!("Offline; waiting for connection before syncing {}", id);
        shared.emit(SyncEvent::WaitingForConnection { id: id.to_string() });
        if !shared
            .network
            .wait_for_connection(shared.config.sync.connection_wait())
            .await
        {
            return Err(RemoteError::Offline);
        }
    }

    shared.emit(SyncEvent::AttemptStarted {
        id: id.to_string(),
        attempt,
    });
    shared.update_sync_in(session, |s| s.begin_remote_call());
    let result = op.send(remote, identity).await;
    shared.update_sync_in(session, |s| s.end_remote_call());
    result
}

fn release_after_grace(shared: Arc<Shared>, session: u64, id: ProjectId, generation: u64) {
    let grace = shared.config.sync.protection_grace();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if shared.update_sync_in(session, |s| s.release_protection(&id, generation)) == Some(true) {
            tracing::debug!("Protection window for {} closed", id);
            shared.emit(SyncEvent::ProtectionCleared { id });
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DeviceProfile;
    use crate::pattern::{PatternItem, StitchInfo};
    use crate::remote::memory::{MemoryRemote, WriteKind};
    use crate::state::StatusIndicator;
    use std::time::Duration;
    use tokio::time::Instant;

    pub(crate) struct Harness {
        pub coordinator: SyncCoordinator,
        pub remote: Arc<MemoryRemote>,
        pub network: Arc<NetworkMonitor>,
        pub identity: Identity,
    }

    pub(crate) async fn signed_in(config: Config) -> Harness {
        let remote = Arc::new(MemoryRemote::new());
        signed_in_with(config, remote, PersistentCache::in_memory()).await
    }

    pub(crate) async fn signed_in_with(
        config: Config,
        remote: Arc<MemoryRemote>,
        cache: PersistentCache,
    ) -> Harness {
        let network = Arc::new(NetworkMonitor::new(true));
        let coordinator = SyncCoordinator::new(
            config,
            cache,
            Some(Arc::clone(&remote) as Arc<dyn RemoteDocumentService>),
            Arc::clone(&network),
        );
        let identity = Identity::new("knitter");
        coordinator.init(Some(identity.clone())).await;
        // Let the subscription take its initial snapshot
        tokio::time::sleep(Duration::from_millis(1)).await;
        Harness {
            coordinator,
            remote,
            network,
            identity,
        }
    }

    pub(crate) async fn next_event(
        events: &mut broadcast::Receiver<SyncEvent>,
        matches: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        let wait = async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if matches(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .expect("timed out waiting for event")
    }

    fn is_write_event(event: &SyncEvent) -> bool {
        !matches!(
            event,
            SyncEvent::RemoteAdmitted { .. } | SyncEvent::RemoteDropped { .. }
        )
    }

    fn single_round_project() -> Project {
        let mut project = Project::new("Scenario");
        project.id = "p1".to_string();
        project.current_chart_mut().unwrap().add_round();
        project
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edit_is_visible_before_remote_write_completes() {
        let h = signed_in(Config::default()).await;
        let project = single_round_project();
        h.coordinator.apply_local(project.clone()).await.unwrap();
        h.coordinator.set_current("p1");
        h.remote.set_latency(Duration::from_secs(2));
        let before_writes = h.remote.attempts().len();

        let mut edited = project.clone();
        edited.current_chart_mut().unwrap().rounds[0]
            .stitches
            .push(PatternItem::Stitch(StitchInfo::new("k", 1)));
        let start = Instant::now();
        let handle = h.coordinator.apply_local(edited);

        let current = h.coordinator.current().unwrap();
        assert_eq!(current.current_chart().unwrap().rounds[0].stitches.len(), 1);
        assert!(current.last_modified >= project.last_modified);
        assert_eq!(h.remote.attempts().len(), before_writes);
        assert!(h.coordinator.sync_state().is_locally_updating);

        assert_eq!(handle.await.unwrap(), SyncOutcome::Synced);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(h.remote.attempts().len(), before_writes + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_never_rolls_back_local_state() {
        let h = signed_in(Config::default()).await;
        h.remote.fail_next_n(4, || RemoteError::Unavailable("503".into()));

        let mut project = Project::new("Never lost");
        project.name = "Renamed locally".to_string();
        let id = project.id.clone();
        let outcome = h.coordinator.apply_local(project).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Failed { offline: false, .. }));
        assert_eq!(h.coordinator.project(&id).unwrap().name, "Renamed locally");
        let state = h.coordinator.sync_state();
        assert_eq!(state.error.as_deref(), Some(FAILED_MESSAGE));
        assert!(!state.is_locally_updating);
        assert!(state.is_protected(&id));
        assert!(h.remote.project(&h.identity, &id).is_none());

        // The error clears itself; the protection does not
        tokio::time::sleep(Duration::from_secs(6)).await;
        let state = h.coordinator.sync_state();
        assert!(state.error.is_none());
        assert!(state.is_protected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_back_off_exponentially_then_succeed() {
        let h = signed_in(Config::default()).await;
        let mut events = h.coordinator.events();
        h.remote.fail_next_n(3, || RemoteError::Timeout);

        let project = Project::new("Flaky");
        let id = project.id.clone();
        let outcome = h.coordinator.apply_local(project).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Synced);

        let state = h.coordinator.sync_state();
        assert!(state.error.is_none());
        assert!(state.message.is_none());
        assert!(state.last_sync_time.is_some());

        let attempts: Vec<_> = h
            .remote
            .attempts()
            .into_iter()
            .filter(|a| a.project_id == id)
            .collect();
        assert_eq!(attempts.len(), 4);
        assert!(attempts[3].succeeded);
        let gaps: Vec<_> = attempts.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        let mut retries = Vec::new();
        while retries.len() < 3 {
            if let SyncEvent::Retrying { retry, max_retries, .. } =
                next_event(&mut events, |e| matches!(e, SyncEvent::Retrying { .. })).await
            {
                retries.push((retry, max_retries));
            }
        }
        assert_eq!(retries, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mobile_profile_uses_longer_backoff() {
        let config = Config {
            device: DeviceProfile::mobile(),
            ..Config::default()
        };
        let h = signed_in(config).await;
        h.remote.fail_next(RemoteError::Timeout);

        let project = Project::new("Phone");
        let id = project.id.clone();
        h.coordinator.apply_local(project).await.unwrap();

        let attempts: Vec<_> = h
            .remote
            .attempts()
            .into_iter()
            .filter(|a| a.project_id == id)
            .collect();
        assert_eq!(attempts[1].at - attempts[0].at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_status_message_is_transient() {
        let h = signed_in(Config::default()).await;
        h.remote.fail_next(RemoteError::Timeout);
        let mut events = h.coordinator.events();

        let handle = h.coordinator.apply_local(Project::new("Message"));
        next_event(&mut events, |e| matches!(e, SyncEvent::Retrying { .. })).await;
        let message = h.coordinator.sync_state().message.unwrap();
        assert_eq!(message.message, "Sync failed, retrying (1/3)...");
        assert!(!message.is_error);

        next_event(&mut events, |e| matches!(e, SyncEvent::AttemptStarted { attempt: 2, .. })).await;
        assert!(h.coordinator.sync_state().message.is_none());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let h = signed_in(Config::default()).await;
        h.remote.fail_next(RemoteError::PermissionDenied {
            message: "rules".into(),
            transient: false,
        });

        let project = Project::new("Forbidden");
        let id = project.id.clone();
        let outcome = h.coordinator.apply_local(project).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Failed { offline: false, .. }));
        let attempts = h.remote.attempts();
        assert_eq!(attempts.iter().filter(|a| a.project_id == id).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_waits_for_connection_before_writing() {
        let h = signed_in(Config::default()).await;
        let mut events = h.coordinator.events();
        h.network.set_online(false);

        let project = Project::new("Offline edit");
        let id = project.id.clone();
        let handle = h.coordinator.apply_local(project);
        assert!(h.coordinator.project(&id).is_some());

        let network = Arc::clone(&h.network);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            network.set_online(true);
        });

        assert_eq!(
            next_event(&mut events, is_write_event).await,
            SyncEvent::LocalApplied { id: id.clone() }
        );
        assert_eq!(
            next_event(&mut events, is_write_event).await,
            SyncEvent::WaitingForConnection { id: id.clone() }
        );
        assert_eq!(
            next_event(&mut events, is_write_event).await,
            SyncEvent::AttemptStarted {
                id: id.clone(),
                attempt: 1
            }
        );
        assert_eq!(handle.await.unwrap(), SyncOutcome::Synced);
        assert!(h.remote.project(&h.identity, &id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staying_offline_fails_with_offline_error_and_keeps_data() {
        let h = signed_in(Config::default()).await;
        h.network.set_online(false);

        let project = Project::new("Stranded");
        let id = project.id.clone();
        let start = Instant::now();
        let outcome = h.coordinator.apply_local(project).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Failed { offline: true, .. }));
        // Four 5 s connection waits plus 1 + 2 + 4 s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(27));
        assert!(h.remote.attempts().iter().all(|a| a.project_id != id));
        assert_eq!(h.coordinator.project(&id).unwrap().name, "Stranded");
        assert_eq!(h.coordinator.sync_state().error.as_deref(), Some(OFFLINE_MESSAGE));
        assert_eq!(h.coordinator.status().borrow().indicator, StatusIndicator::Offline);
        let cached = h.coordinator.shared.cache.load(Some(&h.identity)).unwrap();
        assert!(cached.projects.iter().any(|p| p.id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_edits_keep_latest_and_protect_until_last_write_settles() {
        let h = signed_in(Config::default()).await;
        h.remote.set_latency(Duration::from_secs(2));

        let mut first = Project::new("v1");
        first.id = "p1".to_string();
        let mut second = first.clone();
        second.name = "v2".to_string();

        let a = h.coordinator.apply_local(first);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let b = h.coordinator.apply_local(second);
        assert_eq!(h.coordinator.project("p1").unwrap().name, "v2");

        a.await.unwrap();
        b.await.unwrap();
        // Second write concluded at 2.5 s; its grace ends at 5.5 s
        tokio::time::sleep(Duration::from_millis(2700)).await;
        assert!(h.coordinator.sync_state().is_protected("p1"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!h.coordinator.sync_state().is_protected("p1"));
        assert_eq!(h.coordinator.project("p1").unwrap().name, "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_mode_stays_local() {
        let network = Arc::new(NetworkMonitor::new(true));
        let remote = Arc::new(MemoryRemote::new());
        let coordinator = SyncCoordinator::new(
            Config::default(),
            PersistentCache::in_memory(),
            Some(Arc::clone(&remote) as Arc<dyn RemoteDocumentService>),
            network,
        );
        coordinator.init(None).await;

        let (id, handle) = coordinator.create_project("Guest hat");
        assert_eq!(handle.await.unwrap(), SyncOutcome::LocalOnly);
        assert_eq!(coordinator.current().unwrap().id, id);
        assert!(remote.attempts().is_empty());
        let state = coordinator.sync_state();
        assert!(!state.is_locally_updating);
        assert!(!state.is_protected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_delete_project() {
        let h = signed_in(Config::default()).await;

        let (id, handle) = h.coordinator.create_project("Cardigan");
        assert_eq!(h.coordinator.current().unwrap().id, id);
        assert_eq!(handle.await.unwrap(), SyncOutcome::Synced);
        assert_eq!(h.remote.attempts().last().unwrap().kind, WriteKind::Create);

        let handle = h.coordinator.delete_project(&id).unwrap();
        assert!(h.coordinator.project(&id).is_none());
        assert!(h.coordinator.current().is_none());
        assert!(h.coordinator.sync_state().is_protected(&id));
        assert_eq!(handle.await.unwrap(), SyncOutcome::Synced);
        assert!(h.remote.project(&h.identity, &id).is_none());

        assert!(h.coordinator.delete_project("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_current_edits_selected_project() {
        let h = signed_in(Config::default()).await;
        assert!(h.coordinator.update_current(|_| {}).is_none());

        let (id, created) = h.coordinator.create_project("Shawl");
        created.await.unwrap();
        let handle = h
            .coordinator
            .update_current(|p| {
                p.current_chart_mut().unwrap().add_round();
            })
            .unwrap();
        assert_eq!(h.coordinator.project(&id).unwrap().current_chart().unwrap().rounds.len(), 1);
        assert_eq!(handle.await.unwrap(), SyncOutcome::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_current_unknown_id_is_ignored() {
        let h = signed_in(Config::default()).await;
        let (id, _) = h.coordinator.create_project("Selected");
        h.coordinator.set_current("nope");
        assert_eq!(h.coordinator.current().unwrap().id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_sync_rewrites_every_project_without_restamping() {
        let h = signed_in(Config::default()).await;
        let (a, first) = h.coordinator.create_project("A");
        let (b, second) = h.coordinator.create_project("B");
        first.await.unwrap();
        second.await.unwrap();
        let stamped = h.coordinator.project(&a).unwrap().last_modified;
        let before = h.remote.attempts().len();

        assert_eq!(h.coordinator.force_sync().await.unwrap(), SyncOutcome::Synced);

        let attempts = h.remote.attempts();
        assert_eq!(attempts.len(), before + 2);
        assert!(attempts[before..].iter().any(|w| w.project_id == a));
        assert!(attempts[before..].iter().any(|w| w.project_id == b));
        assert_eq!(h.coordinator.project(&a).unwrap().last_modified, stamped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_merges_cache_with_remote_and_uploads_newer_local() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = PersistentCache::in_memory();
        let me = Identity::new("knitter");

        let mut shared_project = Project::new("Both places");
        let mut remote_copy = shared_project.clone();
        remote_copy.last_modified = shared_project.last_modified - chrono::Duration::minutes(5);
        shared_project.name = "Newer locally".to_string();
        let only_local = Project::new("Made offline");
        let only_remote = Project::new("From the laptop");

        cache
            .save(
                Some(&me),
                &Snapshot::new(
                    vec![shared_project.clone(), only_local.clone()],
                    Some(only_local.id.clone()),
                    None,
                ),
            )
            .unwrap();
        remote.seed(
            &me,
            vec![remote_copy.into(), only_remote.clone().into()],
        );

        let h = signed_in_with(Config::default(), Arc::clone(&remote), cache).await;

        let names: Vec<_> = h.coordinator.projects().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["Newer locally", "From the laptop", "Made offline"]);
        assert_eq!(h.coordinator.current().unwrap().id, only_local.id);
        assert!(h.coordinator.sync_state().last_sync_time.is_some());
        assert!(h.remote.offline_support());

        // Let the uploads run
        tokio::time::sleep(Duration::from_millis(10)).await;
        let uploaded: HashSet<_> = h.remote.attempts().into_iter().map(|a| a.project_id).collect();
        assert!(uploaded.contains(&shared_project.id));
        assert!(uploaded.contains(&only_local.id));
        assert!(!uploaded.contains(&only_remote.id));
        match h.remote.project(&me, &shared_project.id).unwrap() {
            StoredProject::Current(p) => assert_eq!(p.name, "Newer locally"),
            StoredProject::Legacy(_) => panic!("expected current document"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_migrates_legacy_remote_documents() {
        let remote = Arc::new(MemoryRemote::new());
        let me = Identity::new("knitter");
        let legacy: StoredProject = serde_json::from_str(
            r#"{
                "id": "legacy-1",
                "name": "Old pattern",
                "created_at": "2021-01-01T00:00:00Z",
                "last_modified": "2021-01-02T00:00:00Z",
                "pattern": [{"id": "r1", "number": 1}, {"id": "r2", "number": 2}]
            }"#,
        )
        .unwrap();
        remote.seed(&me, vec![legacy]);

        let h = signed_in_with(Config::default(), remote, PersistentCache::in_memory()).await;
        let project = h.coordinator.project("legacy-1").unwrap();
        assert_eq!(project.current_chart().unwrap().rounds.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_keeps_cached_data() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_reachable(false);
        let cache = PersistentCache::in_memory();
        let me = Identity::new("knitter");
        let cached = Project::new("Cached only");
        cache
            .save(Some(&me), &Snapshot::new(vec![cached.clone()], None, None))
            .unwrap();

        let h = signed_in_with(Config::default(), remote, cache).await;
        assert_eq!(h.coordinator.projects().len(), 1);
        assert_eq!(h.coordinator.sync_state().error.as_deref(), Some(OFFLINE_MESSAGE));
        assert!(h.coordinator.sync_state().last_sync_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_resets_session() {
        let h = signed_in(Config::default()).await;
        h.remote.set_latency(Duration::from_secs(1));
        let (_, handle) = h.coordinator.create_project("Signing out");

        h.coordinator.teardown();
        assert!(h.coordinator.projects().is_empty());
        assert!(h.coordinator.identity().is_none());
        let state = h.coordinator.sync_state();
        assert!(!state.is_locally_updating);
        assert!(state.recent_local_changes.is_empty());

        // The in-flight write finishes without resurrecting session state
        handle.await.unwrap();
        let state = h.coordinator.sync_state();
        assert!(state.last_sync_time.is_none());
        assert_eq!(state.writes_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reflects_network_transitions() {
        let h = signed_in(Config::default()).await;
        let status = h.coordinator.status();
        assert_eq!(status.borrow().indicator, StatusIndicator::Synced);

        h.network.set_online(false);
        assert_eq!(status.borrow().indicator, StatusIndicator::Offline);
        h.network.set_online(true);
        assert_eq!(status.borrow().indicator, StatusIndicator::Synced);
    }

    fn coordinator_with(remote: &Arc<MemoryRemote>) -> SyncCoordinator {
        SyncCoordinator::new(
            Config::default(),
            PersistentCache::in_memory(),
            Some(Arc::clone(remote) as Arc<dyn RemoteDocumentService>),
            Arc::new(NetworkMonitor::new(true)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_init_discards_fetched_projects() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = Identity::new("alice");
        remote.seed(&alice, vec![Project::new("Alice's secret").into()]);
        remote.set_latency(Duration::from_secs(2));
        let coordinator = coordinator_with(&remote);

        let signing_in = coordinator.clone();
        let who = alice.clone();
        let init = tokio::spawn(async move { signing_in.init(Some(who)).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        coordinator.teardown();
        init.await.unwrap();

        assert!(coordinator.projects().is_empty());
        assert!(coordinator.identity().is_none());
        assert!(coordinator.sync_state().last_sync_time.is_none());
        assert!(lock(&coordinator.shared.subscription).is_none());
        assert!(coordinator.shared.cache.load(Some(&alice)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_drops_guest_projects() {
        let remote = Arc::new(MemoryRemote::new());
        let coordinator = coordinator_with(&remote);
        coordinator.init(None).await;
        let (guest_id, handle) = coordinator.create_project("Guest scarf");
        assert_eq!(handle.await.unwrap(), SyncOutcome::LocalOnly);

        let bob = Identity::new("bob");
        coordinator.init(Some(bob.clone())).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(coordinator.project(&guest_id).is_none());
        assert!(remote.project(&bob, &guest_id).is_none());
        assert!(remote.attempts().is_empty());
        let cached = coordinator.shared.cache.load(Some(&bob)).unwrap();
        assert!(cached.projects.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cache_matches_store_after_concurrent_edits() {
        let h = signed_in(Config::default()).await;

        let mut editors = Vec::new();
        for editor in 0..4 {
            let coordinator = h.coordinator.clone();
            editors.push(tokio::spawn(async move {
                let mut writes = Vec::new();
                for n in 0..25 {
                    writes.push(coordinator.apply_local(Project::new(format!("{}-{}", editor, n))));
                    tokio::task::yield_now().await;
                }
                writes
            }));
        }
        for editor in editors {
            for write in editor.await.unwrap() {
                assert_eq!(write.await.unwrap(), SyncOutcome::Synced);
            }
        }

        let snapshot = h.coordinator.shared.cache.load(Some(&h.identity)).unwrap();
        let mut cached: Vec<_> = snapshot
            .projects
            .iter()
            .map(|p| (p.id.clone(), p.last_modified))
            .collect();
        let mut stored: Vec<_> = h
            .coordinator
            .projects()
            .iter()
            .map(|p| (p.id.clone(), p.last_modified))
            .collect();
        cached.sort();
        stored.sort();
        assert_eq!(stored.len(), 100);
        assert_eq!(cached, stored);
    }
}
