//! Process-local sync bookkeeping and what the UI gets to see of it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::project::ProjectId;

/// A moment recorded on both clocks: wall time for display and persistence,
/// monotonic time for cooldown arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    /// Rebuild a stamp from a persisted wall-clock time, placing it the
    /// same distance in the past on the monotonic clock.
    pub fn from_wall(wall: DateTime<Utc>) -> Self {
        let now = Instant::now();
        let age = (Utc::now() - wall).to_std().unwrap_or_default();
        Self {
            wall,
            mono: now.checked_sub(age).unwrap_or(now),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.mono.elapsed()
    }
}

/// Transient, non-error notice (e.g. "retrying (1/3)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub is_error: bool,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub is_syncing: bool,
    pub is_locally_updating: bool,
    pub last_sync_time: Option<Stamp>,
    pub last_local_update_time: Option<Stamp>,
    /// Project id → generation of its most recent local change. An id stays
    /// here until the grace delay after that generation's write concludes.
    pub recent_local_changes: BTreeMap<ProjectId, u64>,
    pub error: Option<String>,
    pub message: Option<StatusMessage>,
    /// Local changes whose background write has not concluded.
    pub(crate) writes_in_flight: usize,
    /// Remote calls currently awaiting a response.
    pub(crate) remote_calls: usize,
    pub(crate) generation: u64,
    pub(crate) error_generation: u64,
}

impl SyncState {
    pub fn is_protected(&self, id: &str) -> bool {
        self.recent_local_changes.contains_key(id)
    }

    /// Record a local change to `id` and return its generation.
    pub(crate) fn mark_local_change(&mut self, id: &str) -> u64 {
        self.generation += 1;
        self.writes_in_flight += 1;
        self.is_locally_updating = true;
        self.last_local_update_time = Some(Stamp::now());
        self.recent_local_changes.insert(id.to_string(), self.generation);
        self.generation
    }

    pub(crate) fn finish_write(&mut self) {
        self.writes_in_flight = self.writes_in_flight.saturating_sub(1);
        self.is_locally_updating = self.writes_in_flight > 0;
    }

    pub(crate) fn begin_remote_call(&mut self) {
        self.remote_calls += 1;
        self.is_syncing = true;
    }

    pub(crate) fn end_remote_call(&mut self) {
        self.remote_calls = self.remote_calls.saturating_sub(1);
        self.is_syncing = self.remote_calls > 0;
    }

    /// Drop the protection for `id` unless a newer local change re-armed it.
    pub(crate) fn release_protection(&mut self, id: &str, generation: u64) -> bool {
        if self.recent_local_changes.get(id) == Some(&generation) {
            self.recent_local_changes.remove(id);
            true
        } else {
            false
        }
    }

    pub(crate) fn set_error(&mut self, error: String) -> u64 {
        self.error_generation += 1;
        self.error = Some(error);
        self.error_generation
    }

    pub(crate) fn clear_error_if(&mut self, generation: u64) -> bool {
        if self.error.is_some() && self.error_generation == generation {
            self.error = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_info(&mut self, message: String) {
        self.message = Some(StatusMessage {
            message,
            is_error: false,
            timestamp: Instant::now(),
        });
    }
}

/// The single glyph a status affordance shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusIndicator {
    Offline,
    Error,
    Syncing,
    Saving,
    Synced,
    Idle,
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub indicator: StatusIndicator,
    pub online: bool,
    pub state: SyncState,
}

impl SyncStatus {
    pub fn from_state(state: &SyncState, online: bool) -> Self {
        let indicator = if !online {
            StatusIndicator::Offline
        } else if state.error.is_some() {
            StatusIndicator::Error
        } else if state.is_syncing {
            StatusIndicator::Syncing
        } else if state.is_locally_updating {
            StatusIndicator::Saving
        } else if state.last_sync_time.is_some() {
            StatusIndicator::Synced
        } else {
            StatusIndicator::Idle
        };
        Self {
            indicator,
            online,
            state: state.clone(),
        }
    }
}

/// Why a remote notification was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SyncInFlight,
    LocalUpdateInFlight,
    ErrorActive,
    NeverSynced,
    SyncCooldown,
    LocalUpdateCooldown,
    /// Every differing project is still inside its local-change window.
    Protected,
    Unchanged,
}

/// Fine-grained progress of the engine, in the order things happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    LocalApplied { id: ProjectId },
    WaitingForConnection { id: ProjectId },
    AttemptStarted { id: ProjectId, attempt: u32 },
    Retrying { id: ProjectId, retry: u32, max_retries: u32, delay: Duration },
    Synced { id: ProjectId },
    Failed { id: ProjectId, offline: bool },
    ProtectionCleared { id: ProjectId },
    RemoteAdmitted { changed: usize },
    RemoteDropped { reason: DropReason },
}

/// How one background write ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No identity or no remote: nothing to do.
    LocalOnly,
    Synced,
    /// Retries exhausted or a non-retryable error; local data kept.
    Failed { offline: bool, error: String },
}
