//! Online/offline tracking.
//!
//! The host pushes connectivity transitions in with [`NetworkMonitor::set_online`]
//! (browser `online`/`offline` events, OS reachability callbacks, ...).
//! Listeners run synchronously inside that call; async code waits on the
//! watch channel instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::lock;

type Listener = Box<dyn Fn(bool) + Send + Sync>;

pub struct NetworkMonitor {
    online: watch::Sender<bool>,
    listeners: Arc<Mutex<BTreeMap<u64, Listener>>>,
    next_listener: AtomicU64,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self {
            online,
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a connectivity transition. Repeating the current state is a
    /// no-op and does not reach listeners.
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        if online {
            tracing::info!("Network connection restored");
        } else {
            tracing::warn!("Network connection lost");
        }
        for listener in lock(&self.listeners).values() {
            listener(online);
        }
    }

    /// Call `callback` on every transition until the returned handle is
    /// dropped or unsubscribed.
    pub fn add_listener(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, Box::new(callback));
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// `true` immediately when online, otherwise `true` on the next online
    /// transition within `timeout`, else `false`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.online.subscribe();
        if *rx.borrow_and_update() {
            return true;
        }
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|online| *online)).await,
            Ok(Ok(_))
        );
        connected
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Mutex<BTreeMap<u64, Listener>>>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(&self.id);
        }
    }
}
