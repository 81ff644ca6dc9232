//! Capture resources
//!
//! A capture is a declarative request to observe flows on whichever topology
//! nodes match its traversal expression. The registry exposes a snapshot
//! (`index`) and an asynchronous watch that replays existing state on
//! subscription, which is what the on-demand dispatcher consumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-declared capture resource
///
/// Immutable after creation except for `name` and `description`. Validation
/// (non-empty traversal) happens at the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    /// Unique identifier
    pub uuid: String,
    /// Traversal expression selecting the nodes to capture on
    pub gremlin_query: String,
    /// Optional packet filter handed to the probe backend
    #[serde(default)]
    pub bpf_filter: Option<String>,
    /// Human name
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

impl Capture {
    pub fn new(gremlin_query: impl Into<String>, bpf_filter: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            gremlin_query: gremlin_query.into(),
            bpf_filter,
            name: None,
            description: None,
        }
    }
}

/// Registry watcher actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchAction {
    /// Replay of an existing resource on subscription
    Init,
    Create,
    Set,
    Update,
    Expire,
    Delete,
}

impl WatchAction {
    /// Actions the dispatcher treats as "capture added"
    pub fn is_added(self) -> bool {
        matches!(self, Self::Init | Self::Create | Self::Set | Self::Update)
    }

    /// Actions the dispatcher treats as "capture removed"
    pub fn is_removed(self) -> bool {
        matches!(self, Self::Expire | Self::Delete)
    }
}

/// Watcher callback: `(action, resource id, resource)`
pub type WatcherCallback = Arc<dyn Fn(WatchAction, &str, &Capture) + Send + Sync>;

type WatcherMap = Mutex<HashMap<u64, WatcherCallback>>;

/// Stoppable handle returned by [`CaptureHandler::async_watch`]
pub struct WatcherHandle {
    id: u64,
    watchers: Weak<WatcherMap>,
}

impl WatcherHandle {
    /// Detach the watcher; subsequent registry events are no longer delivered
    pub fn stop(&self) {
        if let Some(watchers) = self.watchers.upgrade() {
            watchers.lock().remove(&self.id);
        }
    }
}

/// Read/watch contract the dispatcher consumes from the API layer
pub trait CaptureHandler: Send + Sync {
    /// Snapshot of the current captures
    fn index(&self) -> Vec<Capture>;
    /// Subscribe to registry events; existing resources are replayed with
    /// [`WatchAction::Init`] before the handle is returned
    fn async_watch(&self, callback: WatcherCallback) -> WatcherHandle;
}

/// In-memory capture registry backing the local API
pub struct CaptureApiHandler {
    captures: RwLock<HashMap<String, Capture>>,
    watchers: Arc<WatcherMap>,
    next_watcher: AtomicU64,
}

impl CaptureApiHandler {
    pub fn new() -> Self {
        Self {
            captures: RwLock::new(HashMap::new()),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_watcher: AtomicU64::new(1),
        }
    }

    /// Insert a capture and notify watchers
    pub fn create(&self, capture: Capture) -> Capture {
        self.captures
            .write()
            .insert(capture.uuid.clone(), capture.clone());
        self.notify(WatchAction::Create, &capture);
        capture
    }

    pub fn get(&self, uuid: &str) -> Option<Capture> {
        self.captures.read().get(uuid).cloned()
    }

    /// Update the mutable attributes of a capture and notify watchers
    pub fn update(
        &self,
        uuid: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Option<Capture> {
        let updated = {
            let mut captures = self.captures.write();
            let capture = captures.get_mut(uuid)?;
            if name.is_some() {
                capture.name = name;
            }
            if description.is_some() {
                capture.description = description;
            }
            capture.clone()
        };
        self.notify(WatchAction::Update, &updated);
        Some(updated)
    }

    /// Remove a capture and notify watchers
    pub fn delete(&self, uuid: &str) -> Option<Capture> {
        let removed = self.captures.write().remove(uuid)?;
        self.notify(WatchAction::Delete, &removed);
        Some(removed)
    }

    fn notify(&self, action: WatchAction, capture: &Capture) {
        let callbacks: Vec<WatcherCallback> = self.watchers.lock().values().cloned().collect();
        for callback in callbacks {
            callback(action, &capture.uuid, capture);
        }
    }
}

impl Default for CaptureApiHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureHandler for CaptureApiHandler {
    fn index(&self) -> Vec<Capture> {
        self.captures.read().values().cloned().collect()
    }

    fn async_watch(&self, callback: WatcherCallback) -> WatcherHandle {
        for capture in self.index() {
            callback(WatchAction::Init, &capture.uuid, &capture);
        }
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().insert(id, callback);
        WatcherHandle {
            id,
            watchers: Arc::downgrade(&self.watchers),
        }
    }
}
