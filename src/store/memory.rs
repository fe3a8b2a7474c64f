//! In-process realtime store.
//!
//! Keeps one JSON tree, pushes snapshots to every overlapping subscriber on
//! each mutation and records the writes made through [`RemoteStateStore`].
//! Transport faults can be injected to exercise the reconnect behaviour.

use super::{RemoteStateStore, StoreEvent, StoreEvents, StorePath, ensure_object};
use crate::error::TransportError;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

struct Subscriber {
    path: StorePath,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    subscribers: Vec<Subscriber>,
    writes: Vec<(StorePath, Value)>,
    reject_reason: Option<String>,
    offline: bool,
}

impl Inner {
    fn get(&self, path: &StorePath) -> Option<Value> {
        let mut node = &self.root;
        for segment in path.segments() {
            node = node.as_object()?.get(segment)?;
        }
        (!node.is_null()).then(|| node.clone())
    }

    fn put(&mut self, path: &StorePath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            self.root = value;
            return;
        };

        if value.is_null() {
            let pointer: String = parents
                .iter()
                .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
                .collect();
            if let Some(parent) = self.root.pointer_mut(&pointer).and_then(Value::as_object_mut) {
                parent.remove(last);
            }
            return;
        }

        let mut node = &mut self.root;
        for segment in parents {
            node = ensure_object(node)
                .entry(segment.clone())
                .or_insert(Value::Null);
        }
        ensure_object(node).insert(last.clone(), value);
    }

    fn notify(&mut self, written: &StorePath) {
        if self.offline {
            return;
        }
        self.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in self.subscribers.iter().filter(|s| s.path.overlaps(written)) {
            let snapshot = self.get(&subscriber.path);
            let _ = subscriber.tx.send(StoreEvent::Snapshot(snapshot));
        }
    }
}

/// Realtime store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a document.
    pub fn with_document(path: &StorePath, value: Value) -> Self {
        let store = Self::new();
        store.inner.lock().put(path, value);
        store
    }

    /// Current value at a path.
    pub fn get(&self, path: &StorePath) -> Option<Value> {
        self.inner.lock().get(path)
    }

    /// Mutate the store as another writer would (e.g. the device itself).
    /// Not recorded in [`writes`](Self::writes).
    pub fn put(&self, path: &StorePath, value: Value) {
        let mut inner = self.inner.lock();
        inner.put(path, value);
        inner.notify(path);
    }

    /// Remove whatever is stored at a path.
    pub fn remove(&self, path: &StorePath) {
        self.put(path, Value::Null);
    }

    /// Writes made through the store trait, in order.
    pub fn writes(&self) -> Vec<(StorePath, Value)> {
        self.inner.lock().writes.clone()
    }

    /// Number of live subscriptions on exactly this path.
    pub fn subscriber_count(&self, path: &StorePath) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.iter().filter(|s| &s.path == path).count()
    }

    /// Reject every following write with the given reason, or accept again
    /// with `None`.
    pub fn reject_writes(&self, reason: Option<&str>) {
        self.inner.lock().reject_reason = reason.map(str::to_string);
    }

    /// Drop the transport: subscribers get an error, writes fail.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.offline = true;
        inner.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in &inner.subscribers {
            let _ = subscriber.tx.send(StoreEvent::Error(TransportError::Connection(
                "connection lost".to_string(),
            )));
        }
    }

    /// Restore the transport and push the current state to every subscriber.
    pub fn reconnect(&self) {
        let mut inner = self.inner.lock();
        inner.offline = false;
        inner.notify(&StorePath::root());
    }
}

#[async_trait]
impl RemoteStateStore for InMemoryStore {
    async fn subscribe(&self, path: &StorePath) -> StoreEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        let first = if inner.offline {
            StoreEvent::Error(TransportError::Offline)
        } else {
            StoreEvent::Snapshot(inner.get(path))
        };
        let _ = tx.send(first);

        debug!("[Store] Subscribed to {}", path);
        inner.subscribers.push(Subscriber {
            path: path.clone(),
            tx,
        });
        rx
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(TransportError::Offline);
        }
        if let Some(reason) = &inner.reject_reason {
            return Err(TransportError::WriteRejected {
                path: path.to_string(),
                reason: reason.clone(),
            });
        }

        debug!("[Store] Set {} = {}", path, value);
        inner.writes.push((path.clone(), value.clone()));
        inner.put(path, value);
        inner.notify(path);
        Ok(())
    }
}
