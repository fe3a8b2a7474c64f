//! Realtime document store seam.
//!
//! The store holds JSON documents addressed by slash-separated paths. A
//! subscriber gets a snapshot of its path on subscribe and again after every
//! mutation of that path, its own writes included.

mod memory;
pub mod mqtt;

pub use memory::InMemoryStore;
pub use mqtt::{MqttEventLoop, MqttStore};

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;

/// Location of a document (or a field inside one) in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The store root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path like `artifacts/app/public/device_state`. Empty segments
    /// are ignored, so `/` and `` are both the root.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Public device-state document of an application.
    pub fn device_state(application_id: &str) -> Self {
        Self::parse(&format!("artifacts/{application_id}/public/device_state"))
    }

    pub fn child(&self, segment: &str) -> Self {
        let mut child = self.clone();
        child.segments.extend(Self::parse(segment).segments);
        child
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &StorePath) -> bool {
        self.segments.starts_with(&ancestor.segments)
    }

    /// Segments of `self` below `ancestor`, if it is one.
    pub fn relative_to(&self, ancestor: &StorePath) -> Option<&[String]> {
        self.segments.strip_prefix(ancestor.segments.as_slice())
    }

    /// True if a write to one path changes what a subscriber of the other sees.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

/// Notification pushed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Current value of the subscribed path; `None` if nothing is stored there.
    Snapshot(Option<Value>),
    /// The subscription lost its transport. It stays open and resumes with a
    /// snapshot once the transport is back.
    Error(TransportError),
}

/// Receiving half of a subscription. Dropping it ends the subscription.
pub type StoreEvents = mpsc::UnboundedReceiver<StoreEvent>;

/// The object at `node`, replacing any non-object value with `{}`.
pub(crate) fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(object) => object,
        _ => unreachable!("node was just replaced by an object"),
    }
}

/// A realtime document store with last-write-wins semantics.
#[async_trait]
pub trait RemoteStateStore: Send + Sync + 'static {
    /// Start observing a path.
    ///
    /// Never fails up front: transport problems arrive as
    /// [`StoreEvent::Error`] on the returned channel.
    async fn subscribe(&self, path: &StorePath) -> StoreEvents;

    /// Replace the value at `path`. Writing `Value::Null` removes it.
    async fn set(&self, path: &StorePath, value: Value) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert!(StorePath::parse("/").is_root());
        assert!(StorePath::parse("").is_root());
        assert_eq!(StorePath::root().to_string(), "/");

        let path = StorePath::device_state("pill-2bd05");
        assert_eq!(path.to_string(), "artifacts/pill-2bd05/public/device_state");
        assert_eq!(path.segments().len(), 4);
        assert_eq!(StorePath::parse("/a//b/").to_string(), "a/b");
    }

    #[test]
    fn test_child_and_relative() {
        let doc = StorePath::device_state("app");
        let mode = doc.child("mode");
        assert_eq!(mode.to_string(), "artifacts/app/public/device_state/mode");
        assert!(mode.starts_with(&doc));
        assert!(!doc.starts_with(&mode));
        assert_eq!(mode.relative_to(&doc), Some(&["mode".to_string()][..]));
        assert_eq!(doc.relative_to(&mode), None);

        let root_child = StorePath::root().child("current_now");
        assert_eq!(root_child.to_string(), "current_now");
        assert!(root_child.starts_with(&StorePath::root()));
    }

    #[test]
    fn test_overlaps() {
        let doc = StorePath::parse("a/b");
        assert!(doc.overlaps(&StorePath::parse("a")));
        assert!(doc.overlaps(&StorePath::parse("a/b/c")));
        assert!(doc.overlaps(&StorePath::root()));
        assert!(!doc.overlaps(&StorePath::parse("a/c")));
    }
}
