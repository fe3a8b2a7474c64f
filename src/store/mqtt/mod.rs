//! Realtime store over an MQTT broker.
//!
//! Documents are retained messages, so a fresh subscriber immediately gets
//! the latest state and every later publish is pushed as it happens. The
//! broker connection is driven by [`MqttEventLoop::run`], which must be
//! spawned next to the store.
//!
//! MQTT has no "not found": a document is reported absent only when the
//! broker acknowledged the subscription on a live connection and no retained
//! payload followed within the absence timeout.

pub mod topics;

use super::{RemoteStateStore, StoreEvent, StoreEvents, StorePath};
use crate::config::MqttConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One subscriber of one document topic.
struct Route {
    id: u64,
    topic: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
    /// Something was reported to this subscriber on the current connection.
    seen: bool,
    /// Pending absence report.
    absence: Option<CancellationToken>,
}

/// State shared by the store and its event loop.
#[derive(Default)]
struct Shared {
    connected: bool,
    next_id: u64,
    routes: Vec<Route>,
    /// Topics of subscribe requests not yet sent, in request order.
    requested: VecDeque<String>,
    /// Topics of sent subscribe requests, by packet id.
    in_flight: HashMap<u16, String>,
    /// Latest state of each subscribed topic on the current connection.
    /// `None` means the broker has no document there.
    documents: HashMap<String, Option<Value>>,
}

impl Shared {
    fn request_subscribe(
        &mut self,
        client: &AsyncClient,
        topic: &str,
    ) -> Result<(), TransportError> {
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.requested.push_back(topic.to_string());
        Ok(())
    }

    /// Forget subscribers that went away and unsubscribe topics nobody
    /// observes any more.
    fn prune(&mut self, client: &AsyncClient) {
        let mut closed = Vec::new();
        self.routes.retain(|route| {
            if !route.tx.is_closed() {
                return true;
            }
            if let Some(absence) = &route.absence {
                absence.cancel();
            }
            closed.push(route.topic.clone());
            false
        });

        closed.sort_unstable();
        closed.dedup();
        for topic in closed {
            if self.routes.iter().any(|r| r.topic == topic) {
                continue;
            }
            self.documents.remove(&topic);
            debug!("[Store] Unsubscribing from {}", topic);
            if let Err(e) = client.try_unsubscribe(&topic) {
                warn!("[Store] Failed to unsubscribe from {}: {}", topic, e);
            }
        }
    }
}

/// Report the document of `route` absent unless something arrives first.
fn arm_absence(shared: &Arc<Mutex<Shared>>, route: &mut Route, timeout: Duration) {
    let token = CancellationToken::new();
    route.absence = Some(token.clone());

    let shared = shared.clone();
    let id = route.id;
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(timeout) => {}
        }

        let mut shared = shared.lock();
        if token.is_cancelled() || !shared.connected {
            return;
        }
        let Some(route) = shared.routes.iter_mut().find(|r| r.id == id) else {
            return;
        };
        route.absence = None;
        if route.seen {
            return;
        }
        route.seen = true;
        debug!("[Store] No retained document on {}", route.topic);
        let _ = route.tx.send(StoreEvent::Snapshot(None));
        let topic = route.topic.clone();
        shared.documents.entry(topic).or_insert(None);
    });
}

/// [`RemoteStateStore`] backed by retained MQTT messages.
pub struct MqttStore {
    client: AsyncClient,
    prefix: String,
    /// The device document. Writes below it update that document.
    document: StorePath,
    shared: Arc<Mutex<Shared>>,
}

impl MqttStore {
    /// Create the store for the device document at `document`, and the
    /// event loop that drives its connection.
    pub fn new(config: &MqttConfig, document: StorePath) -> (Self, MqttEventLoop) {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let shared: Arc<Mutex<Shared>> = Arc::default();

        let store = Self {
            client: client.clone(),
            prefix: config.topic_prefix.clone(),
            document,
            shared: shared.clone(),
        };
        let event_loop = MqttEventLoop {
            client,
            event_loop,
            absence_timeout: config.absence_timeout(),
            shared,
        };
        (store, event_loop)
    }

    /// Topic and full retained document for a write of `value` at `path`.
    ///
    /// Writes at or below the device document always land on the document
    /// topic. A field write needs the current document, so it is rejected
    /// until the broker delivered it (or confirmed it absent).
    fn write_target(
        &self,
        documents: &HashMap<String, Option<Value>>,
        path: &StorePath,
        value: Value,
    ) -> Result<(String, Value), TransportError> {
        let Some(relative) = path.relative_to(&self.document) else {
            return Ok((topics::document_topic(&self.prefix, path), value));
        };

        let topic = topics::document_topic(&self.prefix, &self.document);
        if relative.is_empty() {
            return Ok((topic, value));
        }
        let Some(current) = documents.get(&topic) else {
            return Err(TransportError::WriteRejected {
                path: path.to_string(),
                reason: "device document not received yet".to_string(),
            });
        };
        let document = topics::merge_field(current.clone(), relative, value);
        Ok((topic, document))
    }
}

#[async_trait]
impl RemoteStateStore for MqttStore {
    async fn subscribe(&self, path: &StorePath) -> StoreEvents {
        let topic = topics::document_topic(&self.prefix, path);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();

        info!("[Store] Subscribing to MQTT topic: {}", topic);
        if let Err(e) = shared.request_subscribe(&self.client, &topic) {
            warn!("[Store] Failed to subscribe to {}: {}", topic, e);
            let _ = tx.send(StoreEvent::Error(e));
        }

        let id = shared.next_id;
        shared.next_id += 1;
        shared.routes.push(Route {
            id,
            topic,
            tx,
            seen: false,
            absence: None,
        });
        rx
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), TransportError> {
        // Publishing under the lock keeps field merges in publish order.
        let mut shared = self.shared.lock();
        if !shared.connected {
            return Err(TransportError::Offline);
        }

        let (topic, document) = self.write_target(&shared.documents, path, value)?;
        let payload = topics::encode_document(&document);
        debug!("[Store] Publishing to {}: {}", topic, String::from_utf8_lossy(&payload));
        self.client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, true, payload)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if let Some(known) = shared.documents.get_mut(&topic) {
            *known = (!document.is_null()).then_some(document);
        }
        Ok(())
    }
}

/// Drives the broker connection and fans incoming documents out to
/// subscribers.
pub struct MqttEventLoop {
    client: AsyncClient,
    event_loop: EventLoop,
    absence_timeout: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl MqttEventLoop {
    /// Run the MQTT event loop.
    ///
    /// Runs until the task is aborted. Connection errors are reported to
    /// every subscriber and the connection is retried after a pause; on
    /// reconnect all topics are subscribed again so retained state is pushed
    /// anew.
    pub async fn run(mut self) {
        info!("[Store] Starting MQTT event loop");
        let mut lost_connection = false;

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[Store] Connected to MQTT broker");
                    self.connected(lost_connection);
                    lost_connection = false;
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.subscribe_sent(pkid),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = ack
                        .return_codes
                        .iter()
                        .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                    self.subscribe_acked(ack.pkid, granted);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[Store] MQTT connection error: {:?}", e);
                    lost_connection = true;
                    self.connection_lost(TransportError::Connection(e.to_string()));
                    // Wait before reconnecting
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    fn connected(&self, resubscribe: bool) {
        let mut shared = self.shared.lock();
        shared.connected = true;
        if resubscribe {
            self.resubscribe(&mut shared);
        }
    }

    fn subscribe_sent(&self, pkid: u16) {
        let mut shared = self.shared.lock();
        match shared.requested.pop_front() {
            Some(topic) => {
                shared.in_flight.insert(pkid, topic);
            }
            None => debug!("[Store] Untracked subscribe request {}", pkid),
        }
    }

    fn subscribe_acked(&self, pkid: u16, granted: bool) {
        let mut guard = self.shared.lock();
        let Some(topic) = guard.in_flight.remove(&pkid) else {
            return;
        };
        let shared = &mut *guard;

        if !granted {
            warn!("[Store] Broker refused subscription to {}", topic);
            for route in shared.routes.iter().filter(|r| r.topic == topic) {
                let _ = route.tx.send(StoreEvent::Error(TransportError::Connection(format!(
                    "subscription to {topic} refused"
                ))));
            }
            return;
        }
        if !shared.connected {
            return;
        }

        debug!("[Store] Subscribed to {}", topic);
        for route in shared.routes.iter_mut() {
            if route.topic == topic && !route.seen && route.absence.is_none() {
                arm_absence(&self.shared, route, self.absence_timeout);
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let document = match topics::decode_document(payload) {
            Ok(document) => document,
            Err(e) => {
                warn!("[Store] Ignoring invalid JSON on {}: {}", topic, e);
                return;
            }
        };
        debug!("[Store] Received document on {}", topic);

        let mut guard = self.shared.lock();
        guard.prune(&self.client);
        let shared = &mut *guard;

        let mut delivered = false;
        for route in shared.routes.iter_mut().filter(|r| r.topic == topic) {
            if let Some(absence) = route.absence.take() {
                absence.cancel();
            }
            route.seen = true;
            delivered = true;
            let _ = route.tx.send(StoreEvent::Snapshot(document.clone()));
        }
        if delivered {
            shared.documents.insert(topic.to_string(), document);
        }
    }

    /// Report the loss to every subscriber and forget everything learnt on
    /// the connection.
    fn connection_lost(&self, error: TransportError) {
        let mut guard = self.shared.lock();
        guard.prune(&self.client);
        let shared = &mut *guard;

        shared.connected = false;
        shared.in_flight.clear();
        shared.documents.clear();
        for route in shared.routes.iter_mut() {
            if let Some(absence) = route.absence.take() {
                absence.cancel();
            }
            route.seen = false;
            let _ = route.tx.send(StoreEvent::Error(error.clone()));
        }
    }

    fn resubscribe(&self, shared: &mut Shared) {
        shared.prune(&self.client);
        let mut topics: Vec<String> = shared.routes.iter().map(|r| r.topic.clone()).collect();
        topics.sort_unstable();
        topics.dedup();
        for topic in topics {
            info!("[Store] Re-subscribing to {}", topic);
            if let Err(e) = shared.request_subscribe(&self.client, &topic) {
                warn!("[Store] Failed to re-subscribe to {}: {}", topic, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use tokio::time::timeout;

    fn store(document: StorePath) -> (MqttStore, MqttEventLoop) {
        MqttStore::new(&Config::default().store.mqtt, document)
    }

    fn clamp_store() -> (MqttStore, MqttEventLoop) {
        store(StorePath::root())
    }

    /// Connect and let the broker acknowledge every pending subscription.
    fn ack_all(event_loop: &MqttEventLoop, resubscribe: bool, first_pkid: u16) {
        event_loop.connected(resubscribe);
        let pending = event_loop.shared.lock().requested.len() as u16;
        for pkid in first_pkid..first_pkid + pending {
            event_loop.subscribe_sent(pkid);
            event_loop.subscribe_acked(pkid, true);
        }
    }

    async fn next_event(events: &mut StoreEvents) -> Option<StoreEvent> {
        timeout(Duration::from_secs(10), events.recv()).await.ok().flatten()
    }

    async fn assert_quiet(events: &mut StoreEvents) {
        assert!(timeout(Duration::from_secs(10), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_field_write_merges_into_device_document() {
        let (store, _event_loop) = store(StorePath::device_state("pill-2bd05"));
        let topic = "dashboard/artifacts/pill-2bd05/public/device_state";
        let mut documents = HashMap::new();
        documents.insert(
            topic.to_string(),
            Some(json!({"mode": "manual", "temperature": 21})),
        );

        let mode = StorePath::device_state("pill-2bd05").child("mode");
        assert_eq!(
            store.write_target(&documents, &mode, json!("automatic")),
            Ok((
                topic.to_string(),
                json!({"mode": "automatic", "temperature": 21})
            ))
        );
    }

    #[tokio::test]
    async fn test_field_write_without_subscriber_targets_document_topic() {
        let (store, _event_loop) = clamp_store();
        let mode = StorePath::root().child("mode");

        // Nothing known about the document: the write cannot be merged.
        assert_eq!(
            store.write_target(&HashMap::new(), &mode, json!("monitoring")),
            Err(TransportError::WriteRejected {
                path: "mode".to_string(),
                reason: "device document not received yet".to_string(),
            })
        );

        // Confirmed absent: the field starts a new document on the same topic.
        let documents = HashMap::from([("dashboard".to_string(), None)]);
        assert_eq!(
            store.write_target(&documents, &mode, json!("monitoring")),
            Ok(("dashboard".to_string(), json!({"mode": "monitoring"})))
        );
    }

    #[tokio::test]
    async fn test_document_write_is_retained_on_its_topic() {
        let (store, _event_loop) = store(StorePath::device_state("pill-2bd05"));
        let other = StorePath::parse("other/doc");
        assert_eq!(
            store.write_target(&HashMap::new(), &other, json!({"a": 1})),
            Ok(("dashboard/other/doc".to_string(), json!({"a": 1})))
        );

        let path = StorePath::device_state("pill-2bd05");
        assert_eq!(
            store.write_target(&HashMap::new(), &path, json!({"mode": "manual"})),
            Ok((
                "dashboard/artifacts/pill-2bd05/public/device_state".to_string(),
                json!({"mode": "manual"})
            ))
        );
    }

    #[tokio::test]
    async fn test_set_while_offline_fails() {
        let (store, _event_loop) = clamp_store();
        assert_eq!(
            store.set(&StorePath::root(), json!({"mode": "measurement"})).await,
            Err(TransportError::Offline)
        );
    }

    #[tokio::test]
    async fn test_consecutive_field_writes_compose() {
        let (store, event_loop) = clamp_store();
        let _events = store.subscribe(&StorePath::root()).await;
        ack_all(&event_loop, false, 1);
        event_loop.dispatch("dashboard", br#"{"mode":"measurement","current_now":"0.000"}"#);

        let root = StorePath::root();
        tokio_test::assert_ok!(store.set(&root.child("current_now"), json!("0.0711")).await);
        tokio_test::assert_ok!(store.set(&root.child("mode"), json!("monitoring")).await);

        assert_eq!(
            store.shared.lock().documents.get("dashboard"),
            Some(&Some(json!({"mode": "monitoring", "current_now": "0.0711"})))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_absence_before_subscription_is_acknowledged() {
        let (store, event_loop) = clamp_store();
        let mut events = store.subscribe(&StorePath::root()).await;

        // Broker unreachable: nothing may claim the document is missing.
        assert_quiet(&mut events).await;

        ack_all(&event_loop, false, 1);
        assert_eq!(next_event(&mut events).await, Some(StoreEvent::Snapshot(None)));
        assert_eq!(
            store.shared.lock().documents.get("dashboard"),
            Some(&None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_document_cancels_absence() {
        let (store, event_loop) = clamp_store();
        let mut events = store.subscribe(&StorePath::root()).await;
        ack_all(&event_loop, false, 1);

        event_loop.dispatch("dashboard", br#"{"current_now":"0.5"}"#);
        assert_eq!(
            next_event(&mut events).await,
            Some(StoreEvent::Snapshot(Some(json!({"current_now": "0.5"}))))
        );
        assert_quiet(&mut events).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_cancels_absence() {
        let (store, event_loop) = clamp_store();
        let mut events = store.subscribe(&StorePath::root()).await;
        ack_all(&event_loop, false, 1);

        event_loop.connection_lost(TransportError::Connection("refused".to_string()));
        assert!(matches!(next_event(&mut events).await, Some(StoreEvent::Error(_))));
        assert_quiet(&mut events).await;
        assert_eq!(
            store.set(&StorePath::root(), json!({})).await,
            Err(TransportError::Offline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_absence_is_reported_again_after_reconnect() {
        let (store, event_loop) = clamp_store();
        let mut events = store.subscribe(&StorePath::root()).await;
        ack_all(&event_loop, false, 1);
        assert_eq!(next_event(&mut events).await, Some(StoreEvent::Snapshot(None)));

        event_loop.connection_lost(TransportError::Connection("reset".to_string()));
        assert!(matches!(next_event(&mut events).await, Some(StoreEvent::Error(_))));

        ack_all(&event_loop, true, 2);
        assert_eq!(next_event(&mut events).await, Some(StoreEvent::Snapshot(None)));
    }

    #[tokio::test]
    async fn test_refused_subscription_is_an_error() {
        let (store, event_loop) = clamp_store();
        let mut events = store.subscribe(&StorePath::root()).await;
        event_loop.connected(false);
        event_loop.subscribe_sent(7);
        event_loop.subscribe_acked(7, false);
        assert!(matches!(events.recv().await, Some(StoreEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_topic() {
        let (store, event_loop) = clamp_store();
        let mut doc_events = store.subscribe(&StorePath::root()).await;
        let mut other_events = store.subscribe(&StorePath::parse("x")).await;

        event_loop.dispatch("dashboard", br#"{"current_now":"0.5"}"#);
        assert_eq!(
            doc_events.recv().await,
            Some(StoreEvent::Snapshot(Some(json!({"current_now": "0.5"}))))
        );
        assert!(other_events.try_recv().is_err());

        event_loop.dispatch("dashboard", b"");
        assert_eq!(doc_events.recv().await, Some(StoreEvent::Snapshot(None)));

        // garbage is dropped, not forwarded
        event_loop.dispatch("dashboard", b"{oops");
        assert!(doc_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_errors_reach_every_subscriber() {
        let (store, event_loop) = clamp_store();
        let mut a_events = store.subscribe(&StorePath::root()).await;
        let mut b_events = store.subscribe(&StorePath::parse("x")).await;

        event_loop.connection_lost(TransportError::Connection("refused".to_string()));
        assert!(matches!(a_events.recv().await, Some(StoreEvent::Error(_))));
        assert!(matches!(b_events.recv().await, Some(StoreEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let (store, event_loop) = clamp_store();
        let events = store.subscribe(&StorePath::root()).await;
        drop(events);

        event_loop.dispatch("dashboard", b"{}");
        assert!(event_loop.shared.lock().routes.is_empty());
        assert!(!event_loop.shared.lock().documents.contains_key("dashboard"));
    }
}
