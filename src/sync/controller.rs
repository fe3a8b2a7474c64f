//! Device state synchronization.
//!
//! [`DeviceSyncController`] owns the local mirror of one remote device
//! record. The mirror only ever changes when the store pushes: local writes
//! are sent and then confirmed by the next push, never merged in directly.

use super::simulation::{Simulation, SimulationScenario};
use super::subscription::Subscription;
use crate::device::{ClampMode, ConnectionStatus, DeviceMode, DeviceRecord};
use crate::error::{Result, TransportError};
use crate::store::{RemoteStateStore, StoreEvent, StoreEvents, StorePath};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Keeps a local mirror of the device record at one store path and turns
/// user intents into store writes.
pub struct DeviceSyncController<M: DeviceMode> {
    store: Arc<dyn RemoteStateStore>,
    path: StorePath,
    record: Arc<watch::Sender<Option<DeviceRecord<M>>>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    scenario: SimulationScenario,
    simulation: Simulation,
}

impl<M: DeviceMode> DeviceSyncController<M> {
    /// Create a controller for the record at `path`.
    ///
    /// Nothing is observed until [`subscribe`](Self::subscribe) is called.
    pub fn new(store: Arc<dyn RemoteStateStore>, path: StorePath) -> Self {
        let (record, _) = watch::channel(None);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            store,
            path,
            record: Arc::new(record),
            status: Arc::new(status),
            scenario: SimulationScenario::default(),
            simulation: Simulation::default(),
        }
    }

    /// Use a different simulation scenario.
    pub fn with_scenario(mut self, scenario: SimulationScenario) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Latest record pushed by the store.
    pub fn current(&self) -> Option<DeviceRecord<M>> {
        self.record.borrow().clone()
    }

    pub fn watch_record(&self) -> watch::Receiver<Option<DeviceRecord<M>>> {
        self.record.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Start observing the record.
    ///
    /// Pushes are normalized and published as the current record. If the
    /// record does not exist it is created with default values, once per
    /// absence. Transport errors downgrade the status to `Disconnected`; the
    /// subscription stays alive and recovers with the next push.
    pub async fn subscribe(&self) -> Subscription<M> {
        info!("[Sync] Observing {}", self.path);
        let events = self.store.subscribe(&self.path).await;
        let cancel = CancellationToken::new();

        let mirror = Mirror {
            store: self.store.clone(),
            path: self.path.clone(),
            record: self.record.clone(),
            status: self.status.clone(),
        };
        let records = self.record.subscribe();
        let task = tokio::spawn(mirror.run(events, cancel.clone()));

        Subscription::new(records, cancel, task)
    }

    /// Change the device mode.
    ///
    /// Only the `mode` field is written, so concurrent changes to other
    /// fields of the record are never overwritten.
    pub async fn set_mode(&self, mode: M) -> Result<()> {
        let field = self.path.child("mode");
        info!("[Sync] Setting mode to {}", mode);
        self.store
            .set(&field, Value::String(mode.as_str().to_string()))
            .await
            .inspect_err(|e| warn!("[Sync] Failed to update mode: {}", e))?;
        Ok(())
    }

    /// Switch to the other mode, relative to the latest pushed record.
    pub async fn toggle_mode(&self) -> Result<M> {
        let current = self
            .record
            .borrow()
            .as_ref()
            .map(|record| record.mode)
            .unwrap_or_default();
        let next = current.toggled();
        self.set_mode(next).await?;
        Ok(next)
    }

    pub fn is_simulating(&self) -> bool {
        self.simulation.is_simulating()
    }
}

impl DeviceSyncController<ClampMode> {
    /// Write the first simulated reading now and the second one after the
    /// scenario delay, unless the simulation is stopped first.
    pub async fn start_simulation(&self) -> Result<()> {
        self.simulation
            .start(&self.store, &self.path, &self.scenario)
            .await
    }

    /// Stop simulating and write the idle reading.
    pub async fn stop_simulation(&self) -> Result<()> {
        self.simulation
            .stop(&self.store, &self.path, &self.scenario)
            .await
    }
}

/// State moved into the subscription task.
struct Mirror<M: DeviceMode> {
    store: Arc<dyn RemoteStateStore>,
    path: StorePath,
    record: Arc<watch::Sender<Option<DeviceRecord<M>>>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl<M: DeviceMode> Mirror<M> {
    async fn run(self, mut events: StoreEvents, cancel: CancellationToken) {
        // An initial document was written for the current absence.
        let mut initialized = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("[Sync] Store closed the subscription on {}", self.path);
                        break;
                    }
                },
            };

            match event {
                StoreEvent::Snapshot(Some(value)) => {
                    initialized = false;
                    match DeviceRecord::<M>::from_value(&value) {
                        Ok(record) => {
                            debug!("[Sync] Record on {}: {:?}", self.path, record);
                            self.record.send_replace(Some(record));
                            self.set_status(ConnectionStatus::Connected);
                        }
                        Err(e) => warn!("[Sync] Ignoring push on {}: {}", self.path, e),
                    }
                }
                StoreEvent::Snapshot(None) => {
                    if !initialized {
                        initialized = self.initialize().await.is_ok();
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.set_status(ConnectionStatus::Connected);
                }
                StoreEvent::Error(e) => {
                    warn!("[Sync] Lost {}: {}", self.path, e);
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }
        }

        debug!("[Sync] Stopped observing {}", self.path);
    }

    /// Create the missing record with default values.
    async fn initialize(&self) -> std::result::Result<(), TransportError> {
        info!("[Sync] No record at {}, writing defaults", self.path);
        self.store
            .set(&self.path, DeviceRecord::<M>::initial_document())
            .await
            .inspect_err(|e| warn!("[Sync] Failed to initialize {}: {}", self.path, e))
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("[Sync] {}", status);
            *current = status;
            true
        });
    }
}
