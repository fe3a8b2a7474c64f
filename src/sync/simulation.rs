//! Two-step synthetic sensor sequence for the clamp.
//!
//! Starting writes the first value at once and schedules the second one.
//! The scheduled write only happens if that same run is still active when
//! the delay is over, so stopping always leaves the idle value behind.

use crate::config::SimulationConfig;
use crate::error::Result;
use crate::store::{RemoteStateStore, StorePath};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Values written by a simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationScenario {
    /// Field of the device record that receives the values.
    pub field: String,
    pub first: String,
    pub second: String,
    /// Written on stop.
    pub idle: String,
    pub delay: Duration,
}

impl Default for SimulationScenario {
    fn default() -> Self {
        Self::from(&SimulationConfig::default())
    }
}

impl From<&SimulationConfig> for SimulationScenario {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            field: config.field.clone(),
            first: config.first.clone(),
            second: config.second.clone(),
            idle: config.idle.clone(),
            delay: config.delay(),
        }
    }
}

/// Simulation state shared with the delayed write task.
#[derive(Default)]
pub(crate) struct Simulation {
    /// Token of the active run. Held while writing so a stop and a delayed
    /// write never interleave.
    active: Arc<Mutex<Option<CancellationToken>>>,
    simulating: Arc<AtomicBool>,
}

impl Simulation {
    pub(crate) fn is_simulating(&self) -> bool {
        self.simulating.load(Ordering::SeqCst)
    }

    pub(crate) async fn start(
        &self,
        store: &Arc<dyn RemoteStateStore>,
        document: &StorePath,
        scenario: &SimulationScenario,
    ) -> Result<()> {
        let field = document.child(&scenario.field);
        let token = CancellationToken::new();

        let mut active = self.active.lock().await;
        if let Some(previous) = active.replace(token.clone()) {
            previous.cancel();
        }
        self.simulating.store(true, Ordering::SeqCst);

        info!("[Sim] Writing {} = {}", field, scenario.first);
        if let Err(e) = store.set(&field, Value::String(scenario.first.clone())).await {
            warn!("[Sim] Failed to start simulation: {}", e);
            token.cancel();
            *active = None;
            self.simulating.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        drop(active);

        let store = store.clone();
        let active = self.active.clone();
        let second = scenario.second.clone();
        let delay = scenario.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _guard = active.lock().await;
            if token.is_cancelled() {
                return;
            }
            info!("[Sim] Writing {} = {}", field, second);
            if let Err(e) = store.set(&field, Value::String(second)).await {
                warn!("[Sim] Delayed simulation write failed: {}", e);
            }
        });

        Ok(())
    }

    pub(crate) async fn stop(
        &self,
        store: &Arc<dyn RemoteStateStore>,
        document: &StorePath,
        scenario: &SimulationScenario,
    ) -> Result<()> {
        let field = document.child(&scenario.field);

        let mut active = self.active.lock().await;
        if let Some(token) = active.take() {
            token.cancel();
        }
        self.simulating.store(false, Ordering::SeqCst);

        info!("[Sim] Stopped, writing {} = {}", field, scenario.idle);
        store
            .set(&field, Value::String(scenario.idle.clone()))
            .await
            .inspect_err(|e| warn!("[Sim] Failed to write idle value: {}", e))?;
        Ok(())
    }
}
