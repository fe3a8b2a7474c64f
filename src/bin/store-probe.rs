//! Diagnostic binary for the MQTT-backed store.
//!
//! Usage:
//!   cargo run --bin store-probe -- [path]
//!
//! Connects to the configured broker, subscribes to one document path and
//! logs every push as a normalized clamp record. Runs until Ctrl+C.

use device_state_sync::config::Config;
use device_state_sync::device::{ClampMode, DeviceRecord};
use device_state_sync::store::{MqttStore, RemoteStateStore, StoreEvent, StorePath};
use log::{error, info, warn};

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    device_state_sync::config::load_dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // the probe never signs in
    let config = Config::from_env().and_then(|mut config| {
        config.auth.required = Some(false);
        config.validate().map(|()| config)
    });
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let path = std::env::args()
        .nth(1)
        .map(|p| StorePath::parse(&p))
        .unwrap_or_else(|| config.device.store_path());

    info!(
        "Connecting to MQTT broker at {}:{}",
        config.store.mqtt.broker_host, config.store.mqtt.broker_port
    );
    let (store, event_loop) = MqttStore::new(&config.store.mqtt, path.clone());
    let event_loop_handle = tokio::spawn(event_loop.run());

    let mut events = store.subscribe(&path).await;
    info!("Probing {}. Press Ctrl+C to exit.", path);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StoreEvent::Snapshot(Some(value))) => {
                    match DeviceRecord::<ClampMode>::from_value(&value) {
                        Ok(record) => info!(
                            "mode={} current_now={} unit={} __connected={}",
                            record.mode, record.current_now, record.unit, record.connected
                        ),
                        Err(e) => warn!("Unreadable document: {}", e),
                    }
                }
                Some(StoreEvent::Snapshot(None)) => info!("No document at {}", path),
                Some(StoreEvent::Error(e)) => warn!("Transport error: {}", e),
                None => {
                    warn!("Subscription closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    event_loop_handle.abort();
    info!("Probe complete.");
}
