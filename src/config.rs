use crate::error::{Result, SyncError};
use crate::store::StorePath;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};

/// Load environment variables from a `.env` file in the working directory.
///
/// Values may contain spaces without quoting. Variables already present in
/// the environment win over the file.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();

        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }

        if std::env::var(key).is_err() {
            // SAFETY: called from main before the async runtime starts any threads
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Which dashboard the process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Variant {
    /// Pill dispenser: public device-scoped document.
    Pill,
    /// Power clamp: document at the store root, behind a login.
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StoreBackend {
    Mqtt,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub variant: Variant,
    pub application_id: String,
    /// Explicit document path; derived from the variant when unset.
    pub path: Option<String>,
}

impl DeviceConfig {
    pub fn store_path(&self) -> StorePath {
        match (&self.path, self.variant) {
            (Some(path), _) => StorePath::parse(path),
            (None, Variant::Pill) => StorePath::device_state(&self.application_id),
            (None, Variant::Clamp) => StorePath::root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic every document path is placed under.
    pub topic_prefix: String,
    /// How long to wait for a retained document before reporting it absent.
    pub absence_timeout_ms: u64,
}

impl MqttConfig {
    pub fn absence_timeout(&self) -> Duration {
        Duration::from_millis(self.absence_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub identifier: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Whether a session is needed before observing. Defaults per variant.
    pub required: Option<bool>,
    pub users: Vec<Credential>,
}

/// Two-step synthetic reading written by the clamp simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub field: String,
    pub first: String,
    pub second: String,
    pub idle: String,
    pub delay_ms: u64,
}

impl SimulationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            field: "current_now".to_string(),
            first: "0.0711".to_string(),
            second: "0.072".to_string(),
            idle: "0.000".to_string(),
            delay_ms: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                variant: Variant::Pill,
                application_id: "pill-2bd05".to_string(),
                path: None,
            },
            store: StoreConfig {
                backend: StoreBackend::Mqtt,
                mqtt: MqttConfig {
                    broker_host: "localhost".to_string(),
                    broker_port: 1883,
                    client_id: "device-dashboard".to_string(),
                    username: None,
                    password: None,
                    topic_prefix: "dashboard".to_string(),
                    absence_timeout_ms: 2000,
                },
            },
            auth: AuthConfig {
                required: None,
                users: vec![],
            },
            simulation: SimulationConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::Configuration(format!("invalid value for {name}: {raw:?}")))
}

/// Parse `id:secret;id:secret`.
fn parse_users(raw: &str) -> Result<Vec<Credential>> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((identifier, secret)) if !identifier.trim().is_empty() && !secret.is_empty() => {
                Ok(Credential {
                    identifier: identifier.trim().to_string(),
                    secret: secret.to_string(),
                })
            }
            _ => Err(SyncError::Configuration(format!(
                "malformed DASHBOARD_USERS entry {entry:?}, expected id:secret"
            ))),
        })
        .collect()
}

impl Config {
    /// Build the configuration from defaults plus environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        // Device
        if let Some(variant) = lookup("DEVICE_VARIANT") {
            config.device.variant = parse_var("DEVICE_VARIANT", &variant)?;
        }
        if let Some(app_id) = lookup("DEVICE_APP_ID") {
            config.device.application_id = app_id;
        }
        if let Some(path) = lookup("DEVICE_PATH") {
            config.device.path = Some(path);
        }

        // Store
        if let Some(backend) = lookup("STORE_BACKEND") {
            config.store.backend = parse_var("STORE_BACKEND", &backend)?;
        }
        let mqtt = &mut config.store.mqtt;
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            mqtt.broker_host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            mqtt.broker_port = parse_var("MQTT_BROKER_PORT", &port)?;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            mqtt.client_id = client_id;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            mqtt.password = Some(password);
        }
        if let Some(prefix) = lookup("MQTT_TOPIC_PREFIX") {
            mqtt.topic_prefix = prefix;
        }
        if let Some(timeout) = lookup("MQTT_ABSENCE_TIMEOUT_MS") {
            mqtt.absence_timeout_ms = parse_var("MQTT_ABSENCE_TIMEOUT_MS", &timeout)?;
        }

        // Auth
        if let Some(required) = lookup("AUTH_REQUIRED") {
            config.auth.required = Some(parse_var("AUTH_REQUIRED", &required)?);
        }
        if let Some(users) = lookup("DASHBOARD_USERS") {
            config.auth.users = parse_users(&users)?;
        }

        // Simulation
        let sim = &mut config.simulation;
        if let Some(field) = lookup("SIM_FIELD") {
            sim.field = field;
        }
        if let Some(first) = lookup("SIM_FIRST") {
            sim.first = first;
        }
        if let Some(second) = lookup("SIM_SECOND") {
            sim.second = second;
        }
        if let Some(idle) = lookup("SIM_IDLE") {
            sim.idle = idle;
        }
        if let Some(delay) = lookup("SIM_DELAY_MS") {
            sim.delay_ms = parse_var("SIM_DELAY_MS", &delay)?;
        }

        Ok(config)
    }

    /// Whether observing the device needs a signed-in session.
    pub fn auth_required(&self) -> bool {
        self.auth
            .required
            .unwrap_or(self.device.variant == Variant::Clamp)
    }

    /// Reject combinations the dashboard cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.auth_required() && self.auth.users.is_empty() {
            return Err(SyncError::Configuration(
                "login is required but DASHBOARD_USERS is empty".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Mqtt {
            let mqtt = &self.store.mqtt;
            if mqtt.broker_host.trim().is_empty() {
                return Err(SyncError::Configuration("MQTT_BROKER_HOST is empty".to_string()));
            }
            if mqtt.client_id.is_empty() || mqtt.client_id.starts_with(' ') {
                return Err(SyncError::Configuration(format!(
                    "invalid MQTT_CLIENT_ID {:?}",
                    mqtt.client_id
                )));
            }
            if mqtt.topic_prefix.trim_matches('/').is_empty() {
                return Err(SyncError::Configuration("MQTT_TOPIC_PREFIX is empty".to_string()));
            }
        }
        if self.simulation.field.trim().is_empty() {
            return Err(SyncError::Configuration("SIM_FIELD is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.device.variant, Variant::Pill);
        assert_eq!(
            config.device.store_path().to_string(),
            "artifacts/pill-2bd05/public/device_state"
        );
        assert!(!config.auth_required());
        assert_eq!(config.simulation.delay(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_clamp_uses_root_and_requires_login() {
        let config = Config::from_lookup(lookup(&[("DEVICE_VARIANT", "clamp")])).unwrap();
        assert!(config.device.store_path().is_root());
        assert!(config.auth_required());
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));

        let config = Config::from_lookup(lookup(&[
            ("DEVICE_VARIANT", "clamp"),
            ("DASHBOARD_USERS", "ops@example.com:hunter2; viewer@example.com:pa:ss"),
        ]))
        .unwrap();
        assert_eq!(config.auth.users.len(), 2);
        assert_eq!(config.auth.users[1].secret, "pa:ss");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DEVICE_PATH", "/devices/clamp-7"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_ABSENCE_TIMEOUT_MS", "500"),
            ("AUTH_REQUIRED", "true"),
            ("DASHBOARD_USERS", "a:b"),
            ("SIM_DELAY_MS", "250"),
            ("STORE_BACKEND", "memory"),
        ]))
        .unwrap();
        assert_eq!(config.device.store_path().to_string(), "devices/clamp-7");
        assert_eq!(config.store.mqtt.broker_port, 8883);
        assert_eq!(config.store.mqtt.absence_timeout(), Duration::from_millis(500));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.auth_required());
        assert_eq!(config.simulation.delay_ms, 250);
    }

    #[test]
    fn test_malformed_values_are_configuration_errors() {
        for vars in [
            [("DEVICE_VARIANT", "toaster")],
            [("MQTT_BROKER_PORT", "99999")],
            [("AUTH_REQUIRED", "maybe")],
            [("DASHBOARD_USERS", "no-secret-here")],
        ] {
            let result = Config::from_lookup(lookup(&vars));
            assert!(matches!(result, Err(SyncError::Configuration(_))), "{vars:?}");
        }
    }

    #[test]
    fn test_empty_broker_host_rejected() {
        let mut config = Config::default();
        config.store.mqtt.broker_host = " ".to_string();
        assert!(config.validate().is_err());

        config.store.backend = StoreBackend::Memory;
        assert!(config.validate().is_ok());
    }
}
