//! The shared device-state document.
//!
//! Payloads pushed by the store are untyped JSON. [`DeviceRecord::from_value`]
//! is the one place where they are turned into a typed record: every missing
//! or unreadable field gets its default here, so the rest of the crate never
//! deals with partial documents.

use super::mode::DeviceMode;
use crate::error::DecodeError;
use log::warn;
use serde_json::{Map, Value, json};
use std::fmt;

/// Default value of the `__connected` flag.
pub const DISCONNECTED_FLAG: &str = "disconnected";

/// A numeric reading that is stored as a fixed-point string with three
/// decimals, e.g. `current_now` and `unit` on the clamp.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading(f64);

impl Reading {
    pub const ZERO: Reading = Reading(0.0);

    /// Create a reading. Non-finite values become zero.
    pub fn new(value: f64) -> Self {
        if value.is_finite() {
            // adding 0.0 turns -0.0 into 0.0
            Self(value + 0.0)
        } else {
            Self(0.0)
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Decode from a wire value (string or number). Anything unreadable is zero.
    pub fn from_value(value: Option<&Value>) -> Self {
        Self::new(number_or_zero(value))
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// Per-compartment pill counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PillCounts {
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

impl PillCounts {
    fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Object(counts)) = value else {
            return Self::default();
        };
        Self {
            a: count_or_zero(counts.get("A")),
            b: count_or_zero(counts.get("B")),
            c: count_or_zero(counts.get("C")),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "A": self.a, "B": self.b, "C": self.c })
    }
}

/// Normalized mirror of the remote device document.
///
/// Holds the union of the fields used by the pill dispenser and the clamp.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord<M: DeviceMode> {
    pub mode: M,
    pub temperature: f64,
    pub humidity: f64,
    pub luminosity: f64,
    pub pill_counts: PillCounts,
    pub current_now: Reading,
    pub unit: Reading,
    /// Raw `__connected` flag as reported by the device.
    pub connected: String,
}

impl<M: DeviceMode> Default for DeviceRecord<M> {
    fn default() -> Self {
        Self {
            mode: M::default(),
            temperature: 0.0,
            humidity: 0.0,
            luminosity: 0.0,
            pill_counts: PillCounts::default(),
            current_now: Reading::ZERO,
            unit: Reading::ZERO,
            connected: DISCONNECTED_FLAG.to_string(),
        }
    }
}

impl<M: DeviceMode> DeviceRecord<M> {
    /// Decode a pushed payload, filling in defaults for everything missing.
    ///
    /// Only a payload that is not a JSON object is rejected.
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let Value::Object(fields) = value else {
            return Err(DecodeError(kind_of(value).to_string()));
        };

        Ok(Self {
            mode: decode_mode(fields),
            temperature: number_or_zero(fields.get("temperature")),
            humidity: number_or_zero(fields.get("humidity")),
            luminosity: number_or_zero(fields.get("luminosity")),
            pill_counts: PillCounts::from_value(fields.get("pillCounts")),
            current_now: Reading::from_value(fields.get("current_now")),
            unit: Reading::from_value(fields.get("unit")),
            connected: match fields.get("__connected") {
                Some(Value::String(flag)) if !flag.is_empty() => flag.clone(),
                _ => DISCONNECTED_FLAG.to_string(),
            },
        })
    }

    /// Full wire document for this record.
    pub fn to_value(&self) -> Value {
        json!({
            "mode": self.mode.as_str(),
            "temperature": self.temperature,
            "humidity": self.humidity,
            "luminosity": self.luminosity,
            "pillCounts": self.pill_counts.to_value(),
            "current_now": self.current_now.to_string(),
            "unit": self.unit.to_string(),
            "__connected": self.connected,
        })
    }

    /// Document written when the record does not exist yet.
    ///
    /// Depends on the schema only, so concurrent initializers always write
    /// identical documents.
    pub fn initial_document() -> Value {
        Self::default().to_value()
    }
}

fn decode_mode<M: DeviceMode>(fields: &Map<String, Value>) -> M {
    match fields.get("mode") {
        Some(Value::String(raw)) if !raw.is_empty() => raw.parse().unwrap_or_else(|_| {
            warn!("[Sync] Ignoring unknown mode {:?}, using {}", raw, M::default());
            M::default()
        }),
        _ => M::default(),
    }
}

fn number_or_zero(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn count_or_zero(value: Option<&Value>) -> u32 {
    let Some(Value::Number(n)) = value else {
        return 0;
    };
    if let Some(count) = n.as_u64() {
        return u32::try_from(count).unwrap_or(u32::MAX);
    }
    match n.as_f64() {
        Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) => v as u32,
        _ => 0,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
