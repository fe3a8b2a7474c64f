//! Operating modes of the supported devices.
//!
//! Every device has exactly two modes. The first one is the passive member
//! and is what an absent or unreadable `mode` field decodes to.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::str::FromStr;
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

/// A two-member mode enum as stored in the `mode` field of a device record.
pub trait DeviceMode:
    Copy + Eq + Default + Debug + Display + FromStr + AsRef<str> + Send + Sync + 'static
{
    /// Both members, passive one first.
    const ALL: [Self; 2];

    /// Wire form of the mode.
    fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// The other member.
    fn toggled(self) -> Self {
        if self == Self::ALL[0] {
            Self::ALL[1]
        } else {
            Self::ALL[0]
        }
    }
}

/// Pill dispenser mode.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    StrumDisplay,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PillMode {
    /// The user dispenses by hand.
    #[default]
    Manual,
    /// The dispenser follows its pre-set schedule.
    Automatic,
}

impl DeviceMode for PillMode {
    const ALL: [Self; 2] = [PillMode::Manual, PillMode::Automatic];
}

/// Power clamp mode.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    StrumDisplay,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClampMode {
    #[default]
    Measurement,
    Monitoring,
}

impl DeviceMode for ClampMode {
    const ALL: [Self; 2] = [ClampMode::Measurement, ClampMode::Monitoring];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(PillMode::Manual.as_str(), "manual");
        assert_eq!(PillMode::Automatic.to_string(), "automatic");
        assert_eq!(ClampMode::Monitoring.as_str(), "monitoring");
        assert_eq!("measurement".parse::<ClampMode>().ok(), Some(ClampMode::Measurement));
        assert!("standby".parse::<PillMode>().is_err());
    }

    #[test]
    fn test_default_is_passive_member() {
        assert_eq!(PillMode::default(), PillMode::ALL[0]);
        assert_eq!(ClampMode::default(), ClampMode::ALL[0]);
    }

    #[test]
    fn test_toggle() {
        assert_eq!(PillMode::Manual.toggled(), PillMode::Automatic);
        assert_eq!(PillMode::Automatic.toggled(), PillMode::Manual);
        assert_eq!(ClampMode::Measurement.toggled(), ClampMode::Monitoring);
    }
}
