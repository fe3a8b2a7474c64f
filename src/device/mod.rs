//! Device state model: modes, the normalized record and connectivity.

mod mode;
mod record;
mod status;

pub use mode::{ClampMode, DeviceMode, PillMode};
pub use record::{DISCONNECTED_FLAG, DeviceRecord, PillCounts, Reading};
pub use status::ConnectionStatus;
