use serde::Serialize;
use strum::{AsRefStr, Display};

/// Connectivity of the local mirror to the remote record.
///
/// Driven only by subscription events: any push means `Connected`, a
/// transport error on the subscription means `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, AsRefStr)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}
