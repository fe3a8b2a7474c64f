//! Session handling in front of the device mirror.

mod credentials;
mod gate;

pub use credentials::CredentialAuthGate;
pub use gate::SessionGate;

use crate::error::AuthFailure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// A signed-in session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Opaque session id.
    pub id: String,
    /// The identifier the user signed in with.
    pub identifier: String,
    pub issued_at: DateTime<Utc>,
}

/// Identity service issuing sessions.
///
/// Session changes are pushed through [`session_changes`](Self::session_changes),
/// including ones the service initiates itself (e.g. expiry).
#[async_trait]
pub trait AuthGate: Send + Sync + 'static {
    async fn sign_in(&self, identifier: &str, secret: &str) -> Result<Session, AuthFailure>;

    async fn sign_out(&self) -> Result<(), AuthFailure>;

    /// Current session, updated on every change.
    fn session_changes(&self) -> watch::Receiver<Option<Session>>;
}
