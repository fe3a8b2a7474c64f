//! Gate that only lets the device mirror observe while a session exists.

use super::{AuthGate, Session};
use crate::device::DeviceMode;
use crate::error::{LoginError, Result};
use crate::sync::{DeviceSyncController, Subscription};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Starts and stops observation of the device record as sessions come and
/// go.
pub struct SessionGate<M: DeviceMode> {
    auth: Arc<dyn AuthGate>,
    controller: Arc<DeviceSyncController<M>>,
    active: Mutex<Option<Subscription<M>>>,
}

impl<M: DeviceMode> SessionGate<M> {
    pub fn new(auth: Arc<dyn AuthGate>, controller: Arc<DeviceSyncController<M>>) -> Self {
        Self {
            auth,
            controller,
            active: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &Arc<DeviceSyncController<M>> {
        &self.controller
    }

    pub fn session(&self) -> Option<Session> {
        self.auth.session_changes().borrow().clone()
    }

    /// Whether the device record is currently observed.
    pub fn is_observing(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Exchange credentials for a session.
    ///
    /// The caller only ever sees the generic [`LoginError`]; the reason is
    /// logged. Observation starts once [`run`](Self::run) sees the session.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &str,
    ) -> std::result::Result<Session, LoginError> {
        self.auth.sign_in(identifier, secret).await.map_err(|e| {
            warn!("[Auth] Login error: {}", e);
            LoginError
        })
    }

    /// Stop observing, then end the session.
    ///
    /// Observation stops before the auth service is contacted, so no push is
    /// processed after this call even if the sign-out is slow.
    pub async fn logout(&self) -> Result<()> {
        self.stop_observing();
        if let Err(e) = self.auth.sign_out().await {
            warn!("[Auth] Logout error: {}", e);
        }
        Ok(())
    }

    /// Follow session changes until the auth service goes away.
    pub async fn run(self: Arc<Self>) {
        let mut sessions = self.auth.session_changes();
        loop {
            let present = sessions.borrow_and_update().is_some();
            if present {
                self.start_observing().await;
            } else {
                self.stop_observing();
            }

            if sessions.changed().await.is_err() {
                break;
            }
        }
        self.stop_observing();
    }

    async fn start_observing(&self) {
        if self.is_observing() {
            return;
        }
        let subscription = self.controller.subscribe().await;

        // the session may have ended while subscribing
        if self.session().is_none() {
            return;
        }
        let mut active = self.active.lock();
        if active.is_none() {
            *active = Some(subscription);
        }
    }

    fn stop_observing(&self) {
        if let Some(subscription) = self.active.lock().take() {
            info!("[Auth] Session ended, stop observing {}", self.controller.path());
            subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialAuthGate;
    use crate::config::Credential;
    use crate::device::{ClampMode, ConnectionStatus};
    use crate::store::{InMemoryStore, StorePath};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        store: Arc<InMemoryStore>,
        auth: Arc<CredentialAuthGate>,
        gate: Arc<SessionGate<ClampMode>>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::with_document(
            &StorePath::root(),
            json!({"mode": "measurement", "current_now": "0.5"}),
        ));
        let auth = Arc::new(CredentialAuthGate::new(&[Credential {
            identifier: "ops@example.com".to_string(),
            secret: "hunter2".to_string(),
        }]));
        let controller = Arc::new(DeviceSyncController::new(store.clone(), StorePath::root()));
        let gate = Arc::new(SessionGate::new(auth.clone(), controller));
        tokio::spawn(gate.clone().run());
        Fixture { store, auth, gate }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_wrong_credentials_give_generic_error() {
        let f = fixture();

        let err = f.gate.login("ops@example.com", "wrong").await.unwrap_err();
        assert_eq!(err.to_string(), "Login failed. Check email & password.");
        let err = f.gate.login("nobody@example.com", "hunter2").await.unwrap_err();
        assert_eq!(err.to_string(), "Login failed. Check email & password.");

        tokio::task::yield_now().await;
        assert_eq!(f.gate.session(), None);
        assert!(!f.gate.is_observing());
        assert_eq!(f.store.subscriber_count(&StorePath::root()), 0);
        assert_eq!(f.gate.controller().status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_login_starts_observing() {
        let f = fixture();
        let session = f.gate.login("ops@example.com", "hunter2").await.unwrap();
        assert_eq!(f.gate.session(), Some(session));

        let controller = f.gate.controller().clone();
        eventually(|| controller.status() == ConnectionStatus::Connected).await;
        assert!(f.gate.is_observing());
        assert_eq!(controller.current().unwrap().current_now.to_string(), "0.500");
    }

    #[tokio::test]
    async fn test_logout_stops_processing_pushes() {
        let f = fixture();
        f.gate.login("ops@example.com", "hunter2").await.unwrap();
        let controller = f.gate.controller().clone();
        eventually(|| controller.current().is_some()).await;

        tokio_test::assert_ok!(f.gate.logout().await);
        assert!(!f.gate.is_observing());
        assert_eq!(f.gate.session(), None);

        f.store.put(&StorePath::root().child("current_now"), json!("9.9"));
        tokio::task::yield_now().await;
        assert_eq!(controller.current().unwrap().current_now.to_string(), "0.500");

        let store = f.store.clone();
        eventually(move || store.subscriber_count(&StorePath::root()) == 0).await;
    }

    #[tokio::test]
    async fn test_expiry_stops_observing() {
        let f = fixture();
        f.gate.login("ops@example.com", "hunter2").await.unwrap();
        let gate = f.gate.clone();
        eventually(|| gate.is_observing()).await;

        f.auth.expire();
        eventually(|| !gate.is_observing()).await;

        // signing in again resumes
        f.gate.login("ops@example.com", "hunter2").await.unwrap();
        eventually(|| gate.is_observing()).await;
    }
}
