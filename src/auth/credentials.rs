use super::{AuthGate, Session};
use crate::config::Credential;
use crate::error::AuthFailure;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::collections::HashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Auth service backed by a fixed credential table.
pub struct CredentialAuthGate {
    credentials: HashMap<String, String>,
    session: watch::Sender<Option<Session>>,
}

impl CredentialAuthGate {
    pub fn new(credentials: &[Credential]) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            credentials: credentials
                .iter()
                .map(|c| (c.identifier.clone(), c.secret.clone()))
                .collect(),
            session,
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    /// End the current session from the service side.
    pub fn expire(&self) {
        if self.session.send_replace(None).is_some() {
            info!("[Auth] Session expired");
        }
    }
}

#[async_trait]
impl AuthGate for CredentialAuthGate {
    async fn sign_in(&self, identifier: &str, secret: &str) -> Result<Session, AuthFailure> {
        let expected = self
            .credentials
            .get(identifier)
            .ok_or_else(|| AuthFailure::UnknownAccount(identifier.to_string()))?;
        if expected != secret {
            return Err(AuthFailure::WrongSecret(identifier.to_string()));
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            issued_at: Utc::now(),
        };
        info!("[Auth] Signed in as {}", identifier);
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthFailure> {
        if let Some(session) = self.session.send_replace(None) {
            info!("[Auth] Signed out {}", session.identifier);
        }
        Ok(())
    }

    fn session_changes(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }
}
