//! Session broker.
//!
//! `authenticate` checks an identity/secret pair against the configured
//! operator roster and issues a random bearer token with a fixed validity
//! window; `verify` resolves a token back to its identity until it expires.
//! Tokens live only in memory, so every service restart invalidates them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::Result;
use crate::error::SwitchError;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub identity: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionBroker {
    operators: HashMap<String, String>,
    ttl: Duration,
    service_token: Option<String>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionBroker {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            operators: config
                .operators
                .iter()
                .map(|o| (o.identity.clone(), o.secret.clone()))
                .collect(),
            ttl: Duration::seconds(config.session_ttl_seconds),
            service_token: config.service_token.clone(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| SwitchError::storage("session table mutex poisoned"))
    }

    /// Issue a session for a known operator. The rejection message does not
    /// say which of identity or secret was wrong.
    pub fn authenticate(&self, identity: &str, secret: &str, now: DateTime<Utc>) -> Result<Session> {
        let known = self
            .operators
            .get(identity)
            .is_some_and(|expected| expected == secret);
        if !known {
            return Err(SwitchError::auth("unknown identity or bad secret"));
        }
        let session = Session {
            token: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            expires_at: now + self.ttl,
        };
        let mut sessions = self.lock()?;
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(session.token.clone(), session.clone());
        tracing::info!(identity, "session issued");
        Ok(session)
    }

    /// Resolve a bearer token to its operator identity.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<String> {
        let mut sessions = self.lock()?;
        match sessions.get(token) {
            Some(session) if session.expires_at > now => Ok(session.identity.clone()),
            Some(_) => {
                sessions.remove(token);
                Err(SwitchError::auth("session expired"))
            }
            None => Err(SwitchError::auth("unknown session token")),
        }
    }

    /// Check the shared credential external `switch.claim` callers present.
    pub fn verify_service(&self, token: &str) -> Result<()> {
        match &self.service_token {
            Some(expected) if expected == token => Ok(()),
            Some(_) => Err(SwitchError::auth("bad service credential")),
            None => Err(SwitchError::auth(
                "service credential not configured; external claimers are disabled",
            )),
        }
    }
}
