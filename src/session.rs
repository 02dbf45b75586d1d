//! Session issue, lookup and revocation.
//!
//! Expiry is lazy: an expired session is only removed when someone presents
//! it, or when the optional reaper runs.

use log::{debug, info};

use crate::auth::SessionToken;
use crate::backend::{Result, Store};
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub username: String,
    pub expiry: Timestamp,
}

impl Session {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry < now
    }
}

pub struct SessionStore<'a> {
    store: &'a dyn Store,
}

impl<'a> SessionStore<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Issue a fresh token for `username`, revoking any session it had.
    pub async fn create(&self, username: &str, ttl: u64, now: Timestamp) -> Result<Session> {
        let session = Session {
            token: SessionToken::new(),
            username: username.to_string(),
            expiry: now.after_secs(ttl),
        };

        self.store.replace_session(&session).await?;
        info!(
            "{username}: new session {}, expires {}",
            session.token.short(),
            session.expiry
        );

        Ok(session)
    }

    pub async fn user(&self, token: &SessionToken, now: Timestamp) -> Result<Option<String>> {
        let Some(session) = self.store.find_session(token).await? else {
            debug!("unknown session {}", token.short());
            return Ok(None);
        };

        if session.is_expired(now) {
            info!(
                "{}: session {} expired at {}",
                session.username,
                token.short(),
                session.expiry
            );
            self.store.delete_session(token).await?;
            return Ok(None);
        }

        Ok(Some(session.username))
    }

    pub async fn delete(&self, token: &SessionToken) -> Result<()> {
        self.store.delete_session(token).await
    }

    pub async fn clear_user(&self, username: &str) -> Result<()> {
        self.store.delete_user_sessions(username).await
    }

    pub async fn reap(&self, now: Timestamp) -> Result<u64> {
        let count = self.store.delete_expired_sessions(now).await?;
        if count > 0 {
            info!("reaped {count} expired sessions");
        }
        Ok(count)
    }
}
