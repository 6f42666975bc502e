use crate::{models::Id, store::StoreError};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

pub const SESSION_MAX_AGE_HOURS: i64 = 24;

/// Handle returned by a successful login. The token is opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user_id: Id,
}

#[derive(Debug, Clone)]
struct SessionData {
    user_id: Id,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionData>>>,
    max_age: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::hours(SESSION_MAX_AGE_HOURS))
    }
}

impl SessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_age,
        }
    }

    pub fn open(&self, user_id: &str, now: DateTime<Utc>) -> Result<Session, StoreError> {
        let token = new_token();
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        // logins drop abandoned sessions so the map stays bounded
        sessions.retain(|_, data| self.is_live(data, now));
        sessions.insert(
            token.clone(),
            SessionData {
                user_id: user_id.to_string(),
                created_at: now,
            },
        );

        Ok(Session {
            token,
            user_id: user_id.to_string(),
        })
    }

    /// The user behind `token`, or `None` once it is unknown or expired.
    pub fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<Option<Id>, StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        let Some(data) = sessions.get(token) else {
            return Ok(None);
        };
        if self.is_live(data, now) {
            return Ok(Some(data.user_id.clone()));
        }

        sessions.remove(token);
        Ok(None)
    }

    pub fn close(&self, token: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        sessions.remove(token);
        Ok(())
    }

    pub fn close_all_for(&self, user_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        sessions.retain(|_, data| data.user_id != user_id);
        Ok(())
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        let before = sessions.len();
        sessions.retain(|_, data| self.is_live(data, now));
        Ok(before - sessions.len())
    }

    fn is_live(&self, data: &SessionData, now: DateTime<Utc>) -> bool {
        now - data.created_at < self.max_age
    }
}

fn new_token() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill(&mut buf);
    base64::engine::general_purpose::STANDARD.encode(buf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_open_and_resolve() {
        let store = SessionStore::default();
        let now = Utc::now();
        let session = store.open("USR0001", now).unwrap();

        assert_eq!(session.user_id, "USR0001");
        assert_eq!(
            store.resolve(&session.token, now).unwrap().as_deref(),
            Some("USR0001")
        );
        assert_eq!(store.resolve("forged", now).unwrap(), None);
    }

    #[test]
    fn test_expiry() {
        let store = SessionStore::default();
        let now = Utc::now();
        let session = store.open("USR0001", now).unwrap();

        let later = now + Duration::hours(SESSION_MAX_AGE_HOURS);
        assert_eq!(store.resolve(&session.token, later).unwrap(), None);
        assert_eq!(store.resolve(&session.token, now).unwrap(), None);
    }

    #[test]
    fn test_close_all_for_user() {
        let store = SessionStore::default();
        let now = Utc::now();
        let first = store.open("USR0001", now).unwrap();
        let second = store.open("USR0001", now).unwrap();
        let other = store.open("USR0002", now).unwrap();
        assert_ne!(first.token, second.token);

        store.close_all_for("USR0001").unwrap();
        assert_eq!(store.resolve(&first.token, now).unwrap(), None);
        assert_eq!(store.resolve(&second.token, now).unwrap(), None);
        assert!(store.resolve(&other.token, now).unwrap().is_some());

        assert_eq!(store.purge_expired(now + Duration::days(2)).unwrap(), 1);
    }

    #[test]
    fn test_open_drops_expired_sessions() {
        let store = SessionStore::default();
        let now = Utc::now();
        let stale = store.open("USR0001", now).unwrap();

        let later = now + Duration::hours(SESSION_MAX_AGE_HOURS + 1);
        let fresh = store.open("USR0002", later).unwrap();

        // gone from the map, not merely expired at `later`
        assert_eq!(store.resolve(&stale.token, now).unwrap(), None);
        assert_eq!(store.purge_expired(later).unwrap(), 0);
        assert!(store.resolve(&fresh.token, later).unwrap().is_some());
    }
}
