/// Session store shared by both transports
/// One id-keyed map with sliding 24h expiry; accesses are serialized because
/// create/get are read-modify-write under a multi-threaded runtime
use crate::errors::{ApiError, ErrorKind};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Sliding expiry window for sessions
const SESSION_EXPIRY_HOURS: i64 = 24;

/// A server-side record correlating a client across requests and connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Free-form fields attached at creation or by services
    pub fields: Map<String, Value>,
}

impl Session {
    /// Create a session with a fresh crypto-random id and current timestamps
    pub fn new(seed: Option<Map<String, Value>>) -> Self {
        let now = Utc::now();

        Self {
            id: generate_session_id(),
            created: now,
            updated: now,
            fields: seed.unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() - self.updated > Duration::hours(SESSION_EXPIRY_HOURS)
    }

    /// Refresh the sliding expiry window
    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

/// 256-bit random id, hex-encoded
fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Transport-agnostic session storage
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a new session, merging optional seed fields
    pub fn create(&self, seed: Option<Map<String, Value>>) -> Session {
        let session = Session::new(seed);

        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(session.id.clone(), session.clone());

        info!(session_id = %session.id, "created session");

        session
    }

    /// Fetch a session snapshot, refreshing its expiry window
    ///
    /// Returns `None` for unknown ids, and for expired sessions when
    /// `require_fresh` is set.
    pub fn get(&self, id: &str, require_fresh: bool) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");

        let session = match sessions.get_mut(id) {
            Some(session) => session,
            None => {
                warn!(session_id = %id, "session not found");
                return None;
            }
        };

        if require_fresh && session.is_expired() {
            warn!(session_id = %id, "session has expired");
            return None;
        }

        session.touch();

        Some(session.clone())
    }

    /// Strict lookup: absent and expired sessions are hard failures
    ///
    /// Expiry is checked before the freshness window is refreshed, so an
    /// expired session cannot revive itself through validation.
    pub fn validate(&self, id: &str) -> Result<Session, ApiError> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ApiError::new(ErrorKind::SessionNotFound, ""))?;

        if session.is_expired() {
            return Err(ApiError::new(ErrorKind::SessionExpired, ""));
        }

        session.touch();

        Ok(session.clone())
    }

    /// Merge fields into a live session, refreshing its expiry window
    ///
    /// Handlers work on snapshots, so attached fields are persisted through
    /// the store rather than the copy in hand.
    pub fn update(&self, id: &str, fields: Map<String, Value>) -> Result<Session, ApiError> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ApiError::new(ErrorKind::SessionNotFound, ""))?;

        if session.is_expired() {
            return Err(ApiError::new(ErrorKind::SessionExpired, ""));
        }

        session.fields.extend(fields);
        session.touch();

        Ok(session.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .len()
    }

    #[cfg(test)]
    fn backdate(&self, id: &str, updated: DateTime<Utc>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            session.updated = updated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_generates_unique_hex_ids() {
        let store = SessionStore::new();
        let a = store.create(None);
        let b = store.create(None);

        assert_eq!(a.id.len(), 64); // 32 bytes, hex-encoded
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id, b.id);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_create_merges_seed_fields() {
        let store = SessionStore::new();
        let mut seed = Map::new();
        seed.insert("userId".to_string(), json!(7));

        let session = store.create(Some(seed));
        assert_eq!(session.fields.get("userId"), Some(&json!(7)));
    }

    #[test]
    fn test_get_unknown_returns_none() {
        let store = SessionStore::new();
        assert!(store.get("nope", true).is_none());
    }

    #[test]
    fn test_get_refreshes_expiry_window() {
        let store = SessionStore::new();
        let session = store.create(None);

        let stale = Utc::now() - Duration::hours(23);
        store.backdate(&session.id, stale);

        let fetched = store.get(&session.id, true).unwrap();
        assert!(fetched.updated > stale);

        // The refresh persisted into the store
        let again = store.get(&session.id, true).unwrap();
        assert!(again.updated >= fetched.updated);
    }

    #[test]
    fn test_expired_session_hidden_when_freshness_required() {
        let store = SessionStore::new();
        let session = store.create(None);
        store.backdate(&session.id, Utc::now() - Duration::hours(25));

        assert!(store.get(&session.id, true).is_none());
        // Relaxed lookup still sees it
        assert!(store.get(&session.id, false).is_some());
    }

    #[test]
    fn test_validate_unknown_session() {
        let store = SessionStore::new();
        let err = store.validate("missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);
    }

    #[test]
    fn test_validate_expired_session() {
        let store = SessionStore::new();
        let session = store.create(None);
        store.backdate(&session.id, Utc::now() - Duration::hours(25));

        let err = store.validate(&session.id).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionExpired);
    }

    #[test]
    fn test_update_merges_and_persists_fields() {
        let store = SessionStore::new();
        let session = store.create(None);

        let mut fields = Map::new();
        fields.insert("userId".to_string(), json!(7));
        let updated = store.update(&session.id, fields).unwrap();
        assert_eq!(updated.fields.get("userId"), Some(&json!(7)));

        let mut fields = Map::new();
        fields.insert("userId".to_string(), json!(8));
        fields.insert("theme".to_string(), json!("dark"));
        store.update(&session.id, fields).unwrap();

        // Later fetches see the merged state, later values win
        let fetched = store.get(&session.id, true).unwrap();
        assert_eq!(fetched.fields.get("userId"), Some(&json!(8)));
        assert_eq!(fetched.fields.get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn test_update_unknown_or_expired_session_fails() {
        let store = SessionStore::new();
        let err = store.update("missing", Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);

        let session = store.create(None);
        store.backdate(&session.id, Utc::now() - Duration::hours(25));
        let err = store.update(&session.id, Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionExpired);
    }

    #[test]
    fn test_validate_fresh_session() {
        let store = SessionStore::new();
        let session = store.create(None);
        assert_eq!(store.validate(&session.id).unwrap().id, session.id);
    }
}
