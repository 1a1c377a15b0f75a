use super::store::{KeyValueStore, StoreError};
use crate::config::{KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_USER, KEY_USER_TYPE};
use crate::types::{RecordId, TokenPair, UserProfile};
use std::sync::{Mutex, MutexGuard};

const SESSION_KEYS: [&str; 4] = [KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_USER, KEY_USER_TYPE];

/// The only writer of persisted session state. Everything else reads through the
/// accessors and must not hold a token past a single in-flight call.
pub struct AuthTokenStore {
    backend: Mutex<Box<dyn KeyValueStore>>,
}

impl AuthTokenStore {
    pub fn new(backend: impl KeyValueStore + 'static) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn KeyValueStore>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn KeyValueStore>> {
        self.backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self, key: &str) -> Option<String> {
        let value = self.lock().get(key)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(KEY_ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(KEY_REFRESH_TOKEN)
    }

    pub fn token_pair(&self) -> Option<TokenPair> {
        Some(TokenPair {
            access_token: self.access_token()?,
            refresh_token: self.refresh_token()?,
        })
    }

    pub fn has_session(&self) -> bool {
        self.access_token().is_some()
    }

    pub fn set_tokens(&self, access: &str, refresh: &str) -> Result<(), StoreError> {
        self.lock().set_many(&[
            (KEY_ACCESS_TOKEN, access.trim()),
            (KEY_REFRESH_TOKEN, refresh.trim()),
        ])
    }

    pub fn clear_tokens(&self) -> Result<(), StoreError> {
        self.lock().remove_many(&SESSION_KEYS)
    }

    pub fn set_user(&self, profile: &UserProfile, user_type: &str) -> Result<(), StoreError> {
        let raw = serde_json::to_string(profile)?;
        self.lock()
            .set_many(&[(KEY_USER, raw.as_str()), (KEY_USER_TYPE, user_type.trim())])
    }

    pub fn user(&self) -> Option<UserProfile> {
        let raw = self.read(KEY_USER)?;
        match serde_json::from_str(&raw) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable cached profile");
                None
            }
        }
    }

    pub fn user_type(&self) -> Option<String> {
        self.read(KEY_USER_TYPE)
    }

    pub fn user_id(&self) -> Option<RecordId> {
        self.user().map(|u| u.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::tests::scratch_path;
    use crate::auth::store::{JsonFileStore, MemoryStore};

    fn profile() -> UserProfile {
        serde_json::from_str(r#"{"id":42,"email":"counsel@example.org","bar_number":"B-1"}"#)
            .unwrap()
    }

    #[test]
    fn set_tokens_is_visible_immediately() {
        let store = AuthTokenStore::new(MemoryStore::new());
        assert!(store.access_token().is_none());
        store.set_tokens("A", "R").unwrap();
        assert_eq!(store.access_token().as_deref(), Some("A"));
        assert_eq!(store.refresh_token().as_deref(), Some("R"));

        store.set_tokens("B", "R2").unwrap();
        assert_eq!(
            store.token_pair(),
            Some(TokenPair {
                access_token: "B".to_string(),
                refresh_token: "R2".to_string()
            })
        );
    }

    #[test]
    fn token_pair_needs_both_tokens() {
        let store = AuthTokenStore::new(MemoryStore::new());
        store.set_tokens("A", "").unwrap();
        assert_eq!(store.access_token().as_deref(), Some("A"));
        assert!(store.refresh_token().is_none());
        assert!(store.token_pair().is_none());

        store.set_tokens(" A ", " R ").unwrap();
        assert_eq!(
            store.token_pair(),
            Some(TokenPair {
                access_token: "A".to_string(),
                refresh_token: "R".to_string()
            })
        );
    }

    #[test]
    fn clear_tokens_drops_identity_and_is_idempotent() {
        let store = AuthTokenStore::new(MemoryStore::new());
        store.set_tokens("A", "R").unwrap();
        store.set_user(&profile(), "lawyer").unwrap();
        assert_eq!(store.user_id(), Some(RecordId::Number(42)));
        assert_eq!(store.user_type().as_deref(), Some("lawyer"));

        store.clear_tokens().unwrap();
        store.clear_tokens().unwrap();
        assert!(!store.has_session());
        assert!(store.refresh_token().is_none());
        assert!(store.user().is_none());
        assert!(store.user_type().is_none());
    }

    #[test]
    fn cached_profile_keeps_extra_fields() {
        let store = AuthTokenStore::new(MemoryStore::new());
        store.set_user(&profile(), "lawyer").unwrap();
        let cached = store.user().unwrap();
        assert_eq!(cached.extra.get("bar_number").and_then(|v| v.as_str()), Some("B-1"));
    }

    #[test]
    fn file_backed_session_survives_reopen() {
        let path = scratch_path("token-store");
        AuthTokenStore::new(JsonFileStore::open(&path).unwrap())
            .set_tokens("A", "R")
            .unwrap();
        let reopened = AuthTokenStore::new(JsonFileStore::open(&path).unwrap());
        assert_eq!(reopened.access_token().as_deref(), Some("A"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
