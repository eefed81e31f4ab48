// Credential store
// Typed, validated access to persisted credentials. Never fails to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::credentials::Persistence;
use super::types::{CredentialKind, CredentialPair, UserProfile};

const USER_KEY: &str = "auth.user";

/// Persisted credentials and user snapshot
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn Persistence>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn Persistence>) -> Self {
        Self { backend }
    }

    /// Read one credential; corrupted or empty entries count as absent
    pub fn get(&self, kind: CredentialKind) -> Option<String> {
        self.read_json::<String>(kind.storage_key())
            .filter(|token| !token.is_empty())
    }

    pub fn get_access_token(&self) -> Option<String> {
        self.get(CredentialKind::AccessToken)
    }

    pub fn get_refresh_token(&self) -> Option<String> {
        self.get(CredentialKind::RefreshToken)
    }

    /// Persist both halves of the pair, or neither
    pub fn set(&self, pair: &CredentialPair) -> bool {
        if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
            tracing::warn!("Refusing to persist credential pair with an empty token");
            return false;
        }

        let previous_access = self.raw(CredentialKind::AccessToken.storage_key());

        if !self.write_json(CredentialKind::AccessToken.storage_key(), &pair.access_token) {
            return false;
        }

        if !self.write_json(CredentialKind::RefreshToken.storage_key(), &pair.refresh_token) {
            // Roll back so the access token is never stored without its partner
            let key = CredentialKind::AccessToken.storage_key();
            let rollback = match previous_access {
                Some(value) => self.backend.set(key, &value),
                None => self.backend.remove(key),
            };
            if let Err(e) = rollback {
                tracing::warn!(error = %e, "Failed to roll back access token after partial write");
            }
            return false;
        }

        true
    }

    /// True iff both tokens are present
    pub fn has(&self) -> bool {
        self.get_access_token().is_some() && self.get_refresh_token().is_some()
    }

    /// Remove both tokens and the user snapshot
    pub fn clear(&self) {
        for key in [
            CredentialKind::AccessToken.storage_key(),
            CredentialKind::RefreshToken.storage_key(),
            USER_KEY,
        ] {
            if let Err(e) = self.backend.remove(key) {
                tracing::warn!(key = key, error = %e, "Failed to remove stored credential");
            }
        }
    }

    pub fn get_user(&self) -> Option<UserProfile> {
        self.read_json::<UserProfile>(USER_KEY)
            .filter(|user| !user.id.is_empty() && !user.username.is_empty())
    }

    pub fn set_user(&self, user: &UserProfile) -> bool {
        self.write_json(USER_KEY, user)
    }

    fn raw(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to read from credential storage");
                None
            }
        }
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.raw(key)?;
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Ignoring corrupted credential entry");
                None
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to encode credential entry");
                return false;
            }
        };

        match self.backend.set(key, &encoded) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to write credential entry");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryPersistence;
    use crate::error::StorageError;

    /// Persistence that rejects writes to one key
    struct FailingPersistence {
        inner: MemoryPersistence,
        failing_key: &'static str,
    }

    impl Persistence for FailingPersistence {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.failing_key {
                return Err(StorageError::Unavailable("quota exceeded".to_string()));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    /// Persistence where every operation fails
    struct DisabledPersistence;

    impl Persistence for DisabledPersistence {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("storage disabled".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("storage disabled".to_string()))
        }

        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("storage disabled".to_string()))
        }
    }

    fn memory_store() -> (CredentialStore, Arc<MemoryPersistence>) {
        let backend = Arc::new(MemoryPersistence::new());
        (CredentialStore::new(backend.clone()), backend)
    }

    #[test]
    fn test_set_get_clear() {
        let (store, _) = memory_store();
        assert!(!store.has());

        assert!(store.set(&CredentialPair::new("access", "refresh")));
        assert!(store.has());
        assert_eq!(store.get(CredentialKind::AccessToken).as_deref(), Some("access"));
        assert_eq!(store.get_refresh_token().as_deref(), Some("refresh"));

        store.clear();
        assert!(!store.has());
        assert_eq!(store.get_access_token(), None);
        assert_eq!(store.get_refresh_token(), None);
    }

    #[test]
    fn test_corrupted_entries_are_absent() {
        let (store, backend) = memory_store();

        backend.set("auth.access_token", "{not json").unwrap();
        backend.set("auth.refresh_token", "42").unwrap();
        assert_eq!(store.get_access_token(), None);
        assert_eq!(store.get_refresh_token(), None);

        backend.set("auth.refresh_token", "\"\"").unwrap();
        assert_eq!(store.get_refresh_token(), None);

        backend.set("auth.user", "[\"admin\"]").unwrap();
        assert_eq!(store.get_user(), None);
    }

    #[test]
    fn test_refresh_token_alone_is_readable() {
        let (store, backend) = memory_store();
        backend.set("auth.refresh_token", "\"long-lived\"").unwrap();

        assert_eq!(store.get_refresh_token().as_deref(), Some("long-lived"));
        assert!(!store.has());
    }

    #[test]
    fn test_partial_write_rolls_back() {
        let backend = Arc::new(FailingPersistence {
            inner: MemoryPersistence::new(),
            failing_key: "auth.refresh_token",
        });
        let store = CredentialStore::new(backend);

        assert!(!store.set(&CredentialPair::new("access", "refresh")));
        assert_eq!(store.get_access_token(), None);
        assert!(!store.has());
    }

    #[test]
    fn test_rejects_empty_tokens() {
        let (store, _) = memory_store();
        assert!(!store.set(&CredentialPair::new("", "refresh")));
        assert!(!store.set(&CredentialPair::new("access", "")));
        assert!(!store.has());
    }

    #[test]
    fn test_disabled_storage_degrades() {
        let store = CredentialStore::new(Arc::new(DisabledPersistence));

        assert!(!store.set(&CredentialPair::new("access", "refresh")));
        assert_eq!(store.get_access_token(), None);
        assert!(!store.has());
        store.clear();
    }

    #[test]
    fn test_user_profile_round_trip() {
        let (store, _) = memory_store();
        let user = UserProfile {
            id: "1".to_string(),
            username: "admin".to_string(),
            email: Some("admin@example.com".to_string()),
            roles: vec!["admin".to_string()],
        };

        assert!(store.set_user(&user));
        assert_eq!(store.get_user(), Some(user));

        store.clear();
        assert_eq!(store.get_user(), None);
    }
}
