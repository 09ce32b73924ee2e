//! Credential resolution with BYOL fallback.
//!
//! User-supplied keys take precedence over system defaults; the session layer
//! resolves a key once at pipeline construction and never stores it beyond
//! the provider instance. Keys are zeroized on drop.

use std::collections::HashMap;

use dashmap::DashMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An API key that scrubs its memory on drop and redacts itself in logs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying secret. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Resolves provider credentials: user-supplied keys first, then the
/// server-wide defaults.
pub struct CredentialStore {
    /// System default keys, keyed by provider name
    system: HashMap<String, SecretString>,
    /// Per-user keys, keyed by (user id, provider name)
    user: DashMap<(String, String), SecretString>,
}

impl CredentialStore {
    pub fn new(system: HashMap<String, SecretString>) -> Self {
        Self {
            system,
            user: DashMap::new(),
        }
    }

    /// Register (or replace) a user-supplied key for a provider.
    pub fn set_user_key(&self, user_id: &str, provider: &str, key: SecretString) {
        self.user
            .insert((user_id.to_string(), provider.to_string()), key);
    }

    /// Remove a user-supplied key, falling back to the system default.
    pub fn clear_user_key(&self, user_id: &str, provider: &str) {
        self.user
            .remove(&(user_id.to_string(), provider.to_string()));
    }

    /// Resolve the effective key for a user/provider pair.
    pub fn resolve(&self, user_id: &str, provider: &str) -> Option<SecretString> {
        if let Some(key) = self
            .user
            .get(&(user_id.to_string(), provider.to_string()))
        {
            return Some(key.clone());
        }
        self.system.get(provider).cloned()
    }

    /// Whether any key (user or system) exists for the provider.
    pub fn has_any(&self, provider: &str) -> bool {
        self.system.contains_key(provider)
            || self.user.iter().any(|entry| entry.key().1 == provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        let mut system = HashMap::new();
        system.insert(
            "openai".to_string(),
            SecretString::new("sk-system-default"),
        );
        CredentialStore::new(system)
    }

    #[test]
    fn test_system_fallback() {
        let store = store();
        let key = store.resolve("alice", "openai").expect("system key");
        assert_eq!(key.expose(), "sk-system-default");
    }

    #[test]
    fn test_user_key_takes_precedence() {
        let store = store();
        store.set_user_key("alice", "openai", SecretString::new("sk-alice"));
        assert_eq!(
            store.resolve("alice", "openai").expect("user key").expose(),
            "sk-alice"
        );
        // other users still get the system default
        assert_eq!(
            store.resolve("bob", "openai").expect("system key").expose(),
            "sk-system-default"
        );
    }

    #[test]
    fn test_clear_restores_fallback() {
        let store = store();
        store.set_user_key("alice", "openai", SecretString::new("sk-alice"));
        store.clear_user_key("alice", "openai");
        assert_eq!(
            store.resolve("alice", "openai").expect("system key").expose(),
            "sk-system-default"
        );
    }

    #[test]
    fn test_unknown_provider_resolves_none() {
        let store = store();
        assert!(store.resolve("alice", "acme-voice").is_none());
        assert!(!store.has_any("acme-voice"));
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let secret = SecretString::new("sk-very-secret");
        assert_eq!(format!("{secret:?}"), "SecretString(***)");
    }
}
