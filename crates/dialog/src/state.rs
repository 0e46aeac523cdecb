//! Conversation-scoped counter storage.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use deferral_core::ConversationId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state storage unavailable: {0}")]
    Unavailable(String),
    #[error("state storage lock poisoned")]
    Poisoned,
}

/// Durable integer counters, scoped per conversation.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, or `default` when unset.
    async fn get(&self, scope: &ConversationId, key: &str, default: u32) -> Result<u32, StateError>;

    async fn set(&self, scope: &ConversationId, key: &str, value: u32) -> Result<(), StateError>;

    /// Remove the counter. Deleting a missing key is not an error.
    async fn delete(&self, scope: &ConversationId, key: &str) -> Result<(), StateError>;

    /// Drop everything stored for the conversation.
    async fn clear(&self, scope: &ConversationId) -> Result<(), StateError>;
}

/// In-memory counter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    scopes: RwLock<HashMap<ConversationId, HashMap<String, u32>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters currently stored for `scope`.
    pub fn count(&self, scope: &ConversationId) -> usize {
        self.scopes
            .read()
            .map(|scopes| scopes.get(scope).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, scope: &ConversationId, key: &str, default: u32) -> Result<u32, StateError> {
        let scopes = self.scopes.read().map_err(|_| StateError::Poisoned)?;
        Ok(scopes
            .get(scope)
            .and_then(|counters| counters.get(key).copied())
            .unwrap_or(default))
    }

    async fn set(&self, scope: &ConversationId, key: &str, value: u32) -> Result<(), StateError> {
        let mut scopes = self.scopes.write().map_err(|_| StateError::Poisoned)?;
        scopes
            .entry(scope.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, scope: &ConversationId, key: &str) -> Result<(), StateError> {
        let mut scopes = self.scopes.write().map_err(|_| StateError::Poisoned)?;
        if let Some(counters) = scopes.get_mut(scope) {
            counters.remove(key);
            if counters.is_empty() {
                scopes.remove(scope);
            }
        }
        Ok(())
    }

    async fn clear(&self, scope: &ConversationId) -> Result<(), StateError> {
        let mut scopes = self.scopes.write().map_err(|_| StateError::Poisoned)?;
        scopes.remove(scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_delete() {
        let store = InMemoryCounterStore::new();
        let conv = ConversationId::new("c1");

        assert_eq!(store.get(&conv, "k", 7).await.unwrap(), 7);
        store.set(&conv, "k", 2).await.unwrap();
        assert_eq!(store.get(&conv, "k", 0).await.unwrap(), 2);

        store.delete(&conv, "k").await.unwrap();
        store.delete(&conv, "k").await.unwrap();
        assert_eq!(store.get(&conv, "k", 0).await.unwrap(), 0);
        assert_eq!(store.count(&conv), 0);
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = InMemoryCounterStore::new();
        let a = ConversationId::new("a");
        let b = ConversationId::new("b");

        store.set(&a, "k", 1).await.unwrap();
        store.set(&b, "k", 5).await.unwrap();
        store.clear(&a).await.unwrap();

        assert_eq!(store.get(&a, "k", 0).await.unwrap(), 0);
        assert_eq!(store.get(&b, "k", 0).await.unwrap(), 5);
    }
}
