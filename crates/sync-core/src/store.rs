//! Local document store abstraction.
//!
//! One logical database per document name. The store has sync-on-open
//! semantics: `load` returns the persisted snapshot (or `None` for a database
//! that has never been written), and the engine writes through on every
//! transaction via `save`.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - Host-provided stores (IndexedDB bridge, embedded KV) on real platforms

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store open failed for {0}")]
    Open(String),

    #[error("Store write failed for {0}")]
    Write(String),

    #[error("Store delete failed for {0}")]
    Delete(String),

    #[error("Store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Local persistence keyed by document name.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Read the persisted snapshot for a document. `Ok(None)` means the
    /// database exists logically but has never been written - a fresh,
    /// empty document.
    async fn load(&self, doc_name: &str) -> Result<Option<Vec<u8>>>;

    /// Write through the latest snapshot for a document.
    async fn save(&self, doc_name: &str, snapshot: &[u8]) -> Result<()>;

    /// Drop the backing database by name. Deleting a database that was never
    /// written succeeds.
    async fn delete(&self, doc_name: &str) -> Result<()>;
}

/// In-memory store for testing.
///
/// `poison` marks a document name so that its next operations fail, for
/// exercising the error-alert paths.
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Vec<u8>>>,
    poisoned: RwLock<HashSet<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            poisoned: RwLock::new(HashSet::new()),
        }
    }

    /// Make every subsequent operation on `doc_name` fail.
    pub fn poison(&self, doc_name: &str) {
        self.poisoned.write().unwrap().insert(doc_name.to_string());
    }

    /// Whether a database exists for `doc_name`.
    pub fn contains(&self, doc_name: &str) -> bool {
        self.docs.read().unwrap().contains_key(doc_name)
    }

    /// Names of all stored databases.
    pub fn names(&self) -> Vec<String> {
        self.docs.read().unwrap().keys().cloned().collect()
    }

    fn check(&self, doc_name: &str) -> bool {
        self.poisoned.read().unwrap().contains(doc_name)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for InMemoryStore {
    async fn load(&self, doc_name: &str) -> Result<Option<Vec<u8>>> {
        if self.check(doc_name) {
            return Err(StoreError::Open(doc_name.to_string()));
        }
        Ok(self.docs.read().unwrap().get(doc_name).cloned())
    }

    async fn save(&self, doc_name: &str, snapshot: &[u8]) -> Result<()> {
        if self.check(doc_name) {
            return Err(StoreError::Write(doc_name.to_string()));
        }
        self.docs
            .write()
            .unwrap()
            .insert(doc_name.to_string(), snapshot.to_vec());
        Ok(())
    }

    async fn delete(&self, doc_name: &str) -> Result<()> {
        if self.check(doc_name) {
            return Err(StoreError::Delete(doc_name.to_string()));
        }
        self.docs.write().unwrap().remove(doc_name);
        Ok(())
    }
}

// Allow sharing a store between engines in tests.
#[async_trait]
impl<T: DocStore + Send + Sync> DocStore for std::sync::Arc<T> {
    async fn load(&self, doc_name: &str) -> Result<Option<Vec<u8>>> {
        (**self).load(doc_name).await
    }

    async fn save(&self, doc_name: &str, snapshot: &[u8]) -> Result<()> {
        (**self).save(doc_name, snapshot).await
    }

    async fn delete(&self, doc_name: &str) -> Result<()> {
        (**self).delete(doc_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_absent_is_none() {
        let store = InMemoryStore::new();
        assert!(store.load("ws/thought/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = InMemoryStore::new();
        store.save("ws/thought/x", b"snapshot").await.unwrap();
        assert_eq!(
            store.load("ws/thought/x").await.unwrap().as_deref(),
            Some(b"snapshot".as_slice())
        );
    }

    #[tokio::test]
    async fn test_delete_is_tolerant() {
        let store = InMemoryStore::new();
        // Deleting a database that was never written succeeds.
        store.delete("ws/thought/missing").await.unwrap();

        store.save("ws/thought/x", b"snapshot").await.unwrap();
        store.delete("ws/thought/x").await.unwrap();
        assert!(!store.contains("ws/thought/x"));
    }

    #[tokio::test]
    async fn test_poisoned_operations_fail() {
        let store = InMemoryStore::new();
        store.poison("ws/thought/x");
        assert!(store.load("ws/thought/x").await.is_err());
        assert!(store.save("ws/thought/x", b"s").await.is_err());
        assert!(store.delete("ws/thought/x").await.is_err());

        // Other names are unaffected.
        store.save("ws/thought/y", b"s").await.unwrap();
    }
}
