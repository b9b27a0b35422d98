//! In-memory table of live entity documents, one registry per entity kind.
//!
//! At most one live document exists per id. An entry owns the document
//! together with its persistence binding (document name, first-sync flag)
//! and the version last published to the remote transport. Removing an
//! entry drops the document; the backing database is deleted separately by
//! name, tolerating the case where no persistence instance exists.

use loro::{LoroDoc, VersionVector};
use std::collections::HashMap;

/// A live document and its provider bindings.
pub struct DocEntry {
    pub doc: LoroDoc,
    /// The document name the entry is bound to in the store and transport.
    pub name: String,
    /// Whether the first sync-from-store has completed.
    pub synced: bool,
    /// Version last pushed through the transport; publishes export the
    /// updates since this point.
    pub published: VersionVector,
}

impl DocEntry {
    fn new(name: String) -> Self {
        Self {
            doc: LoroDoc::new(),
            name,
            synced: false,
            published: VersionVector::default(),
        }
    }
}

/// Registry of live documents for one entity kind.
#[derive(Default)]
pub struct DocRegistry {
    docs: HashMap<String, DocEntry>,
}

impl DocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `id`, creating an empty document bound to
    /// `document_name` if none exists.
    pub fn ensure(&mut self, id: &str, document_name: &str) -> &mut DocEntry {
        self.docs
            .entry(id.to_string())
            .or_insert_with(|| DocEntry::new(document_name.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&DocEntry> {
        self.docs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DocEntry> {
        self.docs.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    /// Drop the entry and its document. Returns the document name the entry
    /// was bound to, for the caller to delete the backing database and
    /// detach the transport.
    pub fn remove(&mut self, id: &str) -> Option<String> {
        self.docs.remove(id).map(|entry| entry.name)
    }

    pub fn ids(&self) -> Vec<String> {
        self.docs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let mut registry = DocRegistry::new();
        registry.ensure("a", "ws/thought/a").doc.commit();
        let before = registry.len();
        registry.ensure("a", "ws/thought/a");
        assert_eq!(registry.len(), before);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_at_most_one_live_doc_per_id() {
        let mut registry = DocRegistry::new();
        // Write through one ensure, read through another: same document.
        {
            let entry = registry.ensure("a", "ws/thought/a");
            entry.doc.get_map("data").insert("id", "a").unwrap();
            entry.doc.commit();
        }
        let entry = registry.ensure("a", "ws/thought/a");
        assert!(matches!(
            entry.doc.get_map("data").get("id"),
            Some(loro::ValueOrContainer::Value(loro::LoroValue::String(_)))
        ));
    }

    #[test]
    fn test_remove_returns_binding_name() {
        let mut registry = DocRegistry::new();
        registry.ensure("a", "ws/thought/a");
        assert_eq!(registry.remove("a").as_deref(), Some("ws/thought/a"));
        assert!(!registry.contains("a"));
        assert!(registry.remove("a").is_none());
    }
}
