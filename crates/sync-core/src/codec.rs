//! Projection between plain entity values and their CRDT document shape.
//!
//! Each entity document holds a single root map. Scalar fields live directly
//! on the root; `children` (thoughts) and `contexts` (lexemes) are nested
//! CRDT maps so concurrent insertions and deletions merge per key. The
//! nested maps are created on demand and diffed in place - never replaced
//! wholesale, which would discard concurrent edits.

use crate::types::{ChildKey, Lexeme, Thought, ThoughtId};
use loro::{Container, LoroDoc, LoroMap, LoroResult, LoroValue, ValueOrContainer};
use std::collections::BTreeMap;

/// Name of the root map in every entity document.
pub const ROOT_MAP: &str = "data";

const CHILDREN: &str = "children";
const CONTEXTS: &str = "contexts";

/// Overwrite the document's root map from a thought. Runs inside the
/// caller's transaction; the caller commits.
pub fn write_thought(doc: &LoroDoc, thought: &Thought) -> LoroResult<()> {
    let root = doc.get_map(ROOT_MAP);
    root.insert("id", thought.id.as_str())?;
    match &thought.parent_id {
        Some(parent) => root.insert("parentId", parent.as_str())?,
        None => root.insert("parentId", LoroValue::Null)?,
    }
    root.insert("value", thought.value.as_str())?;
    root.insert("rank", thought.rank)?;
    root.insert("lastUpdated", thought.last_updated)?;

    let children = root.get_or_create_container(CHILDREN, LoroMap::new())?;
    let mut existing = Vec::new();
    children.for_each(|key, _| existing.push(key.to_string()));
    for key in existing.iter().filter(|k| !thought.children.contains_key(*k)) {
        children.delete(key)?;
    }
    for (key, child_id) in &thought.children {
        let current = children.get(key).and_then(|v| match v {
            ValueOrContainer::Value(LoroValue::String(s)) => Some(s.to_string()),
            _ => None,
        });
        if current.as_deref() != Some(child_id.as_str()) {
            children.insert(key, child_id.as_str())?;
        }
    }
    Ok(())
}

/// Project the document back into a thought. Returns `None` when the root
/// map is empty (a document that has never been written).
pub fn read_thought(doc: &LoroDoc) -> Option<Thought> {
    let root = doc.get_map(ROOT_MAP);
    let map = match root.get_deep_value() {
        LoroValue::Map(map) if !map.is_empty() => map,
        _ => return None,
    };

    let id = match map.get("id") {
        Some(LoroValue::String(s)) => s.to_string(),
        _ => return None,
    };
    let parent_id = match map.get("parentId") {
        Some(LoroValue::String(s)) => Some(s.to_string()),
        _ => None,
    };
    let value = match map.get("value") {
        Some(LoroValue::String(s)) => s.to_string(),
        _ => String::new(),
    };
    let rank = match map.get("rank") {
        Some(LoroValue::Double(d)) => *d,
        Some(LoroValue::I64(i)) => *i as f64,
        _ => 0.0,
    };
    let last_updated = match map.get("lastUpdated") {
        Some(LoroValue::I64(i)) => *i,
        Some(LoroValue::Double(d)) => *d as i64,
        _ => 0,
    };

    Some(Thought {
        id,
        parent_id,
        value,
        rank,
        last_updated,
        children: child_entries(&root),
    })
}

/// Overwrite the document's root map from a lexeme.
pub fn write_lexeme(doc: &LoroDoc, key: &str, lexeme: &Lexeme) -> LoroResult<()> {
    let root = doc.get_map(ROOT_MAP);
    root.insert("lemma", key)?;
    root.insert("created", lexeme.created)?;
    root.insert("lastUpdated", lexeme.last_updated)?;

    let contexts = root.get_or_create_container(CONTEXTS, LoroMap::new())?;
    let mut existing = Vec::new();
    contexts.for_each(|id, _| existing.push(id.to_string()));
    for id in existing
        .iter()
        .filter(|existing_id| !lexeme.contexts.contains(*existing_id))
    {
        contexts.delete(id)?;
    }
    for id in &lexeme.contexts {
        if contexts.get(id).is_none() {
            contexts.insert(id, true)?;
        }
    }
    Ok(())
}

/// Project the document back into a lexeme. Returns `None` when the root map
/// is empty.
pub fn read_lexeme(doc: &LoroDoc) -> Option<Lexeme> {
    let root = doc.get_map(ROOT_MAP);
    let map = match root.get_deep_value() {
        LoroValue::Map(map) if !map.is_empty() => map,
        _ => return None,
    };

    let created = match map.get("created") {
        Some(LoroValue::I64(i)) => *i,
        _ => 0,
    };
    let last_updated = match map.get("lastUpdated") {
        Some(LoroValue::I64(i)) => *i,
        _ => 0,
    };

    let mut contexts: Vec<ThoughtId> = context_keys(&root);
    contexts.sort();

    Some(Lexeme {
        created,
        last_updated,
        contexts,
    })
}

/// Read the nested children map, tolerating both shapes the library can
/// return: a live nested map container, or an already-serialized plain map
/// value.
fn child_entries(root: &LoroMap) -> BTreeMap<ChildKey, ThoughtId> {
    let mut children = BTreeMap::new();
    match root.get(CHILDREN) {
        Some(ValueOrContainer::Container(Container::Map(map))) => {
            map.for_each(|key, value| {
                if let ValueOrContainer::Value(LoroValue::String(s)) = value {
                    children.insert(key.to_string(), s.to_string());
                }
            });
        }
        Some(ValueOrContainer::Value(LoroValue::Map(map))) => {
            for (key, value) in map.iter() {
                if let LoroValue::String(s) = value {
                    children.insert(key.clone(), s.to_string());
                }
            }
        }
        _ => {}
    }
    children
}

/// Keys of the contexts map, tolerating both shapes like `child_entries`.
fn context_keys(root: &LoroMap) -> Vec<ThoughtId> {
    let mut contexts = Vec::new();
    match root.get(CONTEXTS) {
        Some(ValueOrContainer::Container(Container::Map(map))) => {
            map.for_each(|id, _| {
                contexts.push(id.to_string());
            });
        }
        Some(ValueOrContainer::Value(LoroValue::Map(map))) => {
            for (id, _) in map.iter() {
                contexts.push(id.clone());
            }
        }
        _ => {}
    }
    contexts
}
