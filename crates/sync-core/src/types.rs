//! Entity types shared across the replication core.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque id of a thought (a node in the outliner tree).
pub type ThoughtId = String;

/// Key of a lexeme: the normalized value it indexes.
pub type LexemeKey = String;

/// Key of a child entry within a thought's `children` map.
pub type ChildKey = String;

/// A node in the outliner tree.
///
/// `children` maps child keys to child thought ids. The ordering of the map
/// is not meaningful for replication; ranks order siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thought {
    pub id: ThoughtId,
    /// None for the root thought.
    pub parent_id: Option<ThoughtId>,
    pub value: String,
    pub rank: f64,
    /// Milliseconds since the Unix epoch.
    pub last_updated: i64,
    pub children: BTreeMap<ChildKey, ThoughtId>,
}

impl Thought {
    /// A fresh root thought, as created on first run and after `clear`.
    pub fn root() -> Self {
        Self {
            id: crate::HOME_TOKEN.to_string(),
            parent_id: None,
            value: String::new(),
            rank: 0.0,
            last_updated: 0,
            children: BTreeMap::new(),
        }
    }
}

/// A value-indexed reverse reference: every thought whose value matches the
/// lexeme's key appears in `contexts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lexeme {
    /// Milliseconds since the Unix epoch.
    pub created: i64,
    /// Milliseconds since the Unix epoch.
    pub last_updated: i64,
    /// Unordered; the CRDT form is a map `ThoughtId -> true`.
    pub contexts: Vec<ThoughtId>,
}

/// Tag distinguishing presence from absence in the doclog. Absence of remote
/// data must never be read as deletion; only `Delete` means deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip() {
        assert_eq!(Action::parse("update"), Some(Action::Update));
        assert_eq!(Action::parse("delete"), Some(Action::Delete));
        assert_eq!(Action::parse("rename"), None);
        assert_eq!(Action::Update.as_str(), "update");
    }

    #[test]
    fn test_root_thought() {
        let root = Thought::root();
        assert_eq!(root.id, crate::HOME_TOKEN);
        assert!(root.parent_id.is_none());
        assert!(root.children.is_empty());
    }
}
