//! Document-name codec.
//!
//! Every CRDT document is addressed by a name scoped to a workspace:
//!
//! - `<workspace>/thought/<id>`
//! - `<workspace>/lexeme/<key>`
//! - `<workspace>/doclog`
//!
//! Ids and keys may themselves contain `/`; the workspace segment may not.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum NameError {
    #[error("Unknown document kind in name: {0}")]
    UnknownKind(String),

    #[error("Missing id in document name: {0}")]
    MissingId(String),

    #[error("Malformed document name: {0}")]
    Malformed(String),
}

/// The kind of document a name addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Thought,
    Lexeme,
    DocLog,
}

impl EntityKind {
    fn segment(&self) -> &'static str {
        match self {
            EntityKind::Thought => "thought",
            EntityKind::Lexeme => "lexeme",
            EntityKind::DocLog => "doclog",
        }
    }
}

/// A parsed document name.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentName {
    pub workspace: String,
    pub kind: EntityKind,
    /// Absent for the doclog.
    pub id: Option<String>,
}

/// `<workspace>/thought/<id>`
pub fn thought_doc_name(workspace: &str, id: &str) -> String {
    format!("{}/thought/{}", workspace, id)
}

/// `<workspace>/lexeme/<key>`
pub fn lexeme_doc_name(workspace: &str, key: &str) -> String {
    format!("{}/lexeme/{}", workspace, key)
}

/// `<workspace>/doclog`
pub fn doclog_doc_name(workspace: &str) -> String {
    format!("{}/doclog", workspace)
}

/// Parse a document name back into its parts.
pub fn parse(name: &str) -> Result<DocumentName, NameError> {
    let (workspace, rest) = name
        .split_once('/')
        .ok_or_else(|| NameError::Malformed(name.to_string()))?;

    if rest == "doclog" {
        return Ok(DocumentName {
            workspace: workspace.to_string(),
            kind: EntityKind::DocLog,
            id: None,
        });
    }

    let (kind, id) = match rest.split_once('/') {
        Some(("thought", id)) => (EntityKind::Thought, id),
        Some(("lexeme", id)) => (EntityKind::Lexeme, id),
        Some((other, _)) => return Err(NameError::UnknownKind(other.to_string())),
        None => return Err(NameError::UnknownKind(rest.to_string())),
    };

    if id.is_empty() {
        return Err(NameError::MissingId(name.to_string()));
    }

    Ok(DocumentName {
        workspace: workspace.to_string(),
        kind,
        id: Some(id.to_string()),
    })
}

impl DocumentName {
    /// Re-encode into the canonical string form.
    pub fn encode(&self) -> String {
        match &self.id {
            Some(id) => format!("{}/{}/{}", self.workspace, self.kind.segment(), id),
            None => format!("{}/{}", self.workspace, self.kind.segment()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoders_bit_exact() {
        assert_eq!(thought_doc_name("ws1", "abc"), "ws1/thought/abc");
        assert_eq!(lexeme_doc_name("ws1", "cat"), "ws1/lexeme/cat");
        assert_eq!(doclog_doc_name("ws1"), "ws1/doclog");
    }

    #[test]
    fn test_parse_thought() {
        let parsed = parse("ws1/thought/abc").unwrap();
        assert_eq!(parsed.workspace, "ws1");
        assert_eq!(parsed.kind, EntityKind::Thought);
        assert_eq!(parsed.id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_doclog_has_no_id() {
        let parsed = parse("ws1/doclog").unwrap();
        assert_eq!(parsed.kind, EntityKind::DocLog);
        assert!(parsed.id.is_none());
    }

    #[test]
    fn test_id_may_contain_slashes() {
        let parsed = parse("ws1/lexeme/a/b/c").unwrap();
        assert_eq!(parsed.kind, EntityKind::Lexeme);
        assert_eq!(parsed.id.as_deref(), Some("a/b/c"));
        assert_eq!(parsed.encode(), "ws1/lexeme/a/b/c");
    }

    #[test]
    fn test_round_trip() {
        for name in ["ws/thought/x", "ws/lexeme/hello world", "ws/doclog"] {
            assert_eq!(parse(name).unwrap().encode(), name);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse("noslash"), Err(NameError::Malformed(_))));
        assert!(matches!(parse("ws/unknown/x"), Err(NameError::UnknownKind(_))));
        assert!(matches!(parse("ws/banana"), Err(NameError::UnknownKind(_))));
        assert!(matches!(parse("ws/thought/"), Err(NameError::MissingId(_))));
    }
}
