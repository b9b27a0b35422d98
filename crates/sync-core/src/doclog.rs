//! The doclog: a single CRDT document unifying all per-entity change streams
//! into one replication stream.
//!
//! Two append-only lists carry `(id, action)` entries - `thought_log` and
//! `lexeme_log`. A device appends an entry for every local update or delete;
//! remote devices observe inserted entries and replicate (or delete) the
//! referenced documents. Deletions are explicit `Delete` entries, so the
//! absence of remote data is never misread as deletion.
//!
//! The only compaction is the tail elision: an append whose head entry
//! equals the current tail (same id, same action) drops that entry.

use crate::docname::doclog_doc_name;
use crate::types::Action;
use loro::{ExportMode, LoroDoc, LoroList, LoroResult, LoroValue, ValueOrContainer, VersionVector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const THOUGHT_LOG: &str = "thought_log";
pub const LEXEME_LOG: &str = "lexeme_log";
const META: &str = "_meta";

/// One entry of a log: which entity changed and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub action: Action,
}

impl LogEntry {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }
}

/// The singleton change-stream document for a workspace.
pub struct DocLog {
    doc: LoroDoc,
    name: String,
}

impl DocLog {
    pub fn new(workspace: &str) -> Self {
        Self {
            doc: LoroDoc::new(),
            name: doclog_doc_name(workspace),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thought_entries(&self) -> Vec<LogEntry> {
        read_log(&self.doc.get_list(THOUGHT_LOG))
    }

    pub fn lexeme_entries(&self) -> Vec<LogEntry> {
        read_log(&self.doc.get_list(LEXEME_LOG))
    }

    /// The application-level schema version recorded with the last append.
    pub fn schema_version(&self) -> Option<i64> {
        match self.doc.get_map(META).get("schemaVersion") {
            Some(ValueOrContainer::Value(LoroValue::I64(v))) => Some(v),
            _ => None,
        }
    }

    /// Append both logs in a single transaction. Each log's head entry is
    /// elided when it equals the current tail. Returns whether anything was
    /// appended.
    pub fn append(
        &self,
        thoughts: &[LogEntry],
        lexemes: &[LogEntry],
        schema_version: u32,
    ) -> LoroResult<bool> {
        let appended_thoughts = append_log(&self.doc.get_list(THOUGHT_LOG), thoughts)?;
        let appended_lexemes = append_log(&self.doc.get_list(LEXEME_LOG), lexemes)?;
        let appended = appended_thoughts || appended_lexemes;
        if appended {
            self.doc
                .get_map(META)
                .insert("schemaVersion", schema_version as i64)?;
            self.doc.commit();
        }
        Ok(appended)
    }

    /// Import a remote delta and return the entries it inserted into each
    /// log, oldest first.
    ///
    /// The lists are append-only and an import preserves the relative order
    /// of existing entries, so the insertions are recovered by a subsequence
    /// walk of the before/after contents.
    pub fn apply_update(&self, data: &[u8]) -> LoroResult<(Vec<LogEntry>, Vec<LogEntry>)> {
        let thoughts_before = self.thought_entries();
        let lexemes_before = self.lexeme_entries();
        self.doc.import(data)?;
        Ok((
            inserted(&thoughts_before, &self.thought_entries()),
            inserted(&lexemes_before, &self.lexeme_entries()),
        ))
    }

    /// Load the persisted snapshot on open.
    pub fn load(&self, snapshot: &[u8]) -> LoroResult<()> {
        self.doc.import(snapshot)?;
        Ok(())
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc.export(ExportMode::Snapshot).unwrap()
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Vec<u8> {
        self.doc.export(ExportMode::updates(from)).unwrap()
    }

    /// Get current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }
}

/// Reduce freshly inserted entries to the ones worth servicing: newest
/// first, one per id. For a burst of entries against the same id only the
/// newest action survives.
pub fn newest_first_dedup(entries: &[LogEntry]) -> Vec<LogEntry> {
    let mut seen = HashSet::new();
    let mut plan = Vec::new();
    for entry in entries.iter().rev() {
        if seen.insert(entry.id.clone()) {
            plan.push(entry.clone());
        }
    }
    plan
}

fn append_log(list: &LoroList, entries: &[LogEntry]) -> LoroResult<bool> {
    if entries.is_empty() {
        return Ok(false);
    }
    let mut rest = entries;
    if let (Some(tail), Some(head)) = (last_entry(list), entries.first()) {
        if tail == *head {
            rest = &entries[1..];
        }
    }
    for entry in rest {
        list.push(serde_json::json!([entry.id, entry.action.as_str()]))?;
    }
    Ok(!rest.is_empty())
}

fn last_entry(list: &LoroList) -> Option<LogEntry> {
    let len = list.len();
    if len == 0 {
        return None;
    }
    parse_entry(list.get(len - 1)?)
}

fn parse_entry(value: ValueOrContainer) -> Option<LogEntry> {
    let items = match value {
        ValueOrContainer::Value(LoroValue::List(items)) => items,
        _ => return None,
    };
    let id = match items.get(0)? {
        LoroValue::String(s) => s.to_string(),
        _ => return None,
    };
    let action = match items.get(1)? {
        LoroValue::String(s) => Action::parse(&s.to_string())?,
        _ => return None,
    };
    Some(LogEntry { id, action })
}

fn read_log(list: &LoroList) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    list.for_each(|value| {
        if let Some(entry) = parse_entry(value) {
            entries.push(entry);
        }
    });
    entries
}

/// Entries of `after` that are not part of the `before` subsequence.
fn inserted(before: &[LogEntry], after: &[LogEntry]) -> Vec<LogEntry> {
    let mut result = Vec::new();
    let mut i = 0;
    for entry in after {
        if i < before.len() && before[i] == *entry {
            i += 1;
        } else {
            result.push(entry.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let log = DocLog::new("ws");
        log.append(
            &[
                LogEntry::new("a", Action::Update),
                LogEntry::new("b", Action::Delete),
            ],
            &[LogEntry::new("cat", Action::Update)],
            1,
        )
        .unwrap();

        assert_eq!(
            log.thought_entries(),
            vec![
                LogEntry::new("a", Action::Update),
                LogEntry::new("b", Action::Delete),
            ]
        );
        assert_eq!(log.lexeme_entries(), vec![LogEntry::new("cat", Action::Update)]);
        assert_eq!(log.schema_version(), Some(1));
    }

    #[test]
    fn test_tail_dedup_elides_head() {
        let log = DocLog::new("ws");
        log.append(&[LogEntry::new("a", Action::Update)], &[], 1)
            .unwrap();
        // Head equals tail: nothing appended.
        let appended = log
            .append(&[LogEntry::new("a", Action::Update)], &[], 1)
            .unwrap();
        assert!(!appended);
        assert_eq!(log.thought_entries().len(), 1);
    }

    #[test]
    fn test_tail_dedup_only_checks_head() {
        let log = DocLog::new("ws");
        log.append(&[LogEntry::new("a", Action::Update)], &[], 1)
            .unwrap();
        // Head dedups against the tail; the rest appends even when it
        // repeats earlier entries.
        log.append(
            &[
                LogEntry::new("a", Action::Update),
                LogEntry::new("b", Action::Update),
                LogEntry::new("a", Action::Update),
            ],
            &[],
            1,
        )
        .unwrap();

        assert_eq!(
            log.thought_entries(),
            vec![
                LogEntry::new("a", Action::Update),
                LogEntry::new("b", Action::Update),
                LogEntry::new("a", Action::Update),
            ]
        );
    }

    #[test]
    fn test_different_action_is_not_deduped() {
        let log = DocLog::new("ws");
        log.append(&[LogEntry::new("a", Action::Update)], &[], 1)
            .unwrap();
        log.append(&[LogEntry::new("a", Action::Delete)], &[], 1)
            .unwrap();
        assert_eq!(log.thought_entries().len(), 2);
    }

    #[test]
    fn test_apply_update_reports_insertions() {
        let local = DocLog::new("ws");
        local
            .append(&[LogEntry::new("a", Action::Update)], &[], 1)
            .unwrap();

        let remote = DocLog::new("ws");
        remote.load(&local.export_snapshot()).unwrap();
        remote
            .append(
                &[
                    LogEntry::new("b", Action::Update),
                    LogEntry::new("a", Action::Delete),
                ],
                &[LogEntry::new("cat", Action::Update)],
                1,
            )
            .unwrap();

        let delta = remote.export_updates(&local.version());
        let (thoughts, lexemes) = local.apply_update(&delta).unwrap();

        assert_eq!(
            thoughts,
            vec![
                LogEntry::new("b", Action::Update),
                LogEntry::new("a", Action::Delete),
            ]
        );
        assert_eq!(lexemes, vec![LogEntry::new("cat", Action::Update)]);
    }

    #[test]
    fn test_reapplying_same_delta_inserts_nothing() {
        let local = DocLog::new("ws");
        let remote = DocLog::new("ws");
        remote
            .append(&[LogEntry::new("a", Action::Update)], &[], 1)
            .unwrap();

        let snapshot = remote.export_snapshot();
        let (first, _) = local.apply_update(&snapshot).unwrap();
        assert_eq!(first.len(), 1);

        let (second, _) = local.apply_update(&snapshot).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_newest_first_dedup() {
        // Oldest-to-newest burst: [a, b, a]. Exactly one entry per id
        // survives and the surviving `a` is the newest action.
        let inserted = vec![
            LogEntry::new("a", Action::Update),
            LogEntry::new("b", Action::Update),
            LogEntry::new("a", Action::Delete),
        ];
        let plan = newest_first_dedup(&inserted);
        assert_eq!(
            plan,
            vec![
                LogEntry::new("a", Action::Delete),
                LogEntry::new("b", Action::Update),
            ]
        );
    }
}
