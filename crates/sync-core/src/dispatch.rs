//! Dispatcher and push-sink contracts.
//!
//! The dispatcher is the engine's channel into the application state store:
//! state updates for replicated entities, alerts for recoverable failures,
//! and presence queries that gate observer dispatch. The push sink reflects
//! in-flight work (`is_pushing`) and replication progress in the UI.

use crate::types::{Lexeme, LexemeKey, Thought, ThoughtId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// A state update pushed into the application store.
///
/// `None` values remove the entity from the state indices.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub thought_index_updates: HashMap<ThoughtId, Option<Thought>>,
    pub lexeme_index_updates: HashMap<LexemeKey, Option<Lexeme>>,
    /// Whether the update originates from a local edit.
    pub local: bool,
    /// Whether the update should be pushed back to the remote.
    pub remote: bool,
    /// Whether the host should re-anchor the cursor after applying.
    pub repair_cursor: bool,
}

impl StateUpdate {
    /// An update produced by replication: not local, not re-pushed, and the
    /// cursor is repaired after applying.
    pub fn replicated() -> Self {
        Self {
            repair_cursor: true,
            ..Self::default()
        }
    }
}

/// The application state store, as seen by the engine.
pub trait Dispatcher: Send + Sync {
    /// Apply a replication-driven state update.
    fn dispatch(&self, update: StateUpdate);

    /// Surface a recoverable failure to the user.
    fn alert(&self, message: &str);

    /// Whether the thought is present in the application state.
    fn has_thought(&self, id: &str) -> bool;

    /// Whether the lexeme is present in the application state.
    fn has_lexeme(&self, key: &str) -> bool;
}

/// Incremental progress for the push/progress sink. `None` fields are
/// unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PushProgress {
    pub is_pushing: Option<bool>,
    /// `complete / total` for the current replication burst.
    pub replication_progress: Option<f64>,
}

/// Sink reflecting in-flight work.
pub trait PushSink: Send + Sync {
    fn update(&self, progress: PushProgress);
}

/// Dispatcher double that records everything and answers presence queries
/// from a settable id set.
pub struct RecordingDispatcher {
    updates: Mutex<Vec<StateUpdate>>,
    alerts: Mutex<Vec<String>>,
    thoughts: Mutex<std::collections::HashSet<String>>,
    lexemes: Mutex<std::collections::HashSet<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            thoughts: Mutex::new(std::collections::HashSet::new()),
            lexemes: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Mark a thought as present in the application state.
    pub fn insert_thought(&self, id: &str) {
        self.thoughts.lock().unwrap().insert(id.to_string());
    }

    /// Mark a lexeme as present in the application state.
    pub fn insert_lexeme(&self, key: &str) {
        self.lexemes.lock().unwrap().insert(key.to_string());
    }

    pub fn updates(&self) -> Vec<StateUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, update: StateUpdate) {
        // Keep the presence set in step with the dispatched updates, the way
        // the reducer host would.
        {
            let mut thoughts = self.thoughts.lock().unwrap();
            for (id, value) in &update.thought_index_updates {
                match value {
                    Some(_) => {
                        thoughts.insert(id.clone());
                    }
                    None => {
                        thoughts.remove(id);
                    }
                }
            }
            let mut lexemes = self.lexemes.lock().unwrap();
            for (key, value) in &update.lexeme_index_updates {
                match value {
                    Some(_) => {
                        lexemes.insert(key.clone());
                    }
                    None => {
                        lexemes.remove(key);
                    }
                }
            }
        }
        self.updates.lock().unwrap().push(update);
    }

    fn alert(&self, message: &str) {
        self.alerts.lock().unwrap().push(message.to_string());
    }

    fn has_thought(&self, id: &str) -> bool {
        self.thoughts.lock().unwrap().contains(id)
    }

    fn has_lexeme(&self, key: &str) -> bool {
        self.lexemes.lock().unwrap().contains(key)
    }
}

/// Push-sink double that records every update and folds the latest flags.
pub struct RecordingPusher {
    history: Mutex<Vec<PushProgress>>,
}

impl RecordingPusher {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn history(&self) -> Vec<PushProgress> {
        self.history.lock().unwrap().clone()
    }

    /// Latest `is_pushing` flag seen, defaulting to false.
    pub fn is_pushing(&self) -> bool {
        self.history
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|p| p.is_pushing)
            .unwrap_or(false)
    }

    /// Latest replication progress seen.
    pub fn replication_progress(&self) -> Option<f64> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|p| p.replication_progress)
    }
}

impl Default for RecordingPusher {
    fn default() -> Self {
        Self::new()
    }
}

impl PushSink for RecordingPusher {
    fn update(&self, progress: PushProgress) {
        self.history.lock().unwrap().push(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_dispatcher_tracks_presence() {
        let dispatcher = RecordingDispatcher::new();
        assert!(!dispatcher.has_thought("a"));

        let mut update = StateUpdate::replicated();
        update
            .thought_index_updates
            .insert("a".to_string(), Some(Thought::root()));
        dispatcher.dispatch(update);

        assert!(dispatcher.has_thought("a"));
        assert_eq!(dispatcher.updates().len(), 1);

        let mut removal = StateUpdate::replicated();
        removal.thought_index_updates.insert("a".to_string(), None);
        dispatcher.dispatch(removal);
        assert!(!dispatcher.has_thought("a"));
    }

    #[test]
    fn test_recording_pusher_latest_flags() {
        let pusher = RecordingPusher::new();
        assert!(!pusher.is_pushing());

        pusher.update(PushProgress {
            is_pushing: Some(true),
            replication_progress: None,
        });
        pusher.update(PushProgress {
            is_pushing: None,
            replication_progress: Some(0.5),
        });

        assert!(pusher.is_pushing());
        assert_eq!(pusher.replication_progress(), Some(0.5));
    }
}
