//! sync-core: Replication and persistence core for a local-first outliner.
//!
//! This crate provides the core functionality for:
//! - Per-entity CRDT documents for Thoughts and Lexemes (Loro)
//! - Two-level persistence: a local document store plus a remote relay
//! - The doclog, a unified append-only change stream of `(id, action)` pairs
//! - A bounded-concurrency replication queue with progress reporting
//!
//! The application state store, UI, and server relay are external; the engine
//! talks to them through the `DocStore`, `Transport`, `Dispatcher`, and
//! `PushSink` traits.

pub mod codec;
pub mod dispatch;
pub mod doclog;
pub mod docname;
pub mod engine;
pub mod pushing;
pub mod queue;
pub mod registry;
pub mod store;
pub mod transport;
pub mod types;

pub use dispatch::{Dispatcher, PushProgress, PushSink, StateUpdate};
pub use doclog::{DocLog, LogEntry};
pub use docname::{DocumentName, EntityKind};
pub use engine::{Engine, EngineConfig, EngineError};
pub use queue::{Task, TaskQueue};
pub use store::{DocStore, InMemoryStore, StoreError};
pub use transport::{CapturingTransport, NullTransport, Transport, TransportError};
pub use types::{Action, Lexeme, LexemeKey, Thought, ThoughtId};

/// Id of the root thought. Every workspace has exactly one.
pub const HOME_TOKEN: &str = "__ROOT__";
