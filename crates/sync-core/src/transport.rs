//! Remote transport abstraction.
//!
//! The transport bidirectionally synchronizes named documents with a relay
//! over a shared workspace socket. The engine pushes outgoing CRDT updates
//! through `publish`; the host's transport driver feeds incoming deltas back
//! into `Engine::apply_remote_update`.
//!
//! Transport failures are recoverable by design: CRDT convergence repairs any
//! gap on reconnect, so callers log and continue.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Bidirectional CRDT sync over a shared workspace socket, bound by document
/// name and an access token.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a document to the workspace socket.
    async fn attach(&self, doc_name: &str, access_token: &str) -> Result<()>;

    /// Push an outgoing CRDT update for a bound document.
    async fn publish(&self, doc_name: &str, update: Vec<u8>) -> Result<()>;

    /// Unbind a document (on delete or teardown).
    async fn detach(&self, doc_name: &str);
}

/// Transport that does nothing. The test-mode configuration.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn attach(&self, _doc_name: &str, _access_token: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, _doc_name: &str, _update: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn detach(&self, _doc_name: &str) {}
}

/// Transport that records everything published, for tests that relay updates
/// between engines by hand.
pub struct CapturingTransport {
    attached: Mutex<HashSet<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CapturingTransport {
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(HashSet::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// All `(doc_name, update)` pairs published so far, oldest first.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Drain the published updates, leaving the capture empty.
    pub fn take_published(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }

    pub fn is_attached(&self, doc_name: &str) -> bool {
        self.attached.lock().unwrap().contains(doc_name)
    }
}

impl Default for CapturingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for CapturingTransport {
    async fn attach(&self, doc_name: &str, _access_token: &str) -> Result<()> {
        self.attached.lock().unwrap().insert(doc_name.to_string());
        Ok(())
    }

    async fn publish(&self, doc_name: &str, update: Vec<u8>) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((doc_name.to_string(), update));
        Ok(())
    }

    async fn detach(&self, doc_name: &str) {
        self.attached.lock().unwrap().remove(doc_name);
    }
}
