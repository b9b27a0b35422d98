//! The replication engine.
//!
//! Process-wide state is an explicit `Engine` value: the per-kind document
//! registries, the doclog, the replication task queue, the update set, and
//! the root sync gate, plus handles to the consumed providers (store,
//! transport, dispatcher, push sink). The engine is `Arc`-shared and cheap
//! to clone; queue tasks and background flushes hold clones rather than
//! back-pointers into each other.
//!
//! Local writes transact the per-entity document, flush persistence in the
//! background, and append to the doclog. Remote bytes enter through
//! `apply_remote_update`, which is the only path that fires entity and
//! doclog observers - local mutations never observe themselves, which is
//! the origin filter of the underlying design.

use crate::codec;
use crate::dispatch::{Dispatcher, PushProgress, PushSink, StateUpdate};
use crate::doclog::{newest_first_dedup, DocLog, LogEntry};
use crate::docname::{self, EntityKind};
use crate::pushing::{PushingEdge, UpdateSet};
use crate::queue::{Task, TaskQueue, DEFAULT_CONCURRENCY};
use crate::registry::DocRegistry;
use crate::store::DocStore;
use crate::transport::Transport;
use crate::types::{Action, Lexeme, LexemeKey, Thought, ThoughtId};
use crate::HOME_TOKEN;

use loro::{ExportMode, VersionVector};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The document registered for an id is not the target of the event
    /// delivered for that id. Indicates an observer leak.
    #[error("Observer target mismatch for {id}: registered {registered}, event {event}")]
    ObserverInvariant {
        id: String,
        registered: String,
        event: String,
    },

    #[error("Malformed document name: {0}")]
    BadDocumentName(String),
}

/// Engine configuration, constructed by the host.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workspace id scoping every document name.
    pub workspace: String,
    /// Access token handed to the transport on attach.
    pub access_token: String,
    /// Replication queue concurrency.
    pub concurrency: usize,
}

impl EngineConfig {
    pub fn new(workspace: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            access_token: access_token.into(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

struct DocLogState {
    log: DocLog,
    /// Version last pushed through the transport.
    published: VersionVector,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn DocStore>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    pusher: Arc<dyn PushSink>,
    thoughts: Mutex<DocRegistry>,
    lexemes: Mutex<DocRegistry>,
    doclog: Mutex<DocLogState>,
    queue: TaskQueue,
    update_set: std::sync::Mutex<UpdateSet>,
    root_tx: watch::Sender<Option<Thought>>,
    root_rx: watch::Receiver<Option<Thought>>,
    /// In-flight persistence flushes, joinable through `settle`.
    flushes: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Latest application schema version seen; replayed by `clear`.
    schema_version: AtomicU32,
}

/// The replication engine. Clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the engine: load the doclog from local persistence and bind it
    /// to the transport. With `NullTransport` and a fresh `InMemoryStore`
    /// this is the test-mode configuration.
    pub async fn open(
        config: EngineConfig,
        store: Arc<dyn DocStore>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
        pusher: Arc<dyn PushSink>,
    ) -> Self {
        let step_pusher = Arc::clone(&pusher);
        let end_pusher = Arc::clone(&pusher);
        let queue = TaskQueue::new(
            config.concurrency,
            Some(Box::new(move |complete, total| {
                let progress = if total == 0 {
                    1.0
                } else {
                    complete as f64 / total as f64
                };
                step_pusher.update(PushProgress {
                    is_pushing: None,
                    replication_progress: Some(progress),
                });
            })),
            Some(Box::new(move || {
                end_pusher.update(PushProgress {
                    is_pushing: None,
                    replication_progress: Some(1.0),
                });
            })),
        );

        let log = DocLog::new(&config.workspace);
        match store.load(log.name()).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = log.load(&snapshot) {
                    warn!(doc = log.name(), error = %e, "doclog import failed on open");
                    dispatcher.alert("Error loading doclog");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(doc = log.name(), error = %e, "doclog load failed on open");
                dispatcher.alert("Error loading doclog");
            }
        }
        if let Err(e) = transport.attach(log.name(), &config.access_token).await {
            warn!(doc = log.name(), error = %e, "doclog transport attach failed");
        }

        let (root_tx, root_rx) = watch::channel(None);

        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                transport,
                dispatcher,
                pusher,
                thoughts: Mutex::new(DocRegistry::new()),
                lexemes: Mutex::new(DocRegistry::new()),
                doclog: Mutex::new(DocLogState {
                    log,
                    published: VersionVector::default(),
                }),
                queue,
                update_set: std::sync::Mutex::new(UpdateSet::new()),
                root_tx,
                root_rx,
                flushes: std::sync::Mutex::new(Vec::new()),
                schema_version: AtomicU32::new(0),
            }),
        }
    }

    pub fn workspace(&self) -> &str {
        &self.inner.config.workspace
    }

    // ------------------------------------------------------------------
    // Replication (read path)
    // ------------------------------------------------------------------

    /// Open (and keep open) the thought's document so local and remote
    /// changes converge. Never fails; persistence errors are alerted.
    pub async fn replicate_thought(&self, id: &str) {
        let mut registry = self.inner.thoughts.lock().await;
        self.ensure_entity(&mut registry, EntityKind::Thought, id).await;
        if id == HOME_TOKEN {
            if let Some(root) = registry.get(id).and_then(|entry| codec::read_thought(&entry.doc))
            {
                self.resolve_root(root);
            }
        }
    }

    pub async fn replicate_lexeme(&self, key: &str) {
        let mut registry = self.inner.lexemes.lock().await;
        self.ensure_entity(&mut registry, EntityKind::Lexeme, key).await;
    }

    pub async fn replicate_thoughts(&self, ids: &[ThoughtId]) {
        for id in ids {
            self.replicate_thought(id).await;
        }
    }

    pub async fn replicate_lexemes(&self, keys: &[LexemeKey]) {
        for key in keys {
            self.replicate_lexeme(key).await;
        }
    }

    /// Replicate and project a thought.
    pub async fn get_thought_by_id(&self, id: &str) -> Option<Thought> {
        self.replicate_thought(id).await;
        let registry = self.inner.thoughts.lock().await;
        registry.get(id).and_then(|entry| codec::read_thought(&entry.doc))
    }

    /// Replicate and project a lexeme.
    pub async fn get_lexeme_by_id(&self, key: &str) -> Option<Lexeme> {
        self.replicate_lexeme(key).await;
        let registry = self.inner.lexemes.lock().await;
        registry.get(key).and_then(|entry| codec::read_lexeme(&entry.doc))
    }

    pub async fn get_thoughts_by_id(&self, ids: &[ThoughtId]) -> Vec<Option<Thought>> {
        let mut thoughts = Vec::with_capacity(ids.len());
        for id in ids {
            thoughts.push(self.get_thought_by_id(id).await);
        }
        thoughts
    }

    pub async fn get_lexemes_by_id(&self, keys: &[LexemeKey]) -> Vec<Option<Lexeme>> {
        let mut lexemes = Vec::with_capacity(keys.len());
        for key in keys {
            lexemes.push(self.get_lexeme_by_id(key).await);
        }
        lexemes
    }

    /// Resolves once the root thought document has first synced from local
    /// persistence with content.
    pub async fn root_synced(&self) -> Thought {
        let mut rx = self.inner.root_rx.clone();
        let result = match rx.wait_for(|value| value.is_some()).await {
            Ok(guard) => guard.clone().unwrap_or_else(Thought::root),
            // The sender lives as long as the engine.
            Err(_) => Thought::root(),
        };
        result
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Fold a batch of local state mutations into the shared documents.
    ///
    /// `None` values are deletes. Input order is preserved in the doclog.
    /// Resolves when every per-entity transaction has committed and every
    /// delete has finished; persistence flushes continue in the background
    /// (`settle` joins them).
    pub async fn update_thoughts(
        &self,
        thought_updates: Vec<(ThoughtId, Option<Thought>)>,
        lexeme_updates: Vec<(LexemeKey, Option<Lexeme>)>,
        schema_version: u32,
    ) {
        if thought_updates.is_empty() && lexeme_updates.is_empty() {
            return;
        }
        self.inner
            .schema_version
            .store(schema_version, Ordering::Relaxed);

        // One log entry per input id, updates and deletes together, in
        // input order.
        let thought_log: Vec<LogEntry> = thought_updates
            .iter()
            .map(|(id, value)| {
                LogEntry::new(
                    id.clone(),
                    if value.is_some() {
                        Action::Update
                    } else {
                        Action::Delete
                    },
                )
            })
            .collect();
        let lexeme_log: Vec<LogEntry> = lexeme_updates
            .iter()
            .map(|(key, value)| {
                LogEntry::new(
                    key.clone(),
                    if value.is_some() {
                        Action::Update
                    } else {
                        Action::Delete
                    },
                )
            })
            .collect();

        for (id, value) in &thought_updates {
            if let Some(thought) = value {
                self.update_thought(id, thought).await;
            }
        }
        for (key, value) in &lexeme_updates {
            if let Some(lexeme) = value {
                self.update_lexeme(key, lexeme).await;
            }
        }

        self.append_doclog(&thought_log, &lexeme_log, schema_version).await;

        for (id, value) in &thought_updates {
            if value.is_none() {
                self.delete_thought(id).await;
            }
        }
        for (key, value) in &lexeme_updates {
            if value.is_none() {
                self.delete_lexeme(key).await;
            }
        }
    }

    async fn update_thought(&self, id: &str, thought: &Thought) {
        let name = docname::thought_doc_name(&self.inner.config.workspace, id);
        self.push_enqueue(&name);

        let mut registry = self.inner.thoughts.lock().await;
        self.ensure_entity(&mut registry, EntityKind::Thought, id).await;
        let Some(entry) = registry.get_mut(id) else {
            self.push_dequeue(&name);
            return;
        };
        if let Err(e) = codec::write_thought(&entry.doc, thought) {
            warn!(doc = %name, error = %e, "thought transact failed");
            self.inner.dispatcher.alert("Error saving thought");
            self.push_dequeue(&name);
            return;
        }
        entry.doc.commit();
        let snapshot = entry.doc.export(ExportMode::Snapshot).unwrap();
        let update = entry.doc.export(ExportMode::updates(&entry.published)).unwrap();
        entry.published = entry.doc.state_vv();
        drop(registry);

        if id == HOME_TOKEN {
            self.resolve_root(thought.clone());
        }

        if let Err(e) = self.inner.transport.publish(&name, update).await {
            warn!(doc = %name, error = %e, "thought publish failed");
        }

        self.spawn_flush(EntityKind::Thought, name, snapshot, true);
    }

    async fn update_lexeme(&self, key: &str, lexeme: &Lexeme) {
        let name = docname::lexeme_doc_name(&self.inner.config.workspace, key);
        self.push_enqueue(&name);

        let mut registry = self.inner.lexemes.lock().await;
        self.ensure_entity(&mut registry, EntityKind::Lexeme, key).await;
        let Some(entry) = registry.get_mut(key) else {
            self.push_dequeue(&name);
            return;
        };
        if let Err(e) = codec::write_lexeme(&entry.doc, key, lexeme) {
            warn!(doc = %name, error = %e, "lexeme transact failed");
            self.inner.dispatcher.alert("Error saving lexeme");
            self.push_dequeue(&name);
            return;
        }
        entry.doc.commit();
        let snapshot = entry.doc.export(ExportMode::Snapshot).unwrap();
        let update = entry.doc.export(ExportMode::updates(&entry.published)).unwrap();
        entry.published = entry.doc.state_vv();
        drop(registry);

        if let Err(e) = self.inner.transport.publish(&name, update).await {
            warn!(doc = %name, error = %e, "lexeme publish failed");
        }

        self.spawn_flush(EntityKind::Lexeme, name, snapshot, true);
    }

    async fn append_doclog(
        &self,
        thought_log: &[LogEntry],
        lexeme_log: &[LogEntry],
        schema_version: u32,
    ) {
        if thought_log.is_empty() && lexeme_log.is_empty() {
            return;
        }
        let mut state = self.inner.doclog.lock().await;
        match state.log.append(thought_log, lexeme_log, schema_version) {
            Ok(true) => {
                let name = state.log.name().to_string();
                let snapshot = state.log.export_snapshot();
                let update = state.log.export_updates(&state.published);
                state.published = state.log.version();
                drop(state);

                if let Err(e) = self.inner.transport.publish(&name, update).await {
                    warn!(doc = %name, error = %e, "doclog publish failed");
                }
                self.spawn_flush(EntityKind::DocLog, name, snapshot, false);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "doclog append failed");
                self.inner.dispatcher.alert("Error saving doclog");
            }
        }
    }

    // ------------------------------------------------------------------
    // Deletes and teardown
    // ------------------------------------------------------------------

    pub async fn delete_thought(&self, id: &str) {
        self.delete_entity(EntityKind::Thought, id).await;
    }

    pub async fn delete_lexeme(&self, key: &str) {
        self.delete_entity(EntityKind::Lexeme, key).await;
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) {
        let name = self.doc_name(kind, id);
        self.push_enqueue(&name);

        {
            let mut registry = self.registry_of(kind).lock().await;
            // Dropping the entry detaches the observer with it; nothing can
            // fire for this id afterwards.
            registry.remove(id);
        }
        self.inner.transport.detach(&name).await;

        // The backing database is dropped by name, tolerating the case
        // where no persistence instance exists in memory.
        if let Err(e) = self.inner.store.delete(&name).await {
            warn!(doc = %name, error = %e, "failed to drop backing database");
            self.alert_io("deleting", kind);
        }

        self.push_dequeue(&name);
    }

    /// Delete every registered thought and lexeme, reset the doclog, and
    /// replay the default initial state so the root thought exists again.
    pub async fn clear(&self) {
        let thought_ids = self.inner.thoughts.lock().await.ids();
        for id in thought_ids {
            self.delete_thought(&id).await;
        }
        let lexeme_keys = self.inner.lexemes.lock().await.ids();
        for key in lexeme_keys {
            self.delete_lexeme(&key).await;
        }

        {
            let mut state = self.inner.doclog.lock().await;
            let name = state.log.name().to_string();
            if let Err(e) = self.inner.store.delete(&name).await {
                warn!(doc = %name, error = %e, "failed to drop doclog database");
            }
            self.inner.transport.detach(&name).await;
            state.log = DocLog::new(&self.inner.config.workspace);
            state.published = VersionVector::default();
            if let Err(e) = self
                .inner
                .transport
                .attach(&name, &self.inner.config.access_token)
                .await
            {
                warn!(doc = %name, error = %e, "doclog transport attach failed");
            }
        }

        let schema_version = self.inner.schema_version.load(Ordering::Relaxed);
        self.update_thoughts(
            vec![(HOME_TOKEN.to_string(), Some(Thought::root()))],
            Vec::new(),
            schema_version,
        )
        .await;
    }

    // ------------------------------------------------------------------
    // Remote deltas (observers)
    // ------------------------------------------------------------------

    /// Entry point for the transport driver: fold a remote delta for a
    /// named document into the engine.
    ///
    /// Recoverable I/O failures are alerted and swallowed; errors are
    /// reserved for invariant violations.
    pub async fn apply_remote_update(&self, doc_name: &str, data: &[u8]) -> Result<(), EngineError> {
        let parsed = docname::parse(doc_name)
            .map_err(|e| EngineError::BadDocumentName(format!("{doc_name}: {e}")))?;
        match parsed.kind {
            EntityKind::DocLog => self.apply_doclog_update(data).await,
            EntityKind::Thought => {
                let id = parsed
                    .id
                    .ok_or_else(|| EngineError::BadDocumentName(doc_name.to_string()))?;
                self.apply_thought_update(&id, doc_name, data).await
            }
            EntityKind::Lexeme => {
                let key = parsed
                    .id
                    .ok_or_else(|| EngineError::BadDocumentName(doc_name.to_string()))?;
                self.apply_lexeme_update(&key, doc_name, data).await
            }
        }
    }

    /// Doclog observer: replicate or delete every entity the remote delta
    /// names, newest action first, one task per id, bounded by the queue.
    async fn apply_doclog_update(&self, data: &[u8]) -> Result<(), EngineError> {
        let (inserted_thoughts, inserted_lexemes, name, snapshot) = {
            let state = self.inner.doclog.lock().await;
            match state.log.apply_update(data) {
                Ok((thoughts, lexemes)) => (
                    thoughts,
                    lexemes,
                    state.log.name().to_string(),
                    state.log.export_snapshot(),
                ),
                Err(e) => {
                    warn!(error = %e, "doclog import failed");
                    self.inner.dispatcher.alert("Error loading doclog");
                    return Ok(());
                }
            }
        };
        self.spawn_flush(EntityKind::DocLog, name, snapshot, false);

        let mut tasks: Vec<Task> = Vec::new();
        for entry in newest_first_dedup(&inserted_thoughts) {
            tasks.push(self.thought_task(entry));
        }
        for entry in newest_first_dedup(&inserted_lexemes) {
            tasks.push(self.lexeme_task(entry));
        }
        debug!(count = tasks.len(), "doclog delta produced replication tasks");
        if !tasks.is_empty() {
            self.inner.queue.add(tasks).await;
        }
        Ok(())
    }

    fn thought_task(&self, entry: LogEntry) -> Task {
        let engine = self.clone();
        Box::pin(async move {
            match entry.action {
                Action::Update => engine.replicate_thought(&entry.id).await,
                Action::Delete => {
                    let mut update = StateUpdate::replicated();
                    update.thought_index_updates.insert(entry.id.clone(), None);
                    engine.inner.dispatcher.dispatch(update);
                    engine.delete_thought(&entry.id).await;
                }
            }
        })
    }

    fn lexeme_task(&self, entry: LogEntry) -> Task {
        let engine = self.clone();
        Box::pin(async move {
            match entry.action {
                Action::Update => engine.replicate_lexeme(&entry.id).await,
                Action::Delete => {
                    let mut update = StateUpdate::replicated();
                    update.lexeme_index_updates.insert(entry.id.clone(), None);
                    engine.inner.dispatcher.dispatch(update);
                    engine.delete_lexeme(&entry.id).await;
                }
            }
        })
    }

    async fn apply_thought_update(
        &self,
        id: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let mut registry = self.inner.thoughts.lock().await;
        self.ensure_entity(&mut registry, EntityKind::Thought, id).await;
        let Some(entry) = registry.get_mut(id) else {
            return Ok(());
        };
        if entry.name != name {
            return Err(EngineError::ObserverInvariant {
                id: id.to_string(),
                registered: entry.name.clone(),
                event: name.to_string(),
            });
        }
        if let Err(e) = entry.doc.import(data) {
            warn!(doc = %name, error = %e, "thought import failed");
            self.inner.dispatcher.alert("Error loading thought");
            return Ok(());
        }
        let snapshot = entry.doc.export(ExportMode::Snapshot).unwrap();
        let projected = codec::read_thought(&entry.doc);
        drop(registry);

        self.spawn_flush(EntityKind::Thought, name.to_string(), snapshot, false);

        let Some(thought) = projected else {
            return Ok(());
        };

        // Defer a tick so the dispatch cannot nest inside a running reducer.
        tokio::task::yield_now().await;

        // Only dispatch when the thought or its parent is already loaded;
        // otherwise local persistence loads it in the background. Note an
        // out-of-order arrival can skip a legitimate update here.
        let present = self.inner.dispatcher.has_thought(id)
            || thought
                .parent_id
                .as_deref()
                .is_some_and(|parent| self.inner.dispatcher.has_thought(parent));
        if present {
            let mut update = StateUpdate::replicated();
            update
                .thought_index_updates
                .insert(id.to_string(), Some(thought));
            self.inner.dispatcher.dispatch(update);
        } else {
            debug!(id, "thought not loaded in state; skipping dispatch");
        }
        Ok(())
    }

    async fn apply_lexeme_update(
        &self,
        key: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let mut registry = self.inner.lexemes.lock().await;
        self.ensure_entity(&mut registry, EntityKind::Lexeme, key).await;
        let Some(entry) = registry.get_mut(key) else {
            return Ok(());
        };
        if entry.name != name {
            return Err(EngineError::ObserverInvariant {
                id: key.to_string(),
                registered: entry.name.clone(),
                event: name.to_string(),
            });
        }
        if let Err(e) = entry.doc.import(data) {
            warn!(doc = %name, error = %e, "lexeme import failed");
            self.inner.dispatcher.alert("Error loading lexeme");
            return Ok(());
        }
        let snapshot = entry.doc.export(ExportMode::Snapshot).unwrap();
        let projected = codec::read_lexeme(&entry.doc);
        drop(registry);

        self.spawn_flush(EntityKind::Lexeme, name.to_string(), snapshot, false);

        let Some(lexeme) = projected else {
            return Ok(());
        };

        tokio::task::yield_now().await;

        let present = self.inner.dispatcher.has_lexeme(key)
            || lexeme
                .contexts
                .iter()
                .any(|context| self.inner.dispatcher.has_thought(context));
        if present {
            let mut update = StateUpdate::replicated();
            update
                .lexeme_index_updates
                .insert(key.to_string(), Some(lexeme));
            self.inner.dispatcher.dispatch(update);
        } else {
            debug!(key, "lexeme not loaded in state; skipping dispatch");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_pushing(&self) -> bool {
        self.inner.update_set.lock().unwrap().is_pushing()
    }

    pub async fn has_thought_doc(&self, id: &str) -> bool {
        self.inner.thoughts.lock().await.contains(id)
    }

    pub async fn has_lexeme_doc(&self, key: &str) -> bool {
        self.inner.lexemes.lock().await.contains(key)
    }

    pub async fn thought_doc_count(&self) -> usize {
        self.inner.thoughts.lock().await.len()
    }

    pub async fn lexeme_doc_count(&self) -> usize {
        self.inner.lexemes.lock().await.len()
    }

    /// Current `(thought_log, lexeme_log)` contents.
    pub async fn doclog_entries(&self) -> (Vec<LogEntry>, Vec<LogEntry>) {
        let state = self.inner.doclog.lock().await;
        (state.log.thought_entries(), state.log.lexeme_entries())
    }

    /// Quiescence barrier: resolves when the replication queue has drained
    /// and every background persistence flush has landed.
    pub async fn settle(&self) {
        loop {
            self.inner.queue.wait_idle().await;
            let handles: Vec<_> = std::mem::take(&mut *self.inner.flushes.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn doc_name(&self, kind: EntityKind, id: &str) -> String {
        match kind {
            EntityKind::Thought => docname::thought_doc_name(&self.inner.config.workspace, id),
            EntityKind::Lexeme => docname::lexeme_doc_name(&self.inner.config.workspace, id),
            EntityKind::DocLog => docname::doclog_doc_name(&self.inner.config.workspace),
        }
    }

    fn registry_of(&self, kind: EntityKind) -> &Mutex<DocRegistry> {
        match kind {
            EntityKind::Thought => &self.inner.thoughts,
            EntityKind::Lexeme => &self.inner.lexemes,
            EntityKind::DocLog => unreachable!("the doclog has no entity registry"),
        }
    }

    /// Create the document on first need: empty doc bound to its name,
    /// synced once from local persistence, attached to the transport.
    async fn ensure_entity(&self, registry: &mut DocRegistry, kind: EntityKind, id: &str) {
        if registry.contains(id) {
            return;
        }
        let name = self.doc_name(kind, id);
        let entry = registry.ensure(id, &name);

        match self.inner.store.load(&name).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = entry.doc.import(&snapshot) {
                    warn!(doc = %name, error = %e, "persisted snapshot import failed");
                    self.alert_io("loading", kind);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(doc = %name, error = %e, "local persistence load failed");
                self.alert_io("loading", kind);
            }
        }
        entry.synced = true;

        if let Err(e) = self
            .inner
            .transport
            .attach(&name, &self.inner.config.access_token)
            .await
        {
            warn!(doc = %name, error = %e, "transport attach failed");
        }
    }

    /// Write-through in the background. `dequeue` removes the document from
    /// the update set once the flush lands (or fails), so `is_pushing`
    /// cannot stick.
    fn spawn_flush(&self, kind: EntityKind, name: String, snapshot: Vec<u8>, dequeue: bool) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.inner.store.save(&name, &snapshot).await {
                warn!(doc = %name, error = %e, "persistence flush failed");
                engine.alert_io("saving", kind);
            }
            if dequeue {
                engine.push_dequeue(&name);
            }
        });
        self.inner.flushes.lock().unwrap().push(handle);
    }

    fn push_enqueue(&self, key: &str) {
        let edge = self.inner.update_set.lock().unwrap().enqueue(key);
        if edge == Some(PushingEdge::Started) {
            self.inner.pusher.update(PushProgress {
                is_pushing: Some(true),
                replication_progress: None,
            });
        }
    }

    fn push_dequeue(&self, key: &str) {
        let edge = self.inner.update_set.lock().unwrap().dequeue(key);
        if edge == Some(PushingEdge::Stopped) {
            self.inner.pusher.update(PushProgress {
                is_pushing: Some(false),
                replication_progress: None,
            });
        }
    }

    fn alert_io(&self, verb: &str, kind: EntityKind) {
        let noun = match kind {
            EntityKind::Thought => "thought",
            EntityKind::Lexeme => "lexeme",
            EntityKind::DocLog => "doclog",
        };
        self.inner.dispatcher.alert(&format!("Error {verb} {noun}"));
    }

    fn resolve_root(&self, thought: Thought) {
        self.inner.root_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(thought);
                true
            } else {
                false
            }
        });
    }
}
