//! A live document session: one CRDT document bound to local persistence
//! and a remote sync loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use refly_common::{Emitter, Subscriber, TokenRefresher};
use smol_str::SmolStr;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::document::{CollaborativeDocument, Subscription};
use crate::local::{LocalStore, run_local_binding};
use crate::metadata::DocumentMetadataSink;
use crate::provider::{Provider, ProviderCommand};
use crate::reconnect::ReconnectPolicy;
use crate::status::{ConnectionStatus, SessionEvent, SyncTimestamps};
use crate::transport::Connector;
use crate::CollabError;

/// Shared text key holding the document title.
pub const TITLE_KEY: &str = "title";

/// State shared between a session handle and its background tasks.
pub(crate) struct SessionState {
    doc_id: SmolStr,
    status: watch::Sender<ConnectionStatus>,
    loading: watch::Sender<bool>,
    timestamps: watch::Sender<SyncTimestamps>,
    pub(crate) retry_count: AtomicU32,
    pub(crate) gave_up: AtomicBool,
    pub(crate) auth_failed: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) events: Emitter<SessionEvent>,
    sink: Option<Arc<dyn DocumentMetadataSink>>,
}

impl SessionState {
    fn new(doc_id: SmolStr, sink: Option<Arc<dyn DocumentMetadataSink>>) -> Self {
        Self {
            doc_id,
            status: watch::Sender::new(ConnectionStatus::Disconnected),
            loading: watch::Sender::new(true),
            timestamps: watch::Sender::new(SyncTimestamps::default()),
            retry_count: AtomicU32::new(0),
            gave_up: AtomicBool::new(false),
            auth_failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: Emitter::default(),
            sink,
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(doc_id = %self.doc_id, %status, "connection status");
            self.events.emit(SessionEvent::Status(status));
        }
    }

    pub(crate) fn mark_local_synced(&self) {
        let at = Utc::now();
        self.timestamps.send_modify(|t| t.local_synced_at = Some(at));
        self.loading.send_replace(false);
        self.events.emit(SessionEvent::LocalSynced { at });
        if let Some(sink) = &self.sink {
            sink.local_synced(&self.doc_id, at);
        }
    }

    pub(crate) fn mark_remote_synced(&self) {
        let at = Utc::now();
        self.timestamps.send_modify(|t| t.remote_synced_at = Some(at));
        self.loading.send_replace(false);
        self.events.emit(SessionEvent::RemoteSynced { at });
        if let Some(sink) = &self.sink {
            sink.remote_synced(&self.doc_id, at);
        }
    }
}

/// Everything a session needs from its registry.
pub(crate) struct SessionConfig {
    pub url: Url,
    pub token: Option<String>,
    pub policy: ReconnectPolicy,
    pub flush_timeout: Duration,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn LocalStore>,
    pub refresher: Option<Arc<dyn TokenRefresher>>,
    pub sink: Option<Arc<dyn DocumentMetadataSink>>,
}

/// Handle to an open document session.
///
/// Obtained from [`SessionRegistry::acquire`](crate::SessionRegistry::acquire);
/// every consumer of the same document id shares one session.
pub struct DocumentSession {
    doc_id: SmolStr,
    document: Arc<dyn CollaborativeDocument>,
    state: Arc<SessionState>,
    commands: mpsc::UnboundedSender<ProviderCommand>,
    cancel: CancellationToken,
    flush_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    pub(crate) consumers: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DocumentSession {
    /// Wire up the document and spawn the persistence, sync and title tasks.
    pub(crate) fn open(
        doc_id: SmolStr,
        document: Arc<dyn CollaborativeDocument>,
        config: SessionConfig,
    ) -> Result<Arc<Self>, CollabError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CollabError::NoRuntime)?;

        let state = Arc::new(SessionState::new(doc_id.clone(), config.sink.clone()));
        let cancel = CancellationToken::new();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let changed = Arc::new(Notify::new());
        let title_changed = Arc::new(Notify::new());

        // Callbacks only signal; the tasks below read the document.
        let mut subscriptions = Vec::with_capacity(3);
        let updates_tx = local_tx.clone();
        subscriptions.push(document.subscribe_local_updates(Box::new(move |update| {
            let _ = updates_tx.send(update.to_vec());
        })));
        let notify = changed.clone();
        subscriptions.push(document.observe_all(Box::new(move || notify.notify_one())));
        let notify = title_changed.clone();
        subscriptions.push(document.observe(TITLE_KEY, Box::new(move || notify.notify_one())));

        let mut tasks = Vec::with_capacity(3);
        tasks.push(runtime.spawn(run_local_binding(
            doc_id.to_string(),
            document.clone(),
            config.store,
            state.clone(),
            changed,
            local_tx,
            cancel.clone(),
        )));
        let provider = Provider {
            doc_id: doc_id.clone(),
            url: config.url,
            token: config.token,
            connector: config.connector,
            policy: config.policy,
            refresher: config.refresher,
            document: document.clone(),
            state: state.clone(),
            local_updates: local_rx,
            commands: commands_rx,
            cancel: cancel.clone(),
        };
        tasks.push(runtime.spawn(provider.run()));
        tasks.push(runtime.spawn(watch_title(
            document.clone(),
            state.clone(),
            config.sink,
            title_changed,
            cancel.clone(),
        )));

        Ok(Arc::new(Self {
            doc_id,
            document,
            state,
            commands: commands_tx,
            cancel,
            flush_timeout: config.flush_timeout,
            tasks: Mutex::new(tasks),
            subscriptions: Mutex::new(subscriptions),
            consumers: AtomicUsize::new(0),
        }))
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The shared CRDT document. Edits made here are persisted and synced.
    pub fn document(&self) -> &Arc<dyn CollaborativeDocument> {
        &self.document
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Wait until the connection reaches `status`.
    pub async fn wait_for_status(&self, status: ConnectionStatus) {
        let mut rx = self.state.status.subscribe();
        let _ = rx.wait_for(|current| *current == status).await;
    }

    /// True until either local or remote state has been loaded.
    pub fn is_loading(&self) -> bool {
        *self.state.loading.borrow()
    }

    /// Wait until the first of local or remote sync completes.
    pub async fn wait_loaded(&self) {
        let mut rx = self.state.loading.subscribe();
        let _ = rx.wait_for(|loading| !*loading).await;
    }

    /// Wait until the first reconciliation with the sync server.
    pub async fn wait_remote_synced(&self) {
        let mut rx = self.state.timestamps.subscribe();
        let _ = rx.wait_for(|t| t.remote_synced_at.is_some()).await;
    }

    pub fn sync_timestamps(&self) -> SyncTimestamps {
        *self.state.timestamps.borrow()
    }

    /// Retries used in the current disconnection episode.
    pub fn retry_count(&self) -> u32 {
        self.state.retry_count.load(Ordering::SeqCst)
    }

    /// Whether the server copy is older than `max_age`, or was never synced.
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        self.sync_timestamps().is_stale(Utc::now(), max_age)
    }

    pub fn subscribe(&self) -> Subscriber<SessionEvent> {
        self.state.events.subscribe()
    }

    pub fn title(&self) -> String {
        self.document.shared_text(TITLE_KEY)
    }

    pub fn set_title(&self, title: &str) -> Result<(), CollabError> {
        self.document.set_shared_text(TITLE_KEY, title)
    }

    /// Reconnect attempts ran out.
    pub fn gave_up(&self) -> bool {
        self.state.gave_up.load(Ordering::SeqCst)
    }

    /// The sync server rejected this session's token.
    pub fn auth_failed(&self) -> bool {
        self.state.auth_failed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Whether the sync loop is still working for this session, so new
    /// consumers can share it.
    pub fn is_live(&self) -> bool {
        !self.is_closed() && !self.gave_up() && !self.auth_failed()
    }

    /// Number of leases currently holding this session.
    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    /// Flush pending updates if connected, then stop every task.
    pub(crate) async fn shutdown(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.status().is_connected() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.commands.send(ProviderCommand::Flush(reply_tx)).is_ok() {
                match tokio::time::timeout(self.flush_timeout, reply_rx).await {
                    Ok(Ok(true)) => debug!(doc_id = %self.doc_id, "flushed pending updates"),
                    Ok(_) => debug!(doc_id = %self.doc_id, "nothing flushed before teardown"),
                    Err(_) => warn!(doc_id = %self.doc_id, "flush timed out during teardown"),
                }
            }
        }

        self.cancel.cancel();
        lock(&self.subscriptions).clear();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(doc_id = %self.doc_id, error = %e, "session task failed");
            }
        }
        self.state.set_status(ConnectionStatus::Disconnected);
        debug!(doc_id = %self.doc_id, "session closed");
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("doc_id", &self.doc_id)
            .field("status", &self.status())
            .field("consumers", &self.consumer_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reports title changes to the metadata sink while connected.
async fn watch_title(
    document: Arc<dyn CollaborativeDocument>,
    state: Arc<SessionState>,
    sink: Option<Arc<dyn DocumentMetadataSink>>,
    changed: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut last = document.shared_text(TITLE_KEY);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = changed.notified() => {}
        }
        if !state.status().is_connected() {
            continue;
        }
        let title = document.shared_text(TITLE_KEY);
        if title == last {
            continue;
        }
        last = title.clone();
        if let Some(sink) = &sink {
            sink.title_changed(&state.doc_id, &title);
        }
        state.events.emit(SessionEvent::TitleChanged(title));
    }
}
