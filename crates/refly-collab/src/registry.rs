//! Process-wide cache of document sessions.
//!
//! Consumers of the same document id share one session. Each
//! [`SessionLease`] counts as one consumer; the session is flushed and torn
//! down when the last lease is released.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use refly_common::{Config, TokenRefresher};
use smol_str::SmolStr;
use tracing::{debug, info, warn};
use url::Url;

use crate::document::{CollaborativeDocument, LoroDocument};
use crate::error::validate_doc_id;
use crate::local::LocalStore;
use crate::metadata::DocumentMetadataSink;
use crate::reconnect::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_DELAY, ReconnectPolicy};
use crate::session::{DocumentSession, SessionConfig};
use crate::transport::Connector;
use crate::CollabError;

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds the empty document a new session starts from.
pub type DocumentFactory = Arc<dyn Fn(&str) -> Arc<dyn CollaborativeDocument> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sync server websocket url.
    pub ws_url: Url,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Upper bound on the final flush during teardown.
    pub flush_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(ws_url: Url) -> Self {
        Self {
            ws_url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            ws_url: config.ws_server_origin.clone(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            flush_timeout: config.flush_timeout(),
        }
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_delay, self.max_reconnect_attempts)
    }
}

type Sessions = DashMap<SmolStr, Arc<DocumentSession>>;

pub struct SessionRegistry {
    config: RegistryConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn LocalStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    sink: Option<Arc<dyn DocumentMetadataSink>>,
    factory: DocumentFactory,
    sessions: Arc<Sessions>,
}

impl SessionRegistry {
    pub fn new(
        config: RegistryConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            refresher: None,
            sink: None,
            factory: Arc::new(|_| LoroDocument::shared()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Called when the sync server rejects a session's token.
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_metadata_sink(mut self, sink: Arc<dyn DocumentMetadataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_document_factory(mut self, factory: DocumentFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Join the session for `doc_id`, creating it if there is none or the
    /// cached one has stopped syncing.
    ///
    /// `token` is only used when a new session is created. The entry stays
    /// locked from lookup to insert, so concurrent callers share one session.
    pub fn acquire(
        &self,
        doc_id: &str,
        token: Option<String>,
    ) -> Result<SessionLease, CollabError> {
        validate_doc_id(doc_id)?;

        let session = match self.sessions.entry(SmolStr::new(doc_id)) {
            Entry::Occupied(entry) if entry.get().is_live() => {
                let session = entry.get().clone();
                session.consumers.fetch_add(1, Ordering::SeqCst);
                debug!(%doc_id, consumers = session.consumer_count(), "reusing session");
                session
            }
            Entry::Occupied(mut entry) => {
                info!(%doc_id, "replacing session that stopped syncing");
                let session = self.open_session(entry.key().clone(), token)?;
                entry.insert(session.clone());
                session
            }
            Entry::Vacant(entry) => {
                let session = self.open_session(entry.key().clone(), token)?;
                entry.insert(session.clone());
                session
            }
        };
        Ok(SessionLease::new(session, self.sessions.clone()))
    }

    fn open_session(
        &self,
        doc_id: SmolStr,
        token: Option<String>,
    ) -> Result<Arc<DocumentSession>, CollabError> {
        let document = (self.factory)(&doc_id);
        let session = DocumentSession::open(
            doc_id,
            document,
            SessionConfig {
                url: self.config.ws_url.clone(),
                token,
                policy: self.config.policy(),
                flush_timeout: self.config.flush_timeout,
                connector: self.connector.clone(),
                store: self.store.clone(),
                refresher: self.refresher.clone(),
                sink: self.sink.clone(),
            },
        )?;
        session.consumers.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    /// The cached session for `doc_id`, if any.
    pub fn get(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.get(doc_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tear down every cached session regardless of outstanding leases.
    pub async fn shutdown_all(&self) {
        let doc_ids: Vec<SmolStr> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for doc_id in doc_ids {
            if let Some((_, session)) = self.sessions.remove(&doc_id) {
                session.shutdown().await;
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

/// One consumer's hold on a shared session.
///
/// Release explicitly with [`SessionLease::release`] to wait for teardown;
/// dropping an unreleased lease releases it in the background.
pub struct SessionLease {
    session: Arc<DocumentSession>,
    sessions: Arc<Sessions>,
    released: AtomicBool,
}

impl SessionLease {
    fn new(session: Arc<DocumentSession>, sessions: Arc<Sessions>) -> Self {
        Self {
            session,
            sessions,
            released: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<DocumentSession> {
        &self.session
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give up this consumer's hold. If it was the last one, flush and tear
    /// the session down before returning. Calling it again does nothing.
    pub async fn release(&self) {
        if let Some(session) = self.release_hold() {
            session.shutdown().await;
        }
    }

    /// Decrement under the cache entry's lock. Returns the session when it
    /// has no consumers left and must be torn down.
    fn release_hold(&self) -> Option<Arc<DocumentSession>> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        let doc_id = self.session.doc_id();
        let mut cached = false;
        let mut remaining = 0;
        self.sessions.remove_if(doc_id, |_, current| {
            cached = Arc::ptr_eq(current, &self.session);
            if cached {
                remaining = self.session.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
            }
            cached && remaining == 0
        });
        if !cached {
            // Replaced or shut down already; nobody can join it any more.
            remaining = self.session.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        }
        debug!(%doc_id, remaining, "released session");
        (remaining == 0).then(|| self.session.clone())
    }
}

impl Deref for SessionLease {
    type Target = DocumentSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(session) = self.release_hold() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.shutdown().await });
            }
            Err(_) => warn!(
                doc_id = %session.doc_id(),
                "lease dropped outside a runtime, session stops without a final flush"
            ),
        }
    }
}
