//! In-process sync server for session tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use n0_future::boxed::BoxFuture;
use refly_collab::{
    ClientMessage, CollaborativeDocument, ConnectParams, Connection, Connector,
    DocumentMetadataSink, LoroDocument, RegistryConfig, ServerMessage, TITLE_KEY, TransportError,
};
use tokio::sync::mpsc;
use url::Url;

/// Token the fake server rejects.
pub const EXPIRED_TOKEN: &str = "expired";

type ClientTx = mpsc::UnboundedSender<Result<ServerMessage, TransportError>>;

struct Inner {
    doc: LoroDocument,
    clients: Mutex<HashMap<usize, ClientTx>>,
    next_id: AtomicUsize,
    fail_connects: AtomicUsize,
    connect_count: AtomicUsize,
    updates_received: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
}

/// Holds its own Loro document and relays updates between connections.
#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<Inner>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                doc: LoroDocument::new(),
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicUsize::new(0),
                fail_connects: AtomicUsize::new(0),
                connect_count: AtomicUsize::new(0),
                updates_received: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    pub fn updates_received(&self) -> usize {
        self.inner.updates_received.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.inner.tokens.lock().unwrap().clone()
    }

    /// Close every open connection from the server side.
    pub fn drop_all(&self) {
        self.inner.clients.lock().unwrap().clear();
    }

    pub fn title(&self) -> String {
        self.inner.doc.shared_text(TITLE_KEY)
    }

    /// Edit the server copy and broadcast the change to every client.
    pub fn set_title(&self, title: &str) {
        let before = self.inner.doc.version();
        self.inner.doc.set_shared_text(TITLE_KEY, title).unwrap();
        if let Some(data) = self.inner.doc.export_updates_since(&before).unwrap() {
            self.inner.broadcast(None, data);
        }
    }
}

impl Inner {
    fn send(&self, client: usize, msg: ServerMessage) {
        if let Some(tx) = self.clients.lock().unwrap().get(&client) {
            let _ = tx.send(Ok(msg));
        }
    }

    fn broadcast(&self, from: Option<usize>, data: Vec<u8>) {
        for (id, tx) in self.clients.lock().unwrap().iter() {
            if Some(*id) != from {
                let _ = tx.send(Ok(ServerMessage::Update { data: data.clone() }));
            }
        }
    }

    async fn serve(self: Arc<Self>, id: usize, mut rx: mpsc::UnboundedReceiver<ClientMessage>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ClientMessage::Auth { token, .. } => {
                    self.tokens.lock().unwrap().push(token.clone());
                    if token.as_deref() == Some(EXPIRED_TOKEN) {
                        self.send(
                            id,
                            ServerMessage::AuthenticationFailed {
                                reason: "token expired".into(),
                            },
                        );
                        self.clients.lock().unwrap().remove(&id);
                        return;
                    }
                    self.send(id, ServerMessage::Authenticated);
                }
                ClientMessage::SyncRequest { version } => {
                    let data = self
                        .doc
                        .export_updates_since(&version)
                        .unwrap()
                        .unwrap_or_default();
                    let version = self.doc.version();
                    self.send(id, ServerMessage::SyncResponse { data, version });
                }
                ClientMessage::Update { data } => {
                    self.doc.import(&data).unwrap();
                    self.updates_received.fetch_add(1, Ordering::SeqCst);
                    self.broadcast(Some(id), data);
                }
            }
        }
        self.clients.lock().unwrap().remove(&id);
    }
}

impl Connector for FakeServer {
    fn connect(&self, _params: ConnectParams) -> BoxFuture<Result<Connection, TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.connect_count.fetch_add(1, Ordering::SeqCst);
            let refused = inner
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Connect {
                    url: "fake://".into(),
                    message: "connection refused".into(),
                });
            }

            let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
            let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            inner.clients.lock().unwrap().insert(id, incoming_tx);
            tokio::spawn(inner.serve(id, outgoing_rx));

            let incoming = futures_util::stream::unfold(incoming_rx, |mut rx| async move {
                rx.recv().await.map(|msg| (msg, rx))
            })
            .boxed();
            Ok(Connection { outgoing, incoming })
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub titles: Mutex<Vec<(String, String)>>,
    pub local_synced: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub remote_synced: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl RecordingSink {
    pub fn titles(&self) -> Vec<(String, String)> {
        self.titles.lock().unwrap().clone()
    }
}

impl DocumentMetadataSink for RecordingSink {
    fn title_changed(&self, doc_id: &str, title: &str) {
        self.titles
            .lock()
            .unwrap()
            .push((doc_id.to_owned(), title.to_owned()));
    }

    fn local_synced(&self, doc_id: &str, at: DateTime<Utc>) {
        self.local_synced.lock().unwrap().push((doc_id.to_owned(), at));
    }

    fn remote_synced(&self, doc_id: &str, at: DateTime<Utc>) {
        self.remote_synced.lock().unwrap().push((doc_id.to_owned(), at));
    }
}

pub fn fast_config(max_attempts: u32) -> RegistryConfig {
    let mut config = RegistryConfig::new(Url::parse("ws://sync.test/").unwrap());
    config.reconnect_delay = Duration::from_millis(20);
    config.max_reconnect_attempts = max_attempts;
    config.flush_timeout = Duration::from_secs(1);
    config
}

/// Polls `check` until it holds, failing the test after thirty seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
