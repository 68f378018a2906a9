//! Remote sync loop for one session.
//!
//! Connects, authenticates, reconciles versions with the server, then
//! streams updates both ways until the connection drops. Disconnects are
//! retried per the [`ReconnectPolicy`]; an auth rejection stops the loop.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::StreamExt;
use refly_common::TokenRefresher;
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::document::CollaborativeDocument;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::reconnect::{ReconnectPolicy, RetryDecision};
use crate::session::SessionState;
use crate::status::{ConnectionStatus, SessionEvent};
use crate::transport::{ConnectParams, Connection, Connector};

pub(crate) enum ProviderCommand {
    /// Send every queued local update; replies whether anything could be sent.
    Flush(oneshot::Sender<bool>),
}

enum ConnectionEnd {
    Closed,
    AuthFailed(String),
    Shutdown,
}

pub(crate) struct Provider {
    pub doc_id: SmolStr,
    pub url: Url,
    pub token: Option<String>,
    pub connector: Arc<dyn Connector>,
    pub policy: ReconnectPolicy,
    pub refresher: Option<Arc<dyn TokenRefresher>>,
    pub document: Arc<dyn CollaborativeDocument>,
    pub state: Arc<SessionState>,
    pub local_updates: mpsc::UnboundedReceiver<Vec<u8>>,
    pub commands: mpsc::UnboundedReceiver<ProviderCommand>,
    pub cancel: CancellationToken,
}

impl Provider {
    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state.set_status(ConnectionStatus::Connecting);

            let params = ConnectParams {
                url: self.url.clone(),
                name: self.doc_id.clone(),
                token: self.token.clone(),
            };
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                connected = self.connector.connect(params) => connected,
            };

            let end = match connected {
                Ok(conn) => self.run_connection(conn).await,
                Err(e) => {
                    warn!(doc_id = %self.doc_id, error = %e, "sync connection failed");
                    ConnectionEnd::Closed
                }
            };

            match end {
                ConnectionEnd::Shutdown => break,
                ConnectionEnd::AuthFailed(reason) => {
                    warn!(doc_id = %self.doc_id, %reason, "sync server rejected token");
                    self.state.auth_failed.store(true, Ordering::SeqCst);
                    self.state.set_status(ConnectionStatus::Disconnected);
                    self.state.events.emit(SessionEvent::AuthenticationFailed);
                    if let Some(refresher) = &self.refresher {
                        refresher.request_refresh(&self.doc_id);
                    }
                    break;
                }
                ConnectionEnd::Closed => {
                    self.state.set_status(ConnectionStatus::Disconnected);
                    match self.policy.on_disconnected() {
                        RetryDecision::Retry(delay) => {
                            self.state
                                .retry_count
                                .store(self.policy.attempts(), Ordering::SeqCst);
                            info!(
                                doc_id = %self.doc_id,
                                attempt = self.policy.attempts(),
                                ?delay,
                                "reconnecting to sync server"
                            );
                            if !self.wait_retry(delay).await {
                                break;
                            }
                        }
                        RetryDecision::GiveUp => {
                            warn!(
                                doc_id = %self.doc_id,
                                attempts = self.policy.attempts(),
                                "giving up on sync server"
                            );
                            self.state.gave_up.store(true, Ordering::SeqCst);
                            self.state.events.emit(SessionEvent::RetriesExhausted);
                            break;
                        }
                    }
                }
            }
        }
        self.state.set_status(ConnectionStatus::Disconnected);
        debug!(doc_id = %self.doc_id, "sync loop stopped");
    }

    /// Sleeps out the retry delay. Returns false if the session shut down.
    async fn wait_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(ProviderCommand::Flush(reply)) => {
                        let _ = reply.send(false);
                    }
                    None => return false,
                },
            }
        }
    }

    async fn run_connection(&mut self, conn: Connection) -> ConnectionEnd {
        let Connection {
            outgoing,
            mut incoming,
        } = conn;

        let auth = ClientMessage::Auth {
            name: self.doc_id.clone(),
            token: self.token.clone(),
        };
        if outgoing.send(auth).is_err() {
            return ConnectionEnd::Closed;
        }

        let mut authenticated = false;
        let mut local_open = true;
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return ConnectionEnd::Shutdown,

                cmd = self.commands.recv() => match cmd {
                    Some(ProviderCommand::Flush(reply)) => {
                        let sent = authenticated && self.drain_pending(&outgoing);
                        let _ = reply.send(sent);
                    }
                    None => return ConnectionEnd::Shutdown,
                },

                update = self.local_updates.recv(), if authenticated && local_open => match update {
                    Some(data) => {
                        if outgoing.send(ClientMessage::Update { data }).is_err() {
                            return ConnectionEnd::Closed;
                        }
                    }
                    None => local_open = false,
                },

                msg = incoming.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            debug!(doc_id = %self.doc_id, error = %e, "sync connection ended");
                            return ConnectionEnd::Closed;
                        }
                        None => return ConnectionEnd::Closed,
                    };
                    match msg {
                        ServerMessage::Authenticated => {
                            authenticated = true;
                            self.policy.on_connected();
                            self.state.retry_count.store(0, Ordering::SeqCst);
                            self.state.set_status(ConnectionStatus::Connected);
                            // Version reconciliation below covers anything queued offline.
                            while self.local_updates.try_recv().is_ok() {}
                            let version = self.document.version();
                            if outgoing.send(ClientMessage::SyncRequest { version }).is_err() {
                                return ConnectionEnd::Closed;
                            }
                        }
                        ServerMessage::AuthenticationFailed { reason } => {
                            return ConnectionEnd::AuthFailed(reason);
                        }
                        ServerMessage::SyncResponse { data, version } => {
                            self.import(&data);
                            match self.document.export_updates_since(&version) {
                                Ok(Some(data)) => {
                                    if outgoing.send(ClientMessage::Update { data }).is_err() {
                                        return ConnectionEnd::Closed;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!(doc_id = %self.doc_id, error = %e, "failed to export missing updates"),
                            }
                            self.state.mark_remote_synced();
                        }
                        ServerMessage::Update { data } => self.import(&data),
                    }
                }
            }
        }
    }

    fn import(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Err(e) = self.document.import(data) {
            warn!(doc_id = %self.doc_id, error = %e, "failed to import remote update");
        }
    }

    fn drain_pending(&mut self, outgoing: &mpsc::UnboundedSender<ClientMessage>) -> bool {
        while let Ok(data) = self.local_updates.try_recv() {
            if outgoing.send(ClientMessage::Update { data }).is_err() {
                return false;
            }
        }
        true
    }
}
