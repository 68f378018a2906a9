//! Connection to the sync server.
//!
//! [`Connector`] is the seam between a session and the network. The
//! websocket implementation runs a writer task fed by a channel and exposes
//! the decoded read half as a stream.

use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use miette::Diagnostic;
use n0_future::boxed::BoxFuture;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum TransportError {
    #[error("failed to connect to {url}: {message}")]
    #[diagnostic(code(refly::collab::connect))]
    Connect { url: String, message: String },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("malformed frame from sync server: {0}")]
    Decode(#[from] postcard::Error),

    #[error("connection closed")]
    Closed,
}

/// Everything needed to open one connection for one document.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Sync server base url.
    pub url: Url,
    /// Document id; the server routes on it.
    pub name: SmolStr,
    /// Bearer token sent in the first frame.
    pub token: Option<String>,
}

impl ConnectParams {
    /// Server url with the document name as a query parameter.
    pub fn endpoint(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("name", &self.name);
        url
    }
}

/// An open, unauthenticated connection.
///
/// Dropping `outgoing` closes the connection.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<ClientMessage>,
    pub incoming: BoxStream<'static, Result<ServerMessage, TransportError>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &!self.outgoing.is_closed())
            .finish_non_exhaustive()
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, params: ConnectParams) -> BoxFuture<Result<Connection, TransportError>>;
}

/// Websocket connector using binary postcard frames.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, params: ConnectParams) -> BoxFuture<Result<Connection, TransportError>> {
        Box::pin(async move {
            let url = params.endpoint();
            debug!(%url, "connecting to sync server");

            let (ws_stream, _response) =
                connect_async(url.as_str())
                    .await
                    .map_err(|e| TransportError::Connect {
                        url: url.to_string(),
                        message: e.to_string(),
                    })?;

            let (write, read) = ws_stream.split();
            let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
            let (pong_tx, pong_rx) = mpsc::unbounded_channel::<bytes::Bytes>();

            tokio::spawn(run_writer(write, outgoing_rx, pong_rx));

            let incoming = read
                .filter_map(move |frame| {
                    let decoded = decode_frame(frame, &pong_tx);
                    async move { decoded }
                })
                .boxed();

            Ok(Connection { outgoing, incoming })
        })
    }
}

fn decode_frame(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
    pong_tx: &mpsc::UnboundedSender<bytes::Bytes>,
) -> Option<Result<ServerMessage, TransportError>> {
    match frame {
        Ok(Message::Binary(data)) => Some(ServerMessage::from_bytes(&data).map_err(Into::into)),
        Ok(Message::Ping(data)) => {
            let _ = pong_tx.send(data);
            None
        }
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(other) => {
            trace!(?other, "ignoring non-binary frame");
            None
        }
        Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
    }
}

async fn run_writer<S>(
    mut write: S,
    mut outgoing_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut pong_rx: mpsc::UnboundedReceiver<bytes::Bytes>,
) where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;

            Some(data) = pong_rx.recv() => {
                if let Err(e) = write.send(Message::Pong(data)).await {
                    warn!(error = %e, "failed to send pong");
                    return;
                }
            }

            msg = outgoing_rx.recv() => {
                let Some(msg) = msg else {
                    // Session dropped its sender, close politely.
                    let _ = write.send(Message::Close(None)).await;
                    return;
                };
                let bytes = match msg.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                    warn!(error = %e, "failed to send message");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_name() {
        let params = ConnectParams {
            url: Url::parse("ws://localhost:5801/").unwrap(),
            name: "doc 1".into(),
            token: None,
        };
        assert_eq!(params.endpoint().as_str(), "ws://localhost:5801/?name=doc+1");
    }

    #[test]
    fn test_decode_frame_handles_control_frames() {
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();

        let ping = decode_frame(Ok(Message::Ping(bytes::Bytes::from_static(b"hi"))), &pong_tx);
        assert!(ping.is_none());
        assert_eq!(pong_rx.try_recv().unwrap(), bytes::Bytes::from_static(b"hi"));

        let text = decode_frame(Ok(Message::Text("hello".into())), &pong_tx);
        assert!(text.is_none());

        let close = decode_frame(Ok(Message::Close(None)), &pong_tx);
        assert!(matches!(close, Some(Err(TransportError::Closed))));
    }

    #[test]
    fn test_decode_frame_binary() {
        let (pong_tx, _pong_rx) = mpsc::unbounded_channel();
        let bytes = ServerMessage::Authenticated.to_bytes().unwrap();
        let decoded = decode_frame(Ok(Message::Binary(bytes.into())), &pong_tx);
        assert!(matches!(decoded, Some(Ok(ServerMessage::Authenticated))));

        let garbage = decode_frame(Ok(Message::Binary(vec![0xff, 0xff].into())), &pong_tx);
        assert!(matches!(garbage, Some(Err(TransportError::Decode(_)))));
    }
}
