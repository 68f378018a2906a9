//! Wire protocol between a document session and the sync server.
//!
//! Every frame is one postcard-encoded message sent as a binary websocket
//! frame. CRDT payloads and versions are opaque bytes produced by the
//! [`CollaborativeDocument`](crate::CollaborativeDocument).

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Messages a client sends to the sync server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First frame on every connection.
    Auth {
        /// Document id.
        name: SmolStr,
        /// Bearer token, if the session has one.
        token: Option<String>,
    },

    /// Ask for everything newer than `version`.
    SyncRequest {
        /// Encoded version of what the client already has.
        version: Vec<u8>,
    },

    /// Incremental CRDT update from a local edit.
    Update {
        /// Encoded update bytes.
        data: Vec<u8>,
    },
}

/// Messages the sync server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Token accepted; the client may sync.
    Authenticated,

    /// Token rejected. The server closes the connection after this.
    AuthenticationFailed { reason: String },

    /// Reply to [`ClientMessage::SyncRequest`].
    SyncResponse {
        /// Updates the client is missing. May be empty.
        data: Vec<u8>,
        /// Server's version, so the client can push what the server lacks.
        version: Vec<u8>,
    },

    /// Update from another collaborator.
    Update { data: Vec<u8> },
}

macro_rules! postcard_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize message to postcard bytes for wire transmission.
            pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
                postcard::to_stdvec(self)
            }

            /// Deserialize message from postcard bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
                postcard::from_bytes(bytes)
            }
        }
    };
}

postcard_codec!(ClientMessage);
postcard_codec!(ServerMessage);
