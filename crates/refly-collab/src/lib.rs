//! Collaborative document sessions.
//!
//! A [`SessionRegistry`] hands out shared [`DocumentSession`]s keyed by
//! document id. Each session binds a CRDT document to a [`LocalStore`] for
//! offline persistence and to a sync server reached through a
//! [`Connector`], reconnecting with a bounded [`ReconnectPolicy`].

pub mod document;
pub mod error;
pub mod local;
pub mod metadata;
pub mod protocol;
mod provider;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod status;
pub mod transport;

pub use document::{CollaborativeDocument, LoroDocument, Subscription};
pub use error::CollabError;
pub use local::{FileStore, LocalStore, LocalStoreError, MemoryStore};
pub use metadata::{DocumentMetadataSink, TracingSink};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconnect::{ReconnectPolicy, RetryDecision};
pub use registry::{DocumentFactory, RegistryConfig, SessionLease, SessionRegistry};
pub use session::{DocumentSession, TITLE_KEY};
pub use status::{ConnectionStatus, SessionEvent, SyncTimestamps};
pub use transport::{ConnectParams, Connection, Connector, TransportError, WsConnector};
