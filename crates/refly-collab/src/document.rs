//! CRDT document abstraction and the Loro-backed implementation.
//!
//! Sessions only talk to [`CollaborativeDocument`]. Versions and updates
//! are opaque bytes so another engine can slot in behind the trait.

use std::borrow::Cow;
use std::sync::Arc;

use loro::{ContainerTrait, ExportMode, LoroDoc, VersionVector};

use crate::CollabError;

/// Invoked after a change lands in the observed container.
pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Invoked with the encoded update for every local commit.
pub type UpdateCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Keeps a document observer registered; dropping it unsubscribes.
pub struct Subscription {
    _guard: Box<dyn Send>,
}

impl Subscription {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

/// Shared CRDT state a session hands out to editors.
///
/// All methods take `&self`; implementations are internally synchronized.
pub trait CollaborativeDocument: Send + Sync + 'static {
    /// Current contents of the shared text stored under `key`.
    fn shared_text(&self, key: &str) -> String;

    /// Replace the shared text under `key` and commit.
    fn set_shared_text(&self, key: &str, value: &str) -> Result<(), CollabError>;

    /// Observe changes (local or remote) to the shared text under `key`.
    fn observe(&self, key: &str, callback: ChangeCallback) -> Subscription;

    /// Observe any change to the document.
    fn observe_all(&self, callback: ChangeCallback) -> Subscription;

    /// Receive the encoded update of every local commit.
    fn subscribe_local_updates(&self, callback: UpdateCallback) -> Subscription;

    /// Export full snapshot bytes.
    fn export_snapshot(&self) -> Result<Vec<u8>, CollabError>;

    /// Export everything newer than `version`. An empty `version` means
    /// "from the beginning". Returns `None` when there is nothing newer.
    fn export_updates_since(&self, version: &[u8]) -> Result<Option<Vec<u8>>, CollabError>;

    /// Merge remote or persisted changes.
    fn import(&self, data: &[u8]) -> Result<(), CollabError>;

    /// Encoded version of everything this document has seen.
    fn version(&self) -> Vec<u8>;
}

/// Loro-backed [`CollaborativeDocument`].
pub struct LoroDocument {
    doc: LoroDoc,
}

impl LoroDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
        }
    }

    /// Create a document from an existing Loro snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CollabError> {
        let doc = LoroDoc::new();
        doc.import(snapshot)?;
        Ok(Self { doc })
    }

    /// Get the underlying Loro document.
    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    /// Shared handle, as the registry's document factory expects.
    pub fn shared() -> Arc<dyn CollaborativeDocument> {
        Arc::new(Self::new())
    }

    fn decode_version(version: &[u8]) -> Result<VersionVector, CollabError> {
        if version.is_empty() {
            return Ok(VersionVector::default());
        }
        VersionVector::decode(version).map_err(|e| CollabError::Import(e.to_string()))
    }
}

impl Default for LoroDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CollaborativeDocument for LoroDocument {
    fn shared_text(&self, key: &str) -> String {
        self.doc.get_text(key).to_string()
    }

    fn set_shared_text(&self, key: &str, value: &str) -> Result<(), CollabError> {
        let text = self.doc.get_text(key);
        if text.to_string() == value {
            return Ok(());
        }
        let len = text.len_unicode();
        if len > 0 {
            text.delete(0, len)?;
        }
        text.insert(0, value)?;
        self.doc.commit();
        Ok(())
    }

    fn observe(&self, key: &str, callback: ChangeCallback) -> Subscription {
        let text = self.doc.get_text(key);
        let sub = self
            .doc
            .subscribe(&text.id(), Arc::new(move |_event| callback()));
        Subscription::new(sub)
    }

    fn observe_all(&self, callback: ChangeCallback) -> Subscription {
        let sub = self.doc.subscribe_root(Arc::new(move |_event| callback()));
        Subscription::new(sub)
    }

    fn subscribe_local_updates(&self, callback: UpdateCallback) -> Subscription {
        let sub = self.doc.subscribe_local_update(Box::new(move |update| {
            callback(&update[..]);
            true
        }));
        Subscription::new(sub)
    }

    fn export_snapshot(&self) -> Result<Vec<u8>, CollabError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| CollabError::Export(e.to_string()))
    }

    fn export_updates_since(&self, version: &[u8]) -> Result<Option<Vec<u8>>, CollabError> {
        let from = Self::decode_version(version)?;
        if from == self.doc.oplog_vv() {
            return Ok(None);
        }

        let updates = self
            .doc
            .export(ExportMode::Updates {
                from: Cow::Owned(from),
            })
            .map_err(|e| CollabError::Export(e.to_string()))?;

        if updates.is_empty() {
            return Ok(None);
        }
        Ok(Some(updates))
    }

    fn import(&self, data: &[u8]) -> Result<(), CollabError> {
        self.doc.import(data)?;
        Ok(())
    }

    fn version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }
}
