//! Hook for keeping a document listing in step with live sessions.

use chrono::{DateTime, Utc};

/// Receives document metadata changes observed by sessions.
///
/// Called from session tasks; implementations must not block.
pub trait DocumentMetadataSink: Send + Sync + 'static {
    /// The shared title changed while the session was connected.
    fn title_changed(&self, doc_id: &str, title: &str);

    /// Persisted local state finished loading.
    fn local_synced(&self, doc_id: &str, at: DateTime<Utc>) {
        let _ = (doc_id, at);
    }

    /// Initial reconciliation with the sync server finished.
    fn remote_synced(&self, doc_id: &str, at: DateTime<Utc>) {
        let _ = (doc_id, at);
    }
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DocumentMetadataSink for TracingSink {
    fn title_changed(&self, doc_id: &str, title: &str) {
        tracing::info!(%doc_id, %title, "document title changed");
    }

    fn local_synced(&self, doc_id: &str, at: DateTime<Utc>) {
        tracing::debug!(%doc_id, %at, "document loaded from local store");
    }

    fn remote_synced(&self, doc_id: &str, at: DateTime<Utc>) {
        tracing::debug!(%doc_id, %at, "document synced with server");
    }
}
