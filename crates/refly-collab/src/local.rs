//! Local persistence of document state.
//!
//! A store keeps one snapshot per document id. The binding task loads it
//! into a session's document on open and saves again after changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use miette::Diagnostic;
use n0_future::boxed::BoxFuture;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::document::CollaborativeDocument;
use crate::session::SessionState;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum LocalStoreError {
    #[error("local store I/O error at {path}: {source}")]
    #[diagnostic(code(refly::collab::local_store))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Keyed snapshot storage.
pub trait LocalStore: Send + Sync + 'static {
    fn load(&self, doc_id: &str) -> BoxFuture<Result<Option<Vec<u8>>, LocalStoreError>>;
    fn save(&self, doc_id: &str, snapshot: Vec<u8>) -> BoxFuture<Result<(), LocalStoreError>>;
}

/// One `<doc_id>.loro` file per document under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, doc_id: &str) -> PathBuf {
        self.dir.join(format!("{doc_id}.loro"))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LocalStoreError + '_ {
    move |source| LocalStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl LocalStore for FileStore {
    fn load(&self, doc_id: &str) -> BoxFuture<Result<Option<Vec<u8>>, LocalStoreError>> {
        let path = self.path_for(doc_id);
        Box::pin(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_err(&path)(e)),
            }
        })
    }

    fn save(&self, doc_id: &str, snapshot: Vec<u8>) -> BoxFuture<Result<(), LocalStoreError>> {
        let dir = self.dir.clone();
        let path = self.path_for(doc_id);
        let tmp = self.dir.join(format!("{doc_id}.loro.tmp"));
        Box::pin(async move {
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
            tokio::fs::write(&tmp, &snapshot).await.map_err(io_err(&tmp))?;
            tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
            Ok(())
        })
    }
}

/// In-process store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, doc_id: &str) -> Option<Vec<u8>> {
        self.docs.get(doc_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, doc_id: &str) -> BoxFuture<Result<Option<Vec<u8>>, LocalStoreError>> {
        let snapshot = self.get(doc_id);
        Box::pin(async move { Ok(snapshot) })
    }

    fn save(&self, doc_id: &str, snapshot: Vec<u8>) -> BoxFuture<Result<(), LocalStoreError>> {
        self.docs.insert(doc_id.to_owned(), snapshot);
        Box::pin(async { Ok(()) })
    }
}

/// Drives local persistence for one session until cancelled.
///
/// Loaded state is imported into the document and also queued as an
/// outgoing update so edits made offline reach the server.
pub(crate) async fn run_local_binding(
    doc_id: String,
    document: Arc<dyn CollaborativeDocument>,
    store: Arc<dyn LocalStore>,
    state: Arc<SessionState>,
    changed: Arc<Notify>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let loaded = tokio::select! {
        _ = cancel.cancelled() => return,
        loaded = store.load(&doc_id) => loaded,
    };

    match loaded {
        Ok(Some(snapshot)) => match document.import(&snapshot) {
            Ok(()) => {
                debug!(%doc_id, bytes = snapshot.len(), "loaded local snapshot");
                let _ = outgoing.send(snapshot);
            }
            Err(e) => warn!(%doc_id, error = %e, "discarding unreadable local snapshot"),
        },
        Ok(None) => debug!(%doc_id, "no local snapshot"),
        Err(e) => warn!(%doc_id, error = %e, "failed to load local snapshot"),
    }
    state.mark_local_synced();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = changed.notified() => save(&doc_id, document.as_ref(), store.as_ref()).await,
        }
    }

    save(&doc_id, document.as_ref(), store.as_ref()).await;
}

async fn save(doc_id: &str, document: &dyn CollaborativeDocument, store: &dyn LocalStore) {
    let snapshot = match document.export_snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(%doc_id, error = %e, "failed to export snapshot");
            return;
        }
    };
    if let Err(e) = store.save(doc_id, snapshot).await {
        warn!(%doc_id, error = %e, "failed to persist snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        store.save("d-1", vec![1, 2, 3]).await.unwrap();
        store.save("d-1", vec![4, 5]).await.unwrap();

        assert_eq!(store.load("d-1").await.unwrap(), Some(vec![4, 5]));
        assert!(store.path_for("d-1").exists());
        assert!(!dir.path().join("nested").join("d-1.loro.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_store_is_shared_between_clones() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.save("d-1", vec![9]).await.unwrap();
        assert_eq!(other.load("d-1").await.unwrap(), Some(vec![9]));
        assert_eq!(other.len(), 1);
    }
}
