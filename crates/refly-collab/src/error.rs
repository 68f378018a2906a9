//! Error types for collaborative document sessions.

use miette::Diagnostic;
use thiserror::Error;

use crate::local::LocalStoreError;
use crate::transport::TransportError;

/// Errors that can occur while opening or driving a document session.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CollabError {
    /// Document ids must be non-empty and safe to use as a storage key.
    #[error("invalid document id {0:?}")]
    #[diagnostic(code(refly::collab::doc_id))]
    InvalidDocId(String),

    /// Failed to import CRDT data.
    #[error("failed to import CRDT data: {0}")]
    Import(String),

    /// Failed to export CRDT data.
    #[error("failed to export CRDT data: {0}")]
    Export(String),

    /// Sessions spawn background tasks and need a tokio runtime.
    #[error("no tokio runtime available to drive the session")]
    NoRuntime,

    #[error(transparent)]
    #[diagnostic_source]
    LocalStore(#[from] LocalStoreError),

    #[error(transparent)]
    #[diagnostic_source]
    Transport(#[from] TransportError),
}

impl From<loro::LoroError> for CollabError {
    fn from(e: loro::LoroError) -> Self {
        CollabError::Import(e.to_string())
    }
}

/// Shared rule for ids used as cache keys and file names.
pub(crate) fn validate_doc_id(doc_id: &str) -> Result<(), CollabError> {
    let bad = doc_id.is_empty()
        || doc_id.contains(['/', '\\'])
        || doc_id == "."
        || doc_id.contains("..")
        || doc_id.chars().any(char::is_control);
    if bad {
        Err(CollabError::InvalidDocId(doc_id.to_owned()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_doc_id() {
        assert!(validate_doc_id("d-abc123").is_ok());
        assert!(validate_doc_id("").is_err());
        assert!(validate_doc_id("../etc/passwd").is_err());
        assert!(validate_doc_id("a/b").is_err());
        assert!(validate_doc_id("a\\b").is_err());
        assert!(validate_doc_id("tab\there").is_err());
    }
}
