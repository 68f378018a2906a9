//! Connection status, sync timestamps and the events a session emits.

use chrono::{DateTime, Utc};

/// Status of the remote sync connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When each persistence layer last finished its initial sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncTimestamps {
    pub local_synced_at: Option<DateTime<Utc>>,
    pub remote_synced_at: Option<DateTime<Utc>>,
}

impl SyncTimestamps {
    /// True when the remote never synced or last synced more than `max_age` before `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.remote_synced_at {
            None => true,
            Some(at) => now.signed_duration_since(at) > max_age,
        }
    }
}

/// Events delivered to session subscribers, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    /// Prior offline state has been loaded into the document.
    LocalSynced { at: DateTime<Utc> },
    /// Initial reconciliation with the sync server finished.
    RemoteSynced { at: DateTime<Utc> },
    /// The sync server rejected the token; a refresh was requested.
    AuthenticationFailed,
    /// Reconnect attempts ran out; the session stays disconnected.
    RetriesExhausted,
    /// The shared title changed while connected.
    TitleChanged(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default_is_disconnected() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
        assert!(!ConnectionStatus::Connecting.is_connected());
        assert!(ConnectionStatus::Connected.is_connected());
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let max_age = chrono::Duration::minutes(5);
        assert!(SyncTimestamps::default().is_stale(now, max_age));

        let fresh = SyncTimestamps {
            local_synced_at: None,
            remote_synced_at: Some(now - chrono::Duration::minutes(1)),
        };
        assert!(!fresh.is_stale(now, max_age));

        let old = SyncTimestamps {
            local_synced_at: Some(now),
            remote_synced_at: Some(now - chrono::Duration::minutes(10)),
        };
        assert!(old.is_stale(now, max_age));
    }
}
