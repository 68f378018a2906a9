//! Bearer token plumbing shared by the skill client and document sessions.

use std::sync::{Arc, RwLock};

use miette::Diagnostic;
use n0_future::boxed::BoxFuture;

#[derive(Debug, Clone, thiserror::Error, Diagnostic)]
#[diagnostic(code(refly::auth))]
pub enum AuthError {
    /// The refresh credential itself is no longer valid; the user must log in again.
    #[error("authentication expired, please login again")]
    Expired,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("this token source cannot refresh")]
    NotRefreshable,
}

/// Supplies the bearer token for outgoing requests.
pub trait TokenSource: Send + Sync + 'static {
    /// The token to send right now, if any.
    fn token(&self) -> Option<String>;

    /// Obtain a fresh token. Implementations should make the new token
    /// visible through [`TokenSource::token`] before resolving.
    fn refresh(&self) -> BoxFuture<Result<String, AuthError>>;
}

/// A fixed token that cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }

    fn refresh(&self) -> BoxFuture<Result<String, AuthError>> {
        Box::pin(async { Err(AuthError::NotRefreshable) })
    }
}

type RefreshFn = dyn Fn() -> BoxFuture<Result<String, AuthError>> + Send + Sync;

/// A token slot shared between callers, refreshed through a user-supplied
/// function.
#[derive(Clone)]
pub struct SharedToken {
    current: Arc<RwLock<Option<String>>>,
    refresh: Option<Arc<RefreshFn>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            current: Arc::new(RwLock::new(token)),
            refresh: None,
        }
    }

    pub fn with_refresh<F>(mut self, refresh: F) -> Self
    where
        F: Fn() -> BoxFuture<Result<String, AuthError>> + Send + Sync + 'static,
    {
        self.refresh = Some(Arc::new(refresh));
        self
    }

    pub fn set(&self, token: Option<String>) {
        match self.current.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl std::fmt::Debug for SharedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedToken")
            .field("has_token", &self.token().is_some())
            .field("refreshable", &self.refresh.is_some())
            .finish()
    }
}

impl TokenSource for SharedToken {
    fn token(&self) -> Option<String> {
        match self.current.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn refresh(&self) -> BoxFuture<Result<String, AuthError>> {
        let Some(refresh) = self.refresh.clone() else {
            return Box::pin(async { Err(AuthError::NotRefreshable) });
        };
        let this = self.clone();
        Box::pin(async move {
            let token = refresh().await?;
            this.set(Some(token.clone()));
            Ok(token)
        })
    }
}

/// Fire-and-forget refresh request.
///
/// The document session manager calls this when the sync server rejects a
/// token. It never waits for the outcome; a refreshed token is expected to
/// come back through a fresh `acquire`.
pub trait TokenRefresher: Send + Sync + 'static {
    fn request_refresh(&self, doc_id: &str);
}

impl<F> TokenRefresher for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn request_refresh(&self, doc_id: &str) {
        self(doc_id)
    }
}

/// Adapts a [`TokenSource`] into a [`TokenRefresher`] by spawning its refresh
/// on the current tokio runtime.
pub struct SpawnRefresh<T>(pub Arc<T>);

impl<T: TokenSource> TokenRefresher for SpawnRefresh<T> {
    fn request_refresh(&self, doc_id: &str) {
        let source = self.0.clone();
        let doc_id = doc_id.to_owned();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match source.refresh().await {
                        Ok(_) => tracing::info!(%doc_id, "token refreshed"),
                        Err(e) => tracing::warn!(%doc_id, error = %e, "token refresh failed"),
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%doc_id, "token refresh requested outside a runtime, ignoring")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_static_token_cannot_refresh() {
        let token = StaticToken::new("abc");
        assert_eq!(token.token().as_deref(), Some("abc"));
        assert!(matches!(token.refresh().await, Err(AuthError::NotRefreshable)));
    }

    #[tokio::test]
    async fn test_shared_token_refresh_updates_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = SharedToken::new(Some("old".into())).with_refresh(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(format!("new-{n}")) })
        });

        assert_eq!(token.refresh().await.unwrap(), "new-0");
        assert_eq!(token.token().as_deref(), Some("new-0"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_token_refresh_failure_keeps_old_token() {
        let token = SharedToken::new(Some("old".into()))
            .with_refresh(|| Box::pin(async { Err(AuthError::Expired) }));
        assert!(matches!(token.refresh().await, Err(AuthError::Expired)));
        assert_eq!(token.token().as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_spawn_refresh_runs_source_refresh() {
        let token = Arc::new(
            SharedToken::new(Some("old".into()))
                .with_refresh(|| Box::pin(async { Ok("fresh".to_string()) })),
        );
        SpawnRefresh(token.clone()).request_refresh("d-1");

        for _ in 0..100 {
            if token.token().as_deref() == Some("fresh") {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("refresh never ran");
    }

    #[test]
    fn test_spawn_refresh_outside_runtime_is_ignored() {
        let token = Arc::new(StaticToken::new("t"));
        SpawnRefresh(token.clone()).request_refresh("d-1");
        assert_eq!(token.token().as_deref(), Some("t"));
    }

    #[test]
    fn test_closure_refresher() {
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();
        let refresher = move |doc_id: &str| sink.write().unwrap().push(doc_id.to_owned());
        refresher.request_refresh("d-1");
        assert_eq!(*seen.read().unwrap(), vec!["d-1".to_string()]);
    }
}
