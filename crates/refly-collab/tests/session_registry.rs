mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{EXPIRED_TOKEN, FakeServer, RecordingSink, eventually, fast_config, within};
use refly_collab::{
    CollaborativeDocument, ConnectionStatus, FileStore, LocalStore, LoroDocument, MemoryStore,
    SessionEvent, SessionRegistry, TITLE_KEY,
};

fn registry(server: &FakeServer, store: Arc<dyn LocalStore>, max_attempts: u32) -> SessionRegistry {
    SessionRegistry::new(fast_config(max_attempts), server.connector(), store)
}

#[tokio::test]
async fn test_concurrent_acquire_shares_one_session() {
    let server = FakeServer::new();
    let registry = registry(&server, Arc::new(MemoryStore::new()), 3);

    let a = registry.acquire("d-1", Some("tok".into())).unwrap();
    let b = registry.acquire("d-1", Some("tok".into())).unwrap();

    assert!(Arc::ptr_eq(a.session(), b.session()));
    assert!(Arc::ptr_eq(a.document(), b.document()));
    assert_eq!(a.consumer_count(), 2);
    assert_eq!(registry.len(), 1);

    within("connected", a.wait_for_status(ConnectionStatus::Connected)).await;
    assert_eq!(server.connect_count(), 1);

    a.release().await;
    b.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_acquire_from_tasks_shares_one_session() {
    let server = FakeServer::new();
    let registry = Arc::new(registry(&server, Arc::new(MemoryStore::new()), 3));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("d-1", None).unwrap() })
        })
        .collect();
    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap());
    }

    let first = leases[0].session().clone();
    assert!(leases.iter().all(|lease| Arc::ptr_eq(lease.session(), &first)));
    assert_eq!(first.consumer_count(), 16);
    assert_eq!(registry.len(), 1);

    for lease in &leases {
        lease.release().await;
    }
    assert!(registry.is_empty());
    assert!(first.is_closed());
}

#[tokio::test]
async fn test_edits_reach_server_and_other_sessions() {
    let server = FakeServer::new();
    let first = registry(&server, Arc::new(MemoryStore::new()), 3);
    let second = registry(&server, Arc::new(MemoryStore::new()), 3);

    let a = first.acquire("d-1", Some("tok".into())).unwrap();
    let b = second.acquire("d-1", Some("tok".into())).unwrap();
    within("a synced", a.wait_remote_synced()).await;
    within("b synced", b.wait_remote_synced()).await;

    a.set_title("Shared plan").unwrap();
    eventually("server title", || server.title() == "Shared plan").await;
    eventually("peer title", || b.title() == "Shared plan").await;

    assert_eq!(server.tokens_seen(), vec![Some("tok".to_string()); 2]);
    a.release().await;
    b.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_counter_resets_after_reconnect() {
    let server = FakeServer::new();
    server.fail_next_connects(2);
    let mut config = fast_config(3);
    config.reconnect_delay = Duration::from_secs(3);
    let registry = SessionRegistry::new(config, server.connector(), Arc::new(MemoryStore::new()));

    let lease = registry.acquire("d-1", None).unwrap();
    within("connected", lease.wait_for_status(ConnectionStatus::Connected)).await;
    assert_eq!(lease.retry_count(), 0);
    assert_eq!(server.connect_count(), 3);

    // A second episode gets the full retry budget again.
    server.fail_next_connects(2);
    server.drop_all();
    eventually("disconnect noticed", || server.connect_count() > 3).await;
    within("reconnected", lease.wait_for_status(ConnectionStatus::Connected)).await;
    assert_eq!(lease.retry_count(), 0);
    assert!(!lease.gave_up());
    assert!(lease.is_live());

    lease.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let server = FakeServer::new();
    server.fail_next_connects(usize::MAX);
    let mut config = fast_config(2);
    config.reconnect_delay = Duration::from_secs(3);
    let registry = SessionRegistry::new(config, server.connector(), Arc::new(MemoryStore::new()));

    let lease = registry.acquire("d-1", None).unwrap();
    let mut events = lease.subscribe();
    let started = tokio::time::Instant::now();
    eventually("gave up", || lease.gave_up()).await;
    assert!(started.elapsed() >= Duration::from_secs(6));
    let mut exhausted = 0;
    while let Some(event) = events.try_recv() {
        if event == SessionEvent::RetriesExhausted {
            exhausted += 1;
        }
    }
    assert_eq!(exhausted, 1);

    assert_eq!(server.connect_count(), 3);
    assert_eq!(lease.status(), ConnectionStatus::Disconnected);
    assert!(!lease.is_live());

    // A dead session is replaced rather than shared.
    server.fail_next_connects(0);
    let fresh = registry.acquire("d-1", None).unwrap();
    assert!(!Arc::ptr_eq(lease.session(), fresh.session()));
    within("fresh connected", fresh.wait_for_status(ConnectionStatus::Connected)).await;

    lease.release().await;
    assert_eq!(registry.len(), 1);
    fresh.release().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_auth_failure_requests_refresh_and_stops() {
    let server = FakeServer::new();
    let refreshed = Arc::new(Mutex::new(Vec::new()));
    let seen = refreshed.clone();
    let registry = registry(&server, Arc::new(MemoryStore::new()), 3).with_refresher(Arc::new(
        move |doc_id: &str| seen.lock().unwrap().push(doc_id.to_owned()),
    ));

    let lease = registry.acquire("d-1", Some(EXPIRED_TOKEN.into())).unwrap();
    let mut events = lease.subscribe();
    eventually("auth failure", || lease.auth_failed()).await;

    assert_eq!(*refreshed.lock().unwrap(), vec!["d-1".to_string()]);
    assert_eq!(lease.status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connect_count(), 1);

    let mut saw_auth_event = false;
    while let Some(event) = events.try_recv() {
        saw_auth_event |= event == SessionEvent::AuthenticationFailed;
    }
    assert!(saw_auth_event);

    let renewed = registry.acquire("d-1", Some("fresh".into())).unwrap();
    assert!(!Arc::ptr_eq(lease.session(), renewed.session()));
    within("renewed", renewed.wait_for_status(ConnectionStatus::Connected)).await;

    lease.release().await;
    renewed.release().await;
}

#[tokio::test]
async fn test_local_state_loads_without_server() {
    let server = FakeServer::new();
    server.fail_next_connects(usize::MAX);

    let store = MemoryStore::new();
    let offline = LoroDocument::new();
    offline.set_shared_text(TITLE_KEY, "Offline draft").unwrap();
    store
        .save("d-1", offline.export_snapshot().unwrap())
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let registry =
        registry(&server, Arc::new(store), 0).with_metadata_sink(sink.clone());
    let lease = registry.acquire("d-1", None).unwrap();

    within("loaded", lease.wait_loaded()).await;
    assert!(!lease.is_loading());
    assert_eq!(lease.title(), "Offline draft");

    let stamps = lease.sync_timestamps();
    assert!(stamps.local_synced_at.is_some());
    assert!(stamps.remote_synced_at.is_none());
    assert!(lease.is_stale(chrono::Duration::minutes(5)));
    assert_eq!(sink.local_synced.lock().unwrap().len(), 1);
    assert!(sink.remote_synced.lock().unwrap().is_empty());

    lease.release().await;
}

#[tokio::test]
async fn test_loading_stays_false_after_local_then_remote_sync() {
    let server = FakeServer::new();
    server.fail_next_connects(1);

    let store = MemoryStore::new();
    let offline = LoroDocument::new();
    offline.set_shared_text(TITLE_KEY, "Cached").unwrap();
    store
        .save("d-1", offline.export_snapshot().unwrap())
        .await
        .unwrap();

    let registry = registry(&server, Arc::new(store), 3);
    let lease = registry.acquire("d-1", Some("tok".into())).unwrap();

    within("loaded", lease.wait_loaded()).await;
    assert!(!lease.is_loading());
    assert!(lease.sync_timestamps().remote_synced_at.is_none());

    within("remote synced", lease.wait_remote_synced()).await;
    assert!(!lease.is_loading());

    let stamps = lease.sync_timestamps();
    let (Some(local), Some(remote)) = (stamps.local_synced_at, stamps.remote_synced_at) else {
        panic!("both layers should have synced: {stamps:?}");
    };
    assert!(local <= remote);
    assert!(!lease.is_stale(chrono::Duration::minutes(5)));
    eventually("server has local draft", || server.title() == "Cached").await;

    lease.release().await;
}

#[tokio::test]
async fn test_release_flushes_and_persists() {
    let server = FakeServer::new();
    let store = MemoryStore::new();
    let registry = registry(&server, Arc::new(store.clone()), 3);

    let lease = registry.acquire("d-1", None).unwrap();
    within("synced", lease.wait_remote_synced()).await;
    lease.set_title("Last words").unwrap();
    lease.release().await;

    assert!(lease.is_closed());
    assert_eq!(lease.status(), ConnectionStatus::Disconnected);
    let saved = LoroDocument::from_snapshot(&store.get("d-1").unwrap()).unwrap();
    assert_eq!(saved.shared_text(TITLE_KEY), "Last words");
    eventually("server title", || server.title() == "Last words").await;
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let server = FakeServer::new();
    let registry = registry(&server, Arc::new(MemoryStore::new()), 3);

    let a = registry.acquire("d-1", None).unwrap();
    let b = registry.acquire("d-1", None).unwrap();

    a.release().await;
    a.release().await;
    assert!(a.is_released());
    assert_eq!(b.consumer_count(), 1);
    assert!(!b.is_closed());
    assert_eq!(registry.len(), 1);

    b.release().await;
    assert!(b.is_closed());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_dropping_lease_releases_in_background() {
    let server = FakeServer::new();
    let registry = registry(&server, Arc::new(MemoryStore::new()), 3);

    let lease = registry.acquire("d-1", None).unwrap();
    let session = lease.session().clone();
    drop(lease);

    assert!(registry.is_empty());
    eventually("closed", || session.is_closed()).await;
}

#[tokio::test]
async fn test_title_sink_only_fires_while_connected() {
    let server = FakeServer::new();
    server.fail_next_connects(1);
    let sink = Arc::new(RecordingSink::default());
    let mut config = fast_config(3);
    config.reconnect_delay = Duration::from_millis(300);
    let registry = SessionRegistry::new(config, server.connector(), Arc::new(MemoryStore::new()))
        .with_metadata_sink(sink.clone());

    let lease = registry.acquire("d-1", None).unwrap();
    eventually("first attempt failed", || server.connect_count() == 1).await;
    lease.set_title("Offline title").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sink.titles().is_empty());

    within("synced", lease.wait_remote_synced()).await;
    lease.set_title("Online title").unwrap();
    eventually("local title reported", || {
        sink.titles().contains(&("d-1".to_string(), "Online title".to_string()))
    })
    .await;

    server.set_title("Renamed elsewhere");
    eventually("remote title reported", || {
        sink.titles()
            .contains(&("d-1".to_string(), "Renamed elsewhere".to_string()))
    })
    .await;
    assert!(
        !sink
            .titles()
            .iter()
            .any(|(_, title)| title == "Offline title")
    );

    lease.release().await;
}

#[tokio::test]
async fn test_offline_edits_reach_server_after_reconnect() {
    let server = FakeServer::new();
    server.fail_next_connects(1);
    let mut config = fast_config(3);
    config.reconnect_delay = Duration::from_millis(200);
    let registry = SessionRegistry::new(config, server.connector(), Arc::new(MemoryStore::new()));

    let lease = registry.acquire("d-1", None).unwrap();
    lease.set_title("Written offline").unwrap();

    within("synced", lease.wait_remote_synced()).await;
    eventually("server title", || server.title() == "Written offline").await;
    lease.release().await;
}

#[tokio::test]
async fn test_file_store_persists_across_registries() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();

    let first = registry(&server, Arc::new(FileStore::new(dir.path())), 3);
    let lease = first.acquire("d-1", None).unwrap();
    within("loaded", lease.wait_loaded()).await;
    lease.set_title("Kept on disk").unwrap();
    lease.release().await;
    assert!(dir.path().join("d-1.loro").exists());

    let unreachable = FakeServer::new();
    unreachable.fail_next_connects(usize::MAX);
    let second = registry(&unreachable, Arc::new(FileStore::new(dir.path())), 0);
    let lease = second.acquire("d-1", None).unwrap();
    within("reloaded", lease.wait_loaded()).await;
    assert_eq!(lease.title(), "Kept on disk");
    lease.release().await;
}

#[tokio::test]
async fn test_invalid_doc_id_is_rejected() {
    let server = FakeServer::new();
    let registry = registry(&server, Arc::new(MemoryStore::new()), 3);
    assert!(registry.acquire("../escape", None).is_err());
    assert!(registry.acquire("", None).is_err());
    assert!(registry.is_empty());
}
