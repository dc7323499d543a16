use std::collections::BTreeMap;
use std::sync::Arc;

use firestore_sync::firestore::core::view_snapshot::ViewSnapshot;
use firestore_sync::firestore::error::FirestoreResult;
use firestore_sync::firestore::local::{LruParams, MemoryKvStore, TargetPurpose};
use firestore_sync::firestore::model::{
    Document, DocumentKey, DocumentState, Mutation, MutationResult, ResourcePath, SnapshotVersion,
};
use firestore_sync::firestore::remote::{
    DocumentChange, DocumentRemove, InMemoryConnection, ListenRequest, TargetChangeState, WatchChange,
    WatchTargetChange, WriteResponse,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{ClientContext, ClientSettings, FirestoreClient, ListenOptions, Query};
use futures::channel::mpsc;
use futures::StreamExt;

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms() -> Query {
    Query::at_path(ResourcePath::from_string("rooms").unwrap())
}

fn data(value: i64) -> MapValue {
    MapValue::new(BTreeMap::from([(
        "value".to_string(),
        FirestoreValue::from_integer(value),
    )]))
}

async fn start_client(connection: Arc<InMemoryConnection>, settings: ClientSettings) -> FirestoreClient {
    FirestoreClient::start(
        settings,
        ClientContext::new(Arc::new(MemoryKvStore::new()), connection),
    )
    .await
    .unwrap()
}

type Snapshots = mpsc::UnboundedReceiver<FirestoreResult<ViewSnapshot>>;

fn listen_to_rooms(client: &FirestoreClient) -> (firestore_sync::firestore::core::ListenerRegistration, Snapshots) {
    let (sender, snapshots) = mpsc::unbounded();
    let registration = client
        .listen(rooms(), ListenOptions::default(), move |snapshot| {
            let _ = sender.unbounded_send(snapshot);
        })
        .unwrap();
    (registration, snapshots)
}

async fn next_matching<P>(snapshots: &mut Snapshots, predicate: P) -> ViewSnapshot
where
    P: Fn(&ViewSnapshot) -> bool,
{
    loop {
        let snapshot = snapshots.next().await.expect("listener closed").unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
    }
}

fn current(target_id: i32, seconds: i64) -> Vec<WatchChange> {
    vec![
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                .with_resume_token(format!("resume-{seconds}").into_bytes()),
        ),
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, vec![])
                .with_read_time(SnapshotVersion::from_seconds(seconds)),
        ),
    ]
}

fn acknowledge(seconds: i64) -> WriteResponse {
    let version = SnapshotVersion::from_seconds(seconds);
    WriteResponse {
        stream_token: format!("token-{seconds}").into_bytes(),
        commit_version: version,
        mutation_results: vec![MutationResult::new(version, None)],
    }
}

#[tokio::test]
async fn watch_documents_reach_listeners() {
    let connection = InMemoryConnection::new();
    let client = start_client(connection.clone(), ClientSettings::new("watch")).await;
    let (_registration, mut snapshots) = listen_to_rooms(&client);

    let backend = connection.next_listen_stream().await.unwrap();
    let Some(ListenRequest::AddTarget(target)) = backend.next_request().await else {
        panic!("expected the rooms target");
    };
    let target_id = target.target_id;
    backend.send(WatchChange::TargetChange(WatchTargetChange::new(
        TargetChangeState::Added,
        vec![target_id],
    )));
    backend.send(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: vec![target_id],
        removed_target_ids: vec![],
        document: Document::new(
            key("rooms/a"),
            SnapshotVersion::from_seconds(1),
            data(1),
            DocumentState::Synced,
        ),
    }));
    for change in current(target_id, 1) {
        backend.send(change);
    }

    let snapshot = next_matching(&mut snapshots, |snapshot| !snapshot.from_cache).await;
    assert_eq!(snapshot.docs.len(), 1);
    assert!(snapshot.docs.has(&key("rooms/a")));
    assert!(!snapshot.has_pending_writes());

    let cached = client.get_document_from_cache(key("rooms/a")).await.unwrap();
    assert_eq!(cached.unwrap().data(), &data(1));
}

#[tokio::test]
async fn offline_writes_are_sent_when_the_network_returns() {
    let connection = InMemoryConnection::new();
    let client = start_client(connection.clone(), ClientSettings::new("offline")).await;
    client.disable_network().await.unwrap();

    let write = {
        let client = client.clone();
        tokio::spawn(async move { client.write(vec![Mutation::set(key("rooms/a"), data(1))]).await })
    };
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_for_pending_writes().await })
    };
    let cached = loop {
        if let Ok(Some(doc)) = client.get_document_from_cache(key("rooms/a")).await {
            break doc;
        }
        tokio::task::yield_now().await;
    };
    assert!(cached.has_local_mutations());

    client.enable_network().await.unwrap();
    let backend = connection.next_write_stream().await.unwrap();
    assert!(backend.next_request().await.unwrap().is_handshake());
    backend.send(WriteResponse {
        stream_token: b"token-0".to_vec(),
        ..Default::default()
    });
    let request = backend.next_request().await.unwrap();
    assert_eq!(request.mutations.len(), 1);
    backend.send(acknowledge(2));

    write.await.unwrap().unwrap();
    pending.await.unwrap().unwrap();
    let cached = client.get_document_from_cache(key("rooms/a")).await.unwrap();
    assert!(!cached.unwrap().has_local_mutations());
}

#[tokio::test]
async fn documents_dropped_by_watch_are_resolved_through_limbo() {
    let connection = InMemoryConnection::new();
    let client = start_client(connection.clone(), ClientSettings::new("limbo")).await;
    let (_registration, mut snapshots) = listen_to_rooms(&client);

    let watch = connection.next_listen_stream().await.unwrap();
    let Some(ListenRequest::AddTarget(target)) = watch.next_request().await else {
        panic!("expected the rooms target");
    };
    watch.send(WatchChange::TargetChange(WatchTargetChange::new(
        TargetChangeState::Added,
        vec![target.target_id],
    )));
    watch.send(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: vec![target.target_id],
        removed_target_ids: vec![],
        document: Document::new(
            key("rooms/a"),
            SnapshotVersion::from_seconds(1),
            data(1),
            DocumentState::Synced,
        ),
    }));
    for change in current(target.target_id, 1) {
        watch.send(change);
    }
    let synced = next_matching(&mut snapshots, |snapshot| !snapshot.from_cache).await;
    assert!(synced.docs.has(&key("rooms/a")));

    // The query no longer matches rooms/a but nothing says whether it was
    // deleted, so the client asks for the document on its own target.
    watch.send(WatchChange::DocumentRemove(DocumentRemove {
        key: key("rooms/a"),
        removed_target_ids: vec![target.target_id],
    }));
    watch.send(WatchChange::TargetChange(
        WatchTargetChange::new(TargetChangeState::NoChange, vec![])
            .with_read_time(SnapshotVersion::from_seconds(2)),
    ));
    let Some(ListenRequest::AddTarget(limbo)) = watch.next_request().await else {
        panic!("expected a limbo resolution target");
    };
    assert_eq!(limbo.purpose, TargetPurpose::LimboResolution);
    assert_eq!(
        client.sync_engine().active_limbo_document_resolutions().get(&key("rooms/a")),
        Some(&limbo.target_id)
    );

    // The document target turns current without the document: it is gone.
    watch.send(WatchChange::TargetChange(WatchTargetChange::new(
        TargetChangeState::Added,
        vec![limbo.target_id],
    )));
    for change in current(limbo.target_id, 3) {
        watch.send(change);
    }
    let resolved = next_matching(&mut snapshots, |snapshot| !snapshot.docs.has(&key("rooms/a"))).await;
    assert!(resolved.docs.is_empty());
    assert!(matches!(
        watch.next_request().await,
        Some(ListenRequest::RemoveTarget(id)) if id == limbo.target_id
    ));
    assert!(client.sync_engine().active_limbo_document_resolutions().is_empty());
}

#[tokio::test]
async fn garbage_collection_drops_documents_of_released_queries() {
    let connection = InMemoryConnection::new();
    let params = LruParams {
        cache_size_collection_threshold: 0,
        percentile_to_collect: 100,
        ..LruParams::default()
    };
    let client = start_client(
        connection.clone(),
        ClientSettings::new("gc").with_lru_params(params),
    )
    .await;
    let (registration, mut snapshots) = listen_to_rooms(&client);

    let backend = connection.next_listen_stream().await.unwrap();
    let Some(ListenRequest::AddTarget(target)) = backend.next_request().await else {
        panic!("expected the rooms target");
    };
    backend.send(WatchChange::TargetChange(WatchTargetChange::new(
        TargetChangeState::Added,
        vec![target.target_id],
    )));
    backend.send(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: vec![target.target_id],
        removed_target_ids: vec![],
        document: Document::new(
            key("rooms/a"),
            SnapshotVersion::from_seconds(1),
            data(1),
            DocumentState::Synced,
        ),
    }));
    for change in current(target.target_id, 1) {
        backend.send(change);
    }
    next_matching(&mut snapshots, |snapshot| snapshot.docs.has(&key("rooms/a"))).await;

    registration.remove();
    let local_store = Arc::clone(client.local_store());
    let results = client
        .queue()
        .enqueue(move || async move { local_store.collect_garbage().await })
        .await
        .unwrap();
    assert!(results.did_run);
    assert!(client.local_store().read_document(&key("rooms/a")).await.unwrap().is_none());
}
