use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use firestore_sync::firestore::local::{InProcessChannel, MemoryKvStore, ZombieRegistry};
use firestore_sync::firestore::model::{DocumentKey, Mutation, MutationResult, SnapshotVersion};
use firestore_sync::firestore::remote::{InMemoryConnection, WriteResponse};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{ClientContext, ClientSettings, FirestoreClient};

/// Storage, broadcast channel and backend shared by every client in a test.
struct Shared {
    store: Arc<MemoryKvStore>,
    channel: InProcessChannel,
    zombies: ZombieRegistry,
    connection: Arc<InMemoryConnection>,
}

impl Shared {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryKvStore::new()),
            channel: InProcessChannel::new(),
            zombies: ZombieRegistry::new(),
            connection: InMemoryConnection::new(),
        }
    }

    async fn client(&self, id: &str) -> FirestoreClient {
        let context = ClientContext::new(self.store.clone(), self.connection.clone())
            .with_channel(self.channel.clone())
            .with_zombie_registry(self.zombies.clone());
        FirestoreClient::start(ClientSettings::new(id).with_multi_tab(true), context)
            .await
            .unwrap()
    }
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn data(value: i64) -> MapValue {
    MapValue::new(BTreeMap::from([(
        "value".to_string(),
        FirestoreValue::from_integer(value),
    )]))
}

#[tokio::test(start_paused = true)]
async fn first_client_holds_the_lease_until_it_terminates() {
    let shared = Shared::new();
    let first = shared.client("first").await;
    let second = shared.client("second").await;
    assert!(first.is_primary());
    assert!(!second.is_primary());

    first.terminate().await.unwrap();
    for _ in 0..30 {
        if second.is_primary() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(second.is_primary());
}

#[tokio::test(start_paused = true)]
async fn secondary_writes_are_sent_by_the_primary() {
    let shared = Shared::new();
    let primary = shared.client("primary").await;
    let secondary = shared.client("secondary").await;
    assert!(primary.is_primary());

    let write = {
        let secondary = secondary.clone();
        tokio::spawn(async move {
            secondary
                .write(vec![Mutation::set(key("rooms/a"), data(1))])
                .await
        })
    };

    let backend = shared.connection.next_write_stream().await.unwrap();
    assert!(backend.next_request().await.unwrap().is_handshake());
    backend.send(WriteResponse {
        stream_token: b"token-0".to_vec(),
        ..Default::default()
    });
    let request = backend.next_request().await.unwrap();
    assert_eq!(request.mutations.len(), 1);
    assert_eq!(request.mutations[0].key(), &key("rooms/a"));

    let version = SnapshotVersion::from_seconds(3);
    backend.send(WriteResponse {
        stream_token: b"token-1".to_vec(),
        commit_version: version,
        mutation_results: vec![MutationResult::new(version, None)],
    });
    // The primary publishes the acknowledgement and the secondary resolves
    // its own callback.
    write.await.unwrap().unwrap();
}
