#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;

use firestore_sync::config::{PersistenceSettings, SyncSettings};
use firestore_sync::core::FirestoreClient;
use firestore_sync::error::{FirestoreErrorCode, FirestoreResult};
use firestore_sync::local::kv::MemoryKvStore;
use firestore_sync::model::{DatabaseId, DocumentKey, Mutation, ObjectValue};
use firestore_sync::multi_tab::InMemoryBroadcastHub;
use firestore_sync::remote::{InMemoryConnection, NoopTokenProvider, User};
use futures::channel::oneshot;

/// Storage shared by every tab of one test.
struct Browser {
    store: MemoryKvStore,
    hub: InMemoryBroadcastHub,
    connection: InMemoryConnection,
}

impl Browser {
    fn new() -> Self {
        Self {
            store: MemoryKvStore::new(),
            hub: InMemoryBroadcastHub::new(),
            connection: InMemoryConnection::new(),
        }
    }

    async fn open_tab(&self, synchronize_tabs: bool) -> FirestoreResult<FirestoreClient> {
        FirestoreClient::new(
            DatabaseId::default("p"),
            SyncSettings::default(),
            Arc::new(self.connection.clone()),
            Arc::new(NoopTokenProvider),
            User::unauthenticated(),
            PersistenceSettings::Durable {
                persistence_key: "tests".to_string(),
                store: Arc::new(self.store.clone()),
                broadcast: self.hub.channel(),
                synchronize_tabs,
            },
        )
        .await
    }
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

#[tokio::test]
async fn the_first_tab_becomes_primary() {
    let browser = Browser::new();
    let first = browser.open_tab(true).await.unwrap();
    let second = browser.open_tab(true).await.unwrap();

    assert!(first.sync_engine().is_primary_client());
    assert!(!second.sync_engine().is_primary_client());

    second.terminate().await.unwrap();
    first.terminate().await.unwrap();
}

#[tokio::test]
async fn tabs_without_synchronization_cannot_share_the_store() {
    let browser = Browser::new();
    let first = browser.open_tab(true).await.unwrap();

    let err = browser.open_tab(false).await.err().unwrap();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

    first.terminate().await.unwrap();
}

#[tokio::test]
async fn pending_writes_are_visible_to_other_tabs() {
    let browser = Browser::new();
    let primary = browser.open_tab(true).await.unwrap();
    let secondary = browser.open_tab(true).await.unwrap();
    primary.disable_network().await.unwrap();

    let sync_engine = Arc::clone(primary.sync_engine());
    let (sender, _receiver) = oneshot::channel();
    primary
        .queue()
        .enqueue(async move {
            sync_engine
                .write(vec![Mutation::set(key("rooms/a"), ObjectValue::empty())], sender)
                .await
        })
        .await
        .unwrap();

    let doc = secondary
        .get_document_from_local_cache(key("rooms/a"))
        .await
        .unwrap()
        .unwrap();
    assert!(doc.has_local_mutations());

    secondary.terminate().await.unwrap();
    primary.terminate().await.unwrap();
}

#[tokio::test]
async fn pending_writes_survive_a_restart() {
    let browser = Browser::new();
    let client = browser.open_tab(false).await.unwrap();
    client.disable_network().await.unwrap();

    let sync_engine = Arc::clone(client.sync_engine());
    let (sender, _receiver) = oneshot::channel();
    client
        .queue()
        .enqueue(async move {
            sync_engine
                .write(vec![Mutation::set(key("rooms/b"), ObjectValue::empty())], sender)
                .await
        })
        .await
        .unwrap();
    client.terminate().await.unwrap();

    let restarted = browser.open_tab(false).await.unwrap();
    assert!(restarted.sync_engine().is_primary_client());
    let doc = restarted
        .get_document_from_local_cache(key("rooms/b"))
        .await
        .unwrap()
        .unwrap();
    assert!(doc.has_local_mutations());
    restarted.terminate().await.unwrap();
}
