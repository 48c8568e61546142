#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};

use firestore_sync::config::{PersistenceSettings, SyncSettings};
use firestore_sync::core::{FirestoreClient, ListenOptions, Query, Transaction, ViewSnapshot};
use firestore_sync::error::FirestoreResult;
use firestore_sync::model::{DatabaseId, DocumentKey, Mutation, ObjectValue, ResourcePath};
use firestore_sync::remote::{InMemoryConnection, NoopTokenProvider, ServerStream, User};
use firestore_sync::util::{box_future, BoxedFuture};
use serde_json::json;

async fn memory_client(connection: &InMemoryConnection) -> FirestoreClient {
    FirestoreClient::new(
        DatabaseId::default("p"),
        SyncSettings::default(),
        Arc::new(connection.clone()),
        Arc::new(NoopTokenProvider),
        User::unauthenticated(),
        PersistenceSettings::Memory,
    )
    .await
    .expect("create client")
}

async fn settle(client: &FirestoreClient) {
    for _ in 0..5 {
        tokio::task::yield_now().await;
        client.queue().drain().await.unwrap();
    }
}

async fn open_write_stream(client: &FirestoreClient, connection: &InMemoryConnection) -> ServerStream {
    let server = connection.accept("Write").await;
    settle(client).await;
    let handshake = server.receive().await.unwrap();
    assert!(handshake.get("writes").is_none());
    server.send(json!({ "streamToken": "AQ==" })).unwrap();
    settle(client).await;
    server
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

#[tokio::test]
async fn offline_writes_are_sent_once_the_network_is_back() {
    let connection = InMemoryConnection::new();
    let client = memory_client(&connection).await;
    client.disable_network().await.unwrap();

    let write = client.write(vec![Mutation::set(key("rooms/a"), ObjectValue::empty())]);
    let server_side = async {
        settle(&client).await;
        let cached = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
        assert!(cached.unwrap().has_local_mutations());

        client.enable_network().await.unwrap();
        let server = open_write_stream(&client, &connection).await;
        let request = server.receive().await.unwrap();
        assert_eq!(request["streamToken"], json!("AQ=="));
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
        server
            .send(json!({
                "streamToken": "Ag==",
                "commitTime": "2024-01-01T00:00:01Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:01Z" }]
            }))
            .unwrap();
        settle(&client).await;
    };

    let (result, ()) = futures::join!(write, server_side);
    result.unwrap();
    client.wait_for_pending_writes().await.unwrap();
    client.terminate().await.unwrap();
}

#[tokio::test]
async fn listeners_receive_server_snapshots() {
    let connection = InMemoryConnection::new();
    let client = memory_client(&connection).await;

    let events: Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener = client
        .listen(
            Query::new(ResourcePath::from_string("c").unwrap()),
            ListenOptions::default(),
            Arc::new(move |event: FirestoreResult<ViewSnapshot>| sink.lock().unwrap().push(event)),
        )
        .await
        .unwrap();

    let server = connection.accept("Listen").await;
    settle(&client).await;
    let request = server.receive().await.unwrap();
    assert_eq!(request["addTarget"]["targetId"], json!(2));

    server
        .send(json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }))
        .unwrap();
    server
        .send(json!({ "documentChange": {
            "document": {
                "name": "projects/p/databases/(default)/documents/c/1",
                "fields": {},
                "updateTime": "2024-01-01T00:00:01Z"
            },
            "targetIds": [2]
        } }))
        .unwrap();
    server
        .send(json!({ "targetChange": {
            "targetChangeType": "CURRENT",
            "targetIds": [2],
            "resumeToken": "AQ=="
        } }))
        .unwrap();
    server
        .send(json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } }))
        .unwrap();
    settle(&client).await;

    {
        let events = events.lock().unwrap();
        let snapshot = events.last().unwrap().as_ref().unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.docs.has(&key("c/1")));
    }

    client.unlisten(&listener).await.unwrap();
    settle(&client).await;
    assert_eq!(server.receive().await.unwrap()["removeTarget"], json!(2));
    client.terminate().await.unwrap();
}

fn document_change(path: &str, target_id: i32) -> serde_json::Value {
    json!({ "documentChange": {
        "document": {
            "name": format!("projects/p/databases/(default)/documents/{path}"),
            "fields": {},
            "updateTime": "2024-01-01T00:00:01Z"
        },
        "targetIds": [target_id]
    } })
}

#[tokio::test]
async fn existence_filter_mismatches_fall_back_to_the_cache_and_relisten() {
    let connection = InMemoryConnection::new();
    let client = memory_client(&connection).await;

    let events: Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client
        .listen(
            Query::new(ResourcePath::from_string("c").unwrap()),
            ListenOptions::default(),
            Arc::new(move |event: FirestoreResult<ViewSnapshot>| sink.lock().unwrap().push(event)),
        )
        .await
        .unwrap();

    let server = connection.accept("Listen").await;
    settle(&client).await;
    assert_eq!(server.receive().await.unwrap()["addTarget"]["targetId"], json!(2));

    server
        .send(json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }))
        .unwrap();
    for path in ["c/1", "c/2", "c/3"] {
        server.send(document_change(path, 2)).unwrap();
    }
    server
        .send(json!({ "targetChange": {
            "targetChangeType": "CURRENT",
            "targetIds": [2],
            "resumeToken": "AQ=="
        } }))
        .unwrap();
    server
        .send(json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } }))
        .unwrap();
    settle(&client).await;
    {
        let events = events.lock().unwrap();
        let snapshot = events.last().unwrap().as_ref().unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.docs.len(), 3);
    }
    let raised = events.lock().unwrap().len();

    server.send(json!({ "filter": { "targetId": 2, "count": 2 } })).unwrap();
    server
        .send(json!({ "targetChange": { "readTime": "2024-01-01T00:00:02Z" } }))
        .unwrap();
    settle(&client).await;

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), raised + 1);
        let snapshot = events.last().unwrap().as_ref().unwrap();
        assert!(snapshot.from_cache);
    }
    assert_eq!(server.receive().await.unwrap()["removeTarget"], json!(2));
    let relisten = server.receive().await.unwrap();
    assert_eq!(relisten["addTarget"]["targetId"], json!(2));
    assert!(relisten["addTarget"].get("resumeToken").is_none());
    client.terminate().await.unwrap();
}

#[tokio::test]
async fn transactions_commit_through_the_datastore() {
    let connection = InMemoryConnection::new();
    connection.set_rpc_handler(|rpc, _| match rpc {
        "BatchGetDocuments" => Ok(json!([
            { "missing": "projects/p/databases/(default)/documents/c/1",
              "readTime": "2024-01-01T00:00:01Z" }
        ])),
        _ => Ok(json!({ "commitTime": "2024-01-01T00:00:02Z", "writeResults": [{}] })),
    });
    let client = memory_client(&connection).await;

    let found = client
        .transaction(|transaction: Arc<Transaction>| -> BoxedFuture<'static, FirestoreResult<usize>> {
            box_future(async move {
                let docs = transaction.lookup(&[key("c/1")]).await?;
                transaction.set(key("c/1"), ObjectValue::empty())?;
                Ok(docs.len())
            })
        })
        .await
        .unwrap();
    assert_eq!(found, 1);
    assert!(connection
        .recorded_rpcs()
        .iter()
        .any(|rpc| rpc.rpc_name == "Commit"));
    client.terminate().await.unwrap();
}
