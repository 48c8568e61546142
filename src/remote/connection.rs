//! The RPC boundary: unary calls and bidirectional streams of structured
//! JSON records keyed by backend field names.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{unavailable, FirestoreError, FirestoreResult};

/// Frames travelling from the server to the client.
enum ServerFrame {
    Message(JsonValue),
    Error(FirestoreError),
}

/// Client end of an open stream.
pub struct StreamHandle {
    outbound: Sender<JsonValue>,
    inbound: Receiver<ServerFrame>,
}

/// Server end of an open stream.
pub struct ServerStream {
    inbound: Receiver<JsonValue>,
    outbound: Sender<ServerFrame>,
}

impl StreamHandle {
    /// Connected client and server ends.
    pub fn pair() -> (StreamHandle, ServerStream) {
        let (client_tx, server_rx) = async_channel::unbounded();
        let (server_tx, client_rx) = async_channel::unbounded();
        (
            StreamHandle {
                outbound: client_tx,
                inbound: client_rx,
            },
            ServerStream {
                inbound: server_rx,
                outbound: server_tx,
            },
        )
    }

    pub fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(message)
            .map_err(|_| unavailable("stream is closed"))
    }

    /// The next server message. `None` once the server closed the stream
    /// cleanly or the handle was closed locally.
    pub async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        match self.inbound.recv().await {
            Ok(ServerFrame::Message(message)) => Some(Ok(message)),
            Ok(ServerFrame::Error(error)) => {
                self.inbound.close();
                Some(Err(error))
            }
            Err(_) => None,
        }
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl ServerStream {
    /// The next client message, or `None` once the client closed the stream.
    pub async fn receive(&self) -> Option<JsonValue> {
        self.inbound.recv().await.ok()
    }

    /// A client message that is already buffered.
    pub fn try_receive(&self) -> Option<JsonValue> {
        self.inbound.try_recv().ok()
    }

    pub fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(ServerFrame::Message(message))
            .map_err(|_| unavailable("stream is closed"))
    }

    /// Terminates the stream with `error`.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.outbound.try_send(ServerFrame::Error(error));
        self.outbound.close();
        self.inbound.close();
    }

    /// Terminates the stream without an error.
    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// Transport to the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    /// Unary call of `rpc_name` on the resource at `path`.
    async fn invoke_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<JsonValue>;

    /// Opens a bidirectional stream; resolves once the stream is usable.
    async fn open_stream(&self, rpc_name: &str, token: Option<String>) -> FirestoreResult<StreamHandle>;
}

pub type RpcHandler = Arc<dyn Fn(&str, JsonValue) -> FirestoreResult<JsonValue> + Send + Sync>;

/// A unary call received by an [`InMemoryConnection`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRpc {
    pub rpc_name: String,
    pub path: String,
    pub request: JsonValue,
    pub token: Option<String>,
}

/// Loopback [`Connection`] whose server side is driven by the caller:
/// unary calls go to a handler and stream opens are handed out through
/// [`accept`](InMemoryConnection::accept).
#[derive(Clone, Default)]
pub struct InMemoryConnection {
    inner: Arc<Mutex<InMemoryState>>,
}

#[derive(Default)]
struct InMemoryState {
    rpc_handler: Option<RpcHandler>,
    rpcs: Vec<RecordedRpc>,
    stream_tokens: Vec<Option<String>>,
    pending_open_failures: VecDeque<FirestoreError>,
    accept_queues: HashMap<String, (Sender<ServerStream>, Receiver<ServerStream>)>,
}

impl InMemoryState {
    fn accept_queue(&mut self, rpc_name: &str) -> (Sender<ServerStream>, Receiver<ServerStream>) {
        self.accept_queues
            .entry(rpc_name.to_string())
            .or_insert_with(async_channel::unbounded)
            .clone()
    }
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_rpc_handler<F>(&self, handler: F)
    where
        F: Fn(&str, JsonValue) -> FirestoreResult<JsonValue> + Send + Sync + 'static,
    {
        self.lock().rpc_handler = Some(Arc::new(handler));
    }

    /// Makes the next stream open fail with `error` instead of connecting.
    pub fn fail_next_stream_open(&self, error: FirestoreError) {
        self.lock().pending_open_failures.push_back(error);
    }

    /// Waits for the client to open a stream of `rpc_name`.
    pub async fn accept(&self, rpc_name: &str) -> ServerStream {
        let (_, receiver) = self.lock().accept_queue(rpc_name);
        match receiver.recv().await {
            Ok(stream) => stream,
            Err(_) => {
                let (client, server) = StreamHandle::pair();
                client.close();
                server
            }
        }
    }

    /// A stream of `rpc_name` the client already opened, if any.
    pub fn try_accept(&self, rpc_name: &str) -> Option<ServerStream> {
        let (_, receiver) = self.lock().accept_queue(rpc_name);
        receiver.try_recv().ok()
    }

    pub fn recorded_rpcs(&self) -> Vec<RecordedRpc> {
        self.lock().rpcs.clone()
    }

    /// Tokens presented on each stream open, in order.
    pub fn stream_tokens(&self) -> Vec<Option<String>> {
        self.lock().stream_tokens.clone()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn invoke_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<JsonValue> {
        let handler = {
            let mut state = self.lock();
            state.rpcs.push(RecordedRpc {
                rpc_name: rpc_name.to_string(),
                path: path.to_string(),
                request: request.clone(),
                token,
            });
            state.rpc_handler.clone()
        };
        match handler {
            Some(handler) => handler(rpc_name, request),
            None => Err(unavailable(format!("no handler for {rpc_name}"))),
        }
    }

    async fn open_stream(&self, rpc_name: &str, token: Option<String>) -> FirestoreResult<StreamHandle> {
        let sender = {
            let mut state = self.lock();
            state.stream_tokens.push(token);
            if let Some(error) = state.pending_open_failures.pop_front() {
                return Err(error);
            }
            state.accept_queue(rpc_name).0
        };
        let (client, server) = StreamHandle::pair();
        sender
            .try_send(server)
            .map_err(|_| unavailable(format!("{rpc_name} is not accepting streams")))?;
        log::debug!("opened in-memory {rpc_name} stream");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn stream_pair_exchanges_messages_both_ways() {
        let connection = InMemoryConnection::new();
        let client = connection.open_stream("Listen", Some("t".into())).await.unwrap();
        let server = connection.accept("Listen").await;

        client.send(json!({"addTarget": 1})).unwrap();
        assert_eq!(server.receive().await, Some(json!({"addTarget": 1})));

        server.send(json!({"targetChange": {}})).unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), json!({"targetChange": {}}));

        server.fail(unavailable("gone"));
        let err = client.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        assert!(client.next().await.is_none());
        assert_eq!(connection.stream_tokens(), vec![Some("t".to_string())]);
    }

    #[tokio::test]
    async fn closing_the_client_ends_the_server_side() {
        let (client, server) = StreamHandle::pair();
        client.close();
        assert!(server.receive().await.is_none());
        assert!(client.send(json!({})).is_err());
    }

    #[tokio::test]
    async fn injected_open_failures_are_consumed_in_order() {
        let connection = InMemoryConnection::new();
        connection.fail_next_stream_open(unavailable("offline"));
        assert!(connection.open_stream("Write", None).await.is_err());
        assert!(connection.open_stream("Write", None).await.is_ok());
        assert!(connection.try_accept("Write").is_some());
    }

    #[tokio::test]
    async fn unary_calls_reach_the_handler() {
        let connection = InMemoryConnection::new();
        connection.set_rpc_handler(|name, request| Ok(json!({ "echo": name, "request": request })));
        let response = connection
            .invoke_rpc("Commit", "projects/p/databases/(default)", json!({"writes": []}), None)
            .await
            .unwrap();
        assert_eq!(response["echo"], json!("Commit"));
        assert_eq!(connection.recorded_rpcs().len(), 1);
    }
}
