use std::sync::Arc;

use futures::channel::oneshot;

use crate::config::SyncSettings;
use crate::core::transaction::Transaction;
use crate::error::{cancelled, is_retryable_transaction_error, FirestoreResult};
use crate::remote::Datastore;
use crate::util::{box_future, AsyncQueue, BoxedFuture, ExponentialBackoff, MaybeSend, TimerId};

/// Body of a transaction. It is called once per attempt with a fresh
/// [`Transaction`] and must be safe to run again.
pub trait UpdateFunction<T>: Fn(Arc<Transaction>) -> BoxedFuture<'static, FirestoreResult<T>> + MaybeSend {}

impl<T, F> UpdateFunction<T> for F where F: Fn(Arc<Transaction>) -> BoxedFuture<'static, FirestoreResult<T>> + MaybeSend {}

/// Runs an update function and commits its writes, retrying contended
/// attempts with exponential backoff.
pub struct TransactionRunner<T, F> {
    datastore: Arc<Datastore>,
    update_function: F,
    attempts_remaining: usize,
    backoff: ExponentialBackoff,
    _result: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> TransactionRunner<T, F>
where
    F: UpdateFunction<T>,
{
    pub fn new(queue: AsyncQueue, datastore: Arc<Datastore>, settings: &SyncSettings, update_function: F) -> Self {
        Self {
            datastore,
            update_function,
            attempts_remaining: settings.max_transaction_attempts,
            backoff: ExponentialBackoff::new(queue, TimerId::TransactionRetry, settings.backoff),
            _result: std::marker::PhantomData,
        }
    }

    pub async fn run(mut self) -> FirestoreResult<T> {
        loop {
            self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
            self.wait_for_backoff().await?;

            let transaction = Arc::new(Transaction::new(Arc::clone(&self.datastore)));
            let result = match (self.update_function)(Arc::clone(&transaction)).await {
                Ok(value) => transaction.commit().await.map(|()| value),
                Err(err) => Err(err),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if self.attempts_remaining > 0 && is_retryable_transaction_error(err.code) => {
                    log::debug!(
                        "transaction failed with {err}; {} attempts remaining",
                        self.attempts_remaining
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolves once the backoff timer fired on the queue. The first
    /// attempt runs without delay.
    async fn wait_for_backoff(&mut self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.backoff.backoff_and_run(move || {
            box_future(async move {
                let _ = sender.send(());
            })
        });
        receiver
            .await
            .map_err(|_| cancelled("transaction attempt was cancelled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{permission_denied, FirestoreErrorCode};
    use crate::model::{DatabaseId, DocumentKey, ObjectValue};
    use crate::remote::{InMemoryConnection, JsonProtoSerializer, NoopTokenProvider};
    use crate::util::BackoffSettings;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> SyncSettings {
        SyncSettings {
            backoff: BackoffSettings {
                initial_delay_ms: 1,
                backoff_factor: 1.5,
                max_delay_ms: 5,
            },
            ..SyncSettings::default()
        }
    }

    fn datastore(connection: &InMemoryConnection) -> Arc<Datastore> {
        Arc::new(Datastore::new(
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ))
    }

    fn commits(connection: &InMemoryConnection) -> usize {
        connection
            .recorded_rpcs()
            .iter()
            .filter(|rpc| rpc.rpc_name == "Commit")
            .count()
    }

    fn write_once(transaction: Arc<Transaction>) -> BoxedFuture<'static, FirestoreResult<()>> {
        box_future(async move {
            transaction.set(DocumentKey::from_string("c/1")?, ObjectValue::empty())
        })
    }

    #[tokio::test]
    async fn aborted_commits_are_retried() {
        let connection = InMemoryConnection::new();
        let failures = Arc::new(AtomicUsize::new(2));
        let remaining = Arc::clone(&failures);
        connection.set_rpc_handler(move |_, _| {
            if remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::error::aborted("contention"));
            }
            Ok(json!({ "commitTime": "2024-01-01T00:00:02Z", "writeResults": [{}] }))
        });

        let runner = TransactionRunner::new(AsyncQueue::new(), datastore(&connection), &settings(), write_once);
        runner.run().await.unwrap();
        assert_eq!(commits(&connection), 3);
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let connection = InMemoryConnection::new();
        connection.set_rpc_handler(|_, _| Err(crate::error::aborted("contention")));

        let runner = TransactionRunner::new(AsyncQueue::new(), datastore(&connection), &settings(), write_once);
        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(commits(&connection), 5);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let connection = InMemoryConnection::new();
        connection.set_rpc_handler(|_, _| Err(permission_denied("rules")));

        let runner = TransactionRunner::new(AsyncQueue::new(), datastore(&connection), &settings(), write_once);
        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(commits(&connection), 1);
    }

    #[tokio::test]
    async fn errors_from_the_update_function_are_returned() {
        let connection = InMemoryConnection::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let runner = TransactionRunner::new(
            AsyncQueue::new(),
            datastore(&connection),
            &settings(),
            move |_transaction: Arc<Transaction>| -> BoxedFuture<'static, FirestoreResult<()>> {
                counter.fetch_add(1, Ordering::SeqCst);
                box_future(async { Err(crate::error::invalid_argument("bad input")) })
            },
        );
        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(commits(&connection), 0);
    }
}
