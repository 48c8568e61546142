use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{BatchId, DocumentKeySet, MutationBatchResult, TargetId};
use crate::remote::credentials::User;
use crate::remote::remote_event::RemoteEvent;
use crate::util::BoxedFuture;

/// The layer above the [`RemoteStore`](crate::remote::RemoteStore) that
/// applies what the backend reports to the local state.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot produced by the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> BoxedFuture<'_, FirestoreResult<()>>;

    /// The backend removed `target_id` with an error. Storage failures are
    /// returned to the caller; other errors are reported to listeners.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> BoxedFuture<'_, FirestoreResult<()>>;

    /// The backend acknowledged the head of the write pipeline.
    fn apply_successful_write(&self, result: MutationBatchResult) -> BoxedFuture<'_, FirestoreResult<()>>;

    /// The backend permanently rejected batch `batch_id`.
    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> BoxedFuture<'_, FirestoreResult<()>>;

    /// Switches the local state to `user`. Runs while the network is
    /// disabled for the credential change.
    fn handle_credential_change(&self, user: User) -> BoxedFuture<'_, FirestoreResult<()>>;

    /// Keys the backend last reported for `target_id`, plus limbo documents
    /// being resolved through it.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;
}
