use std::collections::BTreeSet;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::value::BytesValue;

/// Callbacks from the remote store into the component owning local state.
///
/// Every method runs synchronously on the caller's turn; errors that are fatal abort the
/// remote store operation that triggered them.
pub trait RemoteSyncer {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to watch a target.
    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected a batch.
    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Next pending batch after `after_batch_id`, in batch id order.
    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    fn set_last_stream_token(&mut self, stream_token: BytesValue) -> FirestoreResult<()>;

    fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion>;

    /// Keys the target currently matches according to its synced views.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn apply_online_state_change(&mut self, online_state: OnlineState);
}
