use async_trait::async_trait;

use crate::firestore::core::{OnlineState, TargetId, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKeySet, MutationBatchResult};
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks from the remote store into the component that owns views and pending writes.
///
/// The remote store never holds its own lock while calling these.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent snapshot from the watch stream.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to listen to `target_id`; its listeners receive `error`.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected the batch.
    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()>;

    /// Switches local state to `user` while the streams are down.
    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;

    /// Keys currently in the views of `target_id`, as last confirmed by the server.
    ///
    /// Called while the remote store holds its state lock, so it must not block.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;
}
