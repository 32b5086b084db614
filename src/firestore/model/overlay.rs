use crate::firestore::model::{BatchId, DocumentKey, Mutation};

/// The net local mutation for one document together with the newest batch it reflects.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
