use crate::firestore::local::TargetData;
use crate::firestore::model::{MutationBatch, MutationResult, SnapshotVersion, TargetId};
use crate::firestore::value::BytesValue;

/// Outbound listen-stream message.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    /// Starts watching; resumes from the target's resume token or snapshot version.
    AddTarget(TargetData),
    RemoveTarget(TargetId),
}

/// Outbound write-stream message.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// First message on every new write stream.
    Handshake,
    Mutations {
        stream_token: BytesValue,
        batch: MutationBatch,
    },
}

/// Inbound write-stream message. The first one answers the handshake and carries no results.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: BytesValue,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}
