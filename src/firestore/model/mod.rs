mod database_id;
mod document;
mod document_key;
mod field_path;
mod geo_point;
pub mod mutation;
pub mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState};
pub use document_key::DocumentKey;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{
    BatchId, MutationBatch, MutationBatchResult, OverlayedDocument, BATCH_ID_UNKNOWN,
};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

/// Identifier of a watch target. Query targets are even, limbo resolution targets are odd.
pub type TargetId = i32;

/// Monotonic counter recording when a target or document was last used.
pub type ListenSequenceNumber = i64;
