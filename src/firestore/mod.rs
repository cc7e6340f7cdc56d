//! Local cache and sync engine of a Firestore-style document database client.
//!
//! Writes land in a local mutation queue and are visible to queries immediately; a listen
//! stream keeps cached query results in sync with the backend and a write stream delivers
//! queued batches in order.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use self::core::{FirestoreClient, ListenOptions, ListenerRegistration, Query, Source, SyncSettings, ViewSnapshot};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
