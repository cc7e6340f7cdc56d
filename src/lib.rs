//! Offline-first local cache and watch/write synchronisation engine for Firestore-style
//! document database clients.
//!
//! The entry point is [`firestore::FirestoreClient`]: it owns an in-memory local store,
//! keeps listen and write streams to the backend open through a
//! [`StreamingDatastore`](firestore::remote::StreamingDatastore), and raises
//! [`ViewSnapshot`](firestore::ViewSnapshot)s to registered listeners.

pub mod firestore;
pub mod platform;
