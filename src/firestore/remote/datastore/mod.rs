use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::effects::StreamKind;

pub mod streaming;

pub use streaming::{StreamingDatastoreImpl, StreamingHandleImpl};

#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Supplies auth tokens attached to newly opened streams.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;
    /// The backend rejected the current token; the next `get_token` must refresh it.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// A bidirectional stream of encoded protocol messages.
pub trait StreamHandle: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;
    /// `None` when the backend closed the stream without a status.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;
    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens listen and write streams to the backend.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_stream(
        &self,
        kind: StreamKind,
        auth_token: Option<String>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}
