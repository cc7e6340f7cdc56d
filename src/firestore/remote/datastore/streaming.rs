use std::sync::Arc;

use super::{StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::effects::StreamKind;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamHeader};

use futures::FutureExt;

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Label carried by the open frame of each stream kind.
pub fn stream_label(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Listen => "listen",
        StreamKind::Write => "write",
    }
}

/// Opens labeled streams over a [`MultiplexedConnection`].
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>) -> Self {
        Self { connection }
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_stream(
        &self,
        kind: StreamKind,
        auth_token: Option<String>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let header = StreamHeader {
                label: stream_label(kind).to_string(),
                auth_token,
            };
            let stream = connection.open_stream(header).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::stream::InMemoryTransport;

    #[tokio::test]
    async fn opened_streams_are_labeled_by_kind() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(left_transport));
        let server = MultiplexedConnection::new(right_transport);

        let datastore = StreamingDatastoreImpl::new(Arc::clone(&client));
        let handle = datastore
            .open_stream(StreamKind::Write, Some("secret".to_string()))
            .await
            .expect("open write stream");

        let (header, peer) = server.accept_stream().await.expect("accept");
        assert_eq!(header.label, "write");
        assert_eq!(header.auth_token.as_deref(), Some("secret"));

        peer.send(b"hello".to_vec()).await.expect("send payload");
        let payload = handle.next().await.expect("event").expect("payload");
        assert_eq!(payload, b"hello");
        handle.close().await.expect("close stream");
    }
}
