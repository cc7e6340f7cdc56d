use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Sent with the open frame so the peer can route and authorize the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub label: String,
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamHeader),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn new(stream_id: StreamId, kind: FrameKind) -> Self {
        Self { stream_id, kind }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Carries frames for many logical streams over one underlying channel.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn lock_registry(streams: &StreamRegistry) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Multiplexes logical streams over a [`StreamTransport`].
///
/// The side that calls [`open_stream`](Self::open_stream) allocates the stream id; the peer
/// picks the stream up with [`accept_stream`](Self::accept_stream). When the transport fails
/// every live stream ends with an `Unavailable` error.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted_rx: Receiver<(StreamHeader, MultiplexedStream)>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));

        start_outbound_loop(Arc::clone(&transport), outbound_rx);
        start_inbound_loop(
            transport,
            Arc::clone(&streams),
            outbound_tx.clone(),
            accepted_tx,
        );

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted_rx,
        }
    }

    pub async fn open_stream(&self, header: StreamHeader) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let stream = register_stream(stream_id, &self.streams, &self.outbound_tx);
        self.outbound_tx
            .send(TransportFrame::new(stream_id, FrameKind::Open(header)))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(stream)
    }

    /// Waits for the peer to open a stream. Fails once the transport is gone.
    pub async fn accept_stream(&self) -> FirestoreResult<(StreamHeader, MultiplexedStream)> {
        self.accepted_rx
            .recv()
            .await
            .map_err(|_| unavailable("Connection closed"))
    }
}

fn register_stream(
    stream_id: StreamId,
    streams: &StreamRegistry,
    outbound_tx: &Sender<TransportFrame>,
) -> MultiplexedStream {
    let (inbound_tx, inbound_rx) = async_channel::unbounded();
    lock_registry(streams).insert(stream_id, inbound_tx);
    MultiplexedStream {
        id: stream_id,
        outbound: outbound_tx.clone(),
        inbound: inbound_rx,
        streams: Arc::clone(streams),
    }
}

fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
    runtime::spawn_detached(async move {
        while let Ok(frame) = outbound_rx.recv().await {
            if let Err(err) = transport.send(frame).await {
                log::warn!("multiplexed outbound loop terminated: {err}");
                break;
            }
        }
    });
}

fn start_inbound_loop(
    transport: Arc<dyn StreamTransport>,
    streams: StreamRegistry,
    outbound_tx: Sender<TransportFrame>,
    accepted_tx: Sender<(StreamHeader, MultiplexedStream)>,
) {
    runtime::spawn_detached(async move {
        loop {
            let frame = match transport.next().await {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("multiplexed inbound loop terminated: {err}");
                    break;
                }
            };
            let stream_id = frame.stream_id();
            if let FrameKind::Open(header) = frame.kind() {
                let stream = register_stream(stream_id, &streams, &outbound_tx);
                if accepted_tx.send((header.clone(), stream)).await.is_err() {
                    log::debug!("no acceptor for stream {}", stream_id.value());
                }
                continue;
            }

            let sender = lock_registry(&streams).get(&stream_id).cloned();
            let Some(sender) = sender else {
                log::debug!("dropping frame for unknown stream {}", stream_id.value());
                continue;
            };
            let event = frame.kind().clone();
            let terminal = matches!(event, FrameKind::Close | FrameKind::Error(_));
            if sender.send(event).await.is_err() {
                log::debug!("dropping inbound frame for closed stream {}", stream_id.value());
            }
            if terminal {
                lock_registry(&streams).remove(&stream_id);
            }
        }

        // Transport gone: fail every open stream.
        let senders: Vec<_> = lock_registry(&streams).drain().map(|(_, sender)| sender).collect();
        for sender in senders {
            let _ = sender
                .send(FrameKind::Error(unavailable("Connection lost")))
                .await;
        }
    });
}

/// One logical stream. Dropping it closes the stream on both ends.
pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamRegistry,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Data(payload)))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// `None` once the peer closed the stream cleanly.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    /// Ends the stream with an error status the peer receives from `next`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Error(error)))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue error frame: {err}")))?;
        lock_registry(&self.streams).remove(&self.id);
        Ok(())
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Close))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue close frame: {err}")))?;
        lock_registry(&self.streams).remove(&self.id);
        Ok(())
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        if lock_registry(&self.streams).remove(&self.id).is_some() {
            let _ = self
                .outbound
                .try_send(TransportFrame::new(self.id, FrameKind::Close));
        }
    }
}

/// Loopback transport; the two halves of [`InMemoryTransport::pair`] talk to each other.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Simulates a dropped connection; both halves stop delivering frames.
    pub fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};

    fn header(label: &str) -> StreamHeader {
        StreamHeader {
            label: label.to_string(),
            auth_token: Some("token".to_string()),
        }
    }

    #[tokio::test]
    async fn accepted_stream_exchanges_payloads() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(left_transport);
        let server = MultiplexedConnection::new(right_transport);

        let client_stream = client.open_stream(header("listen")).await.expect("open");
        let (accepted_header, server_stream) = server.accept_stream().await.expect("accept");
        assert_eq!(accepted_header, header("listen"));

        client_stream.send(b"hello".to_vec()).await.expect("send");
        let payload = server_stream.next().await.expect("frame").expect("payload");
        assert_eq!(payload, b"hello");

        server_stream.send(b"world".to_vec()).await.expect("send");
        let payload = client_stream.next().await.expect("frame").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn peer_close_and_error_end_the_stream() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(left_transport);
        let server = MultiplexedConnection::new(right_transport);

        let listen = client.open_stream(header("listen")).await.expect("open");
        let write = client.open_stream(header("write")).await.expect("open");
        let (_, server_listen) = server.accept_stream().await.expect("accept");
        let (_, server_write) = server.accept_stream().await.expect("accept");

        server_listen.close().await.expect("close");
        assert!(listen.next().await.is_none());

        server_write.fail(permission_denied("denied")).await.expect("fail");
        let error = write.next().await.expect("frame").unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn dropping_a_stream_closes_it_for_the_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(left_transport);
        let server = MultiplexedConnection::new(right_transport);

        let stream = client.open_stream(header("write")).await.expect("open");
        let (_, server_stream) = server.accept_stream().await.expect("accept");
        drop(stream);
        assert!(server_stream.next().await.is_none());
    }
}
