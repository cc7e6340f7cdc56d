use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_lock::Mutex;
use futures::channel::oneshot;
use serde_json::Value as JsonValue;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerId, QueryListener, SnapshotObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::settings::SyncSettings;
use crate::firestore::core::sync_engine::{RemoteRequest, SyncEngine, SyncEvent};
use crate::firestore::core::view::ViewSnapshot;
use crate::firestore::error::{
    cancelled, failed_precondition, internal_error, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::{LocalStore, LruParams, LruResults, MemoryPersistence, Persistence};
use crate::firestore::model::{Document, DocumentKey, Mutation};
use crate::firestore::remote::datastore::streaming::box_stream_future;
use crate::firestore::remote::{
    decode_watch_change, JsonProtoSerializer, OnlineState, RemoteEffect, RemoteStore, StreamHandle, StreamKind,
    StreamingDatastore, StreamingFuture, TimerId, TokenProviderArc,
};
use crate::platform::runtime;

/// Where one-shot reads are served from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// Server results when reachable, cached results when offline.
    #[default]
    Default,
    Cache,
    Server,
}

struct OpenStream {
    generation: u64,
    handle: Arc<dyn StreamHandle>,
}

struct ClientState<P: Persistence> {
    sync_engine: SyncEngine<P>,
    remote_store: RemoteStore,
    event_manager: EventManager,
    streams: HashMap<StreamKind, OpenStream>,
    /// Generation of the pending run of each timer; a sleeper whose generation no longer
    /// matches was cancelled or superseded.
    timers: HashMap<TimerId, u64>,
    next_timer_generation: u64,
    /// Set once the client is terminated or hit a fatal error.
    terminal_error: Option<FirestoreError>,
}

impl<P: Persistence> ClientState<P> {
    fn ensure_active(&self) -> FirestoreResult<()> {
        match &self.terminal_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Snapshots(snapshots) => self.event_manager.on_view_snapshots(snapshots),
            SyncEvent::QueryError { query, error } => self.event_manager.on_query_error(&query, error),
            SyncEvent::OnlineStateChanged(online_state) => self.event_manager.on_online_state_change(online_state),
        }
    }

    fn apply_remote_request(&mut self, request: RemoteRequest) -> FirestoreResult<()> {
        match request {
            RemoteRequest::Listen(target_data) => {
                self.remote_store.listen(&mut self.sync_engine, target_data);
                Ok(())
            }
            RemoteRequest::Unlisten(target_id) => {
                self.remote_store.unlisten(&mut self.sync_engine, target_id);
                Ok(())
            }
            RemoteRequest::FillWritePipeline => self.remote_store.fill_write_pipeline(&mut self.sync_engine),
        }
    }
}

struct ClientInner<P: Persistence> {
    state: Mutex<ClientState<P>>,
    datastore: Arc<dyn StreamingDatastore>,
    token_provider: TokenProviderArc,
    serializer: JsonProtoSerializer,
    settings: SyncSettings,
}

impl<P: Persistence + Send + 'static> ClientInner<P> {
    /// Runs queued sync engine requests and remote effects until both queues are empty.
    async fn drive(self: &Arc<Self>, state: &mut ClientState<P>) {
        loop {
            for event in state.sync_engine.take_events() {
                state.dispatch(event);
            }

            let requests = state.sync_engine.take_remote_requests();
            if !requests.is_empty() {
                for request in requests {
                    let result = state.apply_remote_request(request);
                    self.check(state, result);
                }
                continue;
            }

            let effects = state.remote_store.take_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                self.execute_effect(state, effect).await;
            }
        }
    }

    /// Fails the client on unrecoverable errors; other errors only abort the current operation.
    fn check(&self, state: &mut ClientState<P>, result: FirestoreResult<()>) {
        if let Err(error) = result {
            if is_unrecoverable(&error) {
                self.fail(state, error);
            } else {
                log::warn!("Sync operation failed: {error}");
            }
        }
    }

    async fn finish<T>(self: &Arc<Self>, state: &mut ClientState<P>, result: FirestoreResult<T>) -> FirestoreResult<T> {
        if let Err(error) = &result {
            if is_unrecoverable(error) {
                self.fail(state, error.clone());
            }
        }
        self.drive(state).await;
        result
    }

    fn fail(&self, state: &mut ClientState<P>, error: FirestoreError) {
        if state.terminal_error.is_some() {
            return;
        }
        log::error!("Unrecoverable sync failure, shutting the client down: {error}");
        state.terminal_error = Some(error.clone());
        state.remote_store.shutdown(&mut state.sync_engine);
        state.sync_engine.fail_pending_writes(&error);
        state.sync_engine.take_events();
        state.sync_engine.take_remote_requests();
        state.event_manager.fail_all(&error);
        state.timers.clear();
    }

    async fn execute_effect(self: &Arc<Self>, state: &mut ClientState<P>, effect: RemoteEffect) {
        match effect {
            RemoteEffect::OpenStream { kind, generation } => {
                if state.terminal_error.is_some() {
                    return;
                }
                let opened = match self.token_provider.get_token().await {
                    Ok(token) => self.datastore.open_stream(kind, token).await,
                    Err(error) => Err(error),
                };
                match opened {
                    Ok(handle) => {
                        let replaced = state.streams.insert(
                            kind,
                            OpenStream {
                                generation,
                                handle: Arc::clone(&handle),
                            },
                        );
                        if let Some(previous) = replaced {
                            let _ = previous.handle.close().await;
                        }
                        runtime::spawn_detached(reader_task(Arc::downgrade(self), kind, generation, handle));
                        state
                            .remote_store
                            .handle_stream_open(&mut state.sync_engine, kind, generation);
                    }
                    Err(error) => {
                        log::debug!("Opening {kind:?} stream failed: {error}");
                        let result = state.remote_store.handle_stream_closed(
                            &mut state.sync_engine,
                            kind,
                            generation,
                            Some(error),
                        );
                        self.check(state, result);
                    }
                }
            }
            RemoteEffect::CloseStream { kind } => {
                if let Some(stream) = state.streams.remove(&kind) {
                    if let Err(error) = stream.handle.close().await {
                        log::debug!("Closing {kind:?} stream {} failed: {error}", stream.generation);
                    }
                }
            }
            RemoteEffect::SendListen(request) => {
                let payload = self.serializer.encode_listen_request(&request);
                self.send(state, StreamKind::Listen, &payload).await;
            }
            RemoteEffect::SendWrite(request) => {
                let payload = self.serializer.encode_write_request(&request);
                self.send(state, StreamKind::Write, &payload).await;
            }
            RemoteEffect::ScheduleTimer { timer, delay } => self.schedule_timer(state, timer, delay),
            RemoteEffect::CancelTimer(timer) => {
                state.timers.remove(&timer);
            }
            RemoteEffect::InvalidateCredentials => self.token_provider.invalidate_token(),
        }
    }

    async fn send(&self, state: &mut ClientState<P>, kind: StreamKind, payload: &JsonValue) {
        let Some(stream) = state.streams.get(&kind) else {
            log::debug!("Dropping {kind:?} message, no stream is open");
            return;
        };
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::error!("Failed to encode {kind:?} message: {error}");
                return;
            }
        };
        // A failed send surfaces as a close on the reader side.
        if let Err(error) = stream.handle.send(bytes).await {
            log::debug!("Sending on {kind:?} stream failed: {error}");
        }
    }

    fn schedule_timer(self: &Arc<Self>, state: &mut ClientState<P>, timer: TimerId, delay: Duration) {
        state.next_timer_generation += 1;
        let generation = state.next_timer_generation;
        state.timers.insert(timer, generation);
        runtime::spawn_detached(timer_task(Arc::downgrade(self), timer, generation, delay));
    }

    /// Runs `timer` if it is still pending. `generation` is `None` when run early on request.
    async fn fire_timer(self: &Arc<Self>, timer: TimerId, generation: Option<u64>) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match (state.timers.get(&timer), generation) {
            (Some(pending), Some(generation)) if *pending == generation => {}
            (Some(_), None) => {}
            _ => return false,
        }
        state.timers.remove(&timer);
        if state.terminal_error.is_some() {
            return false;
        }

        let result = match timer {
            TimerId::LruGarbageCollection => {
                let collected = state.sync_engine.collect_garbage();
                self.schedule_timer(state, TimerId::LruGarbageCollection, self.settings.gc_regular_delay);
                collected.map(|results| {
                    log::debug!(
                        "Garbage collection removed {} targets and {} documents",
                        results.targets_removed,
                        results.documents_removed
                    );
                })
            }
            other => state.remote_store.handle_timer(&mut state.sync_engine, other),
        };
        self.check(state, result);
        self.drive(state).await;
        true
    }

    /// Handles one inbound stream event; returns true once the stream is finished.
    async fn on_stream_event(
        self: &Arc<Self>,
        kind: StreamKind,
        generation: u64,
        event: Option<FirestoreResult<Vec<u8>>>,
    ) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.terminal_error.is_some() {
            return true;
        }
        let (result, finished) = match event {
            Some(Ok(payload)) => self.handle_payload(state, kind, generation, &payload),
            Some(Err(error)) => (
                state
                    .remote_store
                    .handle_stream_closed(&mut state.sync_engine, kind, generation, Some(error)),
                true,
            ),
            None => (
                state
                    .remote_store
                    .handle_stream_closed(&mut state.sync_engine, kind, generation, None),
                true,
            ),
        };
        self.check(state, result);
        self.drive(state).await;
        finished
    }

    fn handle_payload(
        &self,
        state: &mut ClientState<P>,
        kind: StreamKind,
        generation: u64,
        payload: &[u8],
    ) -> (FirestoreResult<()>, bool) {
        let decoded = serde_json::from_slice::<JsonValue>(payload)
            .map_err(|error| internal_error(format!("Malformed {kind:?} stream message: {error}")))
            .and_then(|value| match self.serializer.decode_stream_error(&value) {
                Some(error) => Ok(Err(error)),
                None => Ok(Ok(value)),
            });

        let value = match decoded {
            Ok(Ok(value)) => value,
            Ok(Err(status)) | Err(status) => {
                let result =
                    state
                        .remote_store
                        .handle_stream_closed(&mut state.sync_engine, kind, generation, Some(status));
                return (result, true);
            }
        };

        let result = match kind {
            StreamKind::Listen => match decode_watch_change(&self.serializer, &value) {
                Ok(Some(change)) => state
                    .remote_store
                    .handle_watch_change(&mut state.sync_engine, generation, change),
                Ok(None) => {
                    log::debug!("Ignoring unrecognized listen message");
                    Ok(())
                }
                Err(error) => Err(error),
            },
            StreamKind::Write => self
                .serializer
                .decode_write_response(&value)
                .and_then(|response| {
                    state
                        .remote_store
                        .handle_write_response(&mut state.sync_engine, generation, response)
                }),
        };
        (result, false)
    }
}

/// Persistence faults and broken internal invariants leave remote, sync and local state
/// out of step; the client cannot continue after either.
fn is_unrecoverable(error: &FirestoreError) -> bool {
    error.is_fatal() || error.code == FirestoreErrorCode::Internal
}

fn reader_task<P: Persistence + Send + 'static>(
    client: Weak<ClientInner<P>>,
    kind: StreamKind,
    generation: u64,
    handle: Arc<dyn StreamHandle>,
) -> StreamingFuture<'static, ()> {
    box_stream_future(async move {
        loop {
            let event = handle.next().await;
            let Some(inner) = client.upgrade() else {
                return;
            };
            if inner.on_stream_event(kind, generation, event).await {
                return;
            }
        }
    })
}

fn timer_task<P: Persistence + Send + 'static>(
    client: Weak<ClientInner<P>>,
    timer: TimerId,
    generation: u64,
    delay: Duration,
) -> StreamingFuture<'static, ()> {
    box_stream_future(async move {
        runtime::sleep(delay).await;
        if let Some(inner) = client.upgrade() {
            inner.fire_timer(timer, Some(generation)).await;
        }
    })
}

/// Client facade over the local cache and the sync machinery.
///
/// Every operation serialises on one internal lock; observers run while it is held and must
/// not block.
pub struct FirestoreClient<P: Persistence + Send + 'static = MemoryPersistence> {
    inner: Arc<ClientInner<P>>,
}

impl<P: Persistence + Send + 'static> Clone for FirestoreClient<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Persistence + Send + 'static> FirestoreClient<P> {
    /// Starts the local store and connects both streams through `datastore`.
    pub async fn new(
        persistence: P,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        settings: SyncSettings,
    ) -> FirestoreResult<Self> {
        let mut local_store = LocalStore::new(persistence, settings.query_engine.clone(), settings.lru.clone());
        local_store.start()?;
        let state = ClientState {
            sync_engine: SyncEngine::new(local_store, settings.max_concurrent_limbo_resolutions),
            remote_store: RemoteStore::new(&settings),
            event_manager: EventManager::new(),
            streams: HashMap::new(),
            timers: HashMap::new(),
            next_timer_generation: 0,
            terminal_error: None,
        };
        let inner = Arc::new(ClientInner {
            state: Mutex::new(state),
            datastore,
            token_provider,
            serializer: JsonProtoSerializer::new(settings.database_id.clone()),
            settings,
        });

        {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;
            let result = state.remote_store.start(&mut state.sync_engine);
            if inner.settings.lru.cache_size_collection_threshold != LruParams::COLLECTION_DISABLED {
                inner.schedule_timer(state, TimerId::LruGarbageCollection, inner.settings.gc_initial_delay);
            }
            inner.finish(state, result).await?;
        }
        log::debug!("Firestore client started for {:?}", inner.settings.database_id);
        Ok(Self { inner })
    }

    /// Registers `observer` for snapshots of `query` until the registration is removed.
    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration<P>>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let observer: SnapshotObserver = Arc::new(observer);
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        state.ensure_active()?;

        let initial = if state.event_manager.needs_target(&query) {
            let result = state.sync_engine.listen(&query);
            Some(self.inner.finish(state, result).await?)
        } else {
            None
        };
        let listener_id = state
            .event_manager
            .add_listener(QueryListener::new(query, options, observer), initial);
        self.inner.drive(state).await;
        Ok(ListenerRegistration {
            client: Arc::downgrade(&self.inner),
            listener_id,
        })
    }

    /// Applies `mutations` as one atomic batch and waits for the backend to accept it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        if mutations.is_empty() {
            return self.inner.state.lock().await.ensure_active();
        }
        let receiver = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.ensure_active()?;
            let result = state.sync_engine.write(mutations);
            self.inner.finish(state, result).await?
        };
        receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client was terminated before the write completed")))
    }

    /// Waits until every write issued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let receiver = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.ensure_active()?;
            if state.remote_store.online_state() == OnlineState::Offline {
                log::debug!("Waiting for pending writes while offline; resolves once writes reach the backend");
            }
            let result = state.sync_engine.register_pending_writes_callback();
            self.inner.finish(state, result).await?
        };
        receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client was terminated with writes pending")))
    }

    pub async fn get_once(&self, query: Query, source: Source) -> FirestoreResult<ViewSnapshot> {
        if source == Source::Cache {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.ensure_active()?;
            let result = state.sync_engine.execute_query_from_cache(&query);
            return self.inner.finish(state, result).await;
        }

        let snapshot = self.snapshot_via_listener(query).await?;
        if snapshot.from_cache && source == Source::Server {
            return Err(unavailable(
                "Failed to get documents from server. The documents may exist in the local cache; \
                 read again without the server source to retrieve them.",
            ));
        }
        Ok(snapshot)
    }

    /// Reads one document. `Ok(None)` means the document is known not to exist.
    pub async fn get_document(&self, key: &DocumentKey, source: Source) -> FirestoreResult<Option<Document>> {
        if source == Source::Cache {
            let document = {
                let mut guard = self.inner.state.lock().await;
                let state = &mut *guard;
                state.ensure_active()?;
                let result = state.sync_engine.get_document_from_cache(key);
                self.inner.finish(state, result).await?
            };
            return if document.is_found_document() {
                Ok(Some(document))
            } else if document.is_no_document() {
                Ok(None)
            } else {
                Err(unavailable(
                    "Failed to get document from cache. The document may exist on the server; \
                     read again without the cache source to fetch it.",
                ))
            };
        }

        let snapshot = self.snapshot_via_listener(Query::for_document(key)).await?;
        let document = snapshot.docs.get(key).cloned();
        match (document, snapshot.from_cache) {
            (None, true) => Err(unavailable("Failed to get document because the client is offline.")),
            (Some(_), true) if source == Source::Server => Err(unavailable(
                "Failed to get document from server. The document may exist in the local cache; \
                 read again without the server source to retrieve it.",
            )),
            (document, _) => Ok(document),
        }
    }

    /// First snapshot a temporary listener raises, waiting for sync while online.
    async fn snapshot_via_listener(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(StdMutex::new(Some(sender)));
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
        };
        let registration = self
            .listen(query, options, move |result| {
                let Ok(mut slot) = sender.lock() else {
                    return;
                };
                if let Some(sender) = slot.take() {
                    let _ = sender.send(result);
                }
            })
            .await?;
        let outcome = receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client was terminated before the read completed")));
        registration.remove().await;
        outcome
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        state.ensure_active()?;
        let result = state.remote_store.enable_network(&mut state.sync_engine);
        self.inner.finish(state, result).await
    }

    /// Closes both streams; listeners see cached results until the network is re-enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        state.ensure_active()?;
        state.remote_store.disable_network(&mut state.sync_engine);
        self.inner.drive(state).await;
        Ok(())
    }

    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        state.ensure_active()?;
        let result = state.sync_engine.collect_garbage();
        self.inner.finish(state, result).await
    }

    /// Runs a scheduled timer right away. Returns false if none was pending.
    pub async fn run_delayed_operation(&self, timer: TimerId) -> bool {
        self.inner.fire_timer(timer, None).await
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.remote_store.online_state()
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.state.lock().await.terminal_error.is_some()
    }

    /// Stops the network and the local store. Pending writes fail; later calls are refused.
    pub async fn terminate(&self) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.terminal_error.is_some() {
            return;
        }
        log::debug!("Terminating Firestore client");
        state.remote_store.shutdown(&mut state.sync_engine);
        state.sync_engine.shutdown();
        state.terminal_error = Some(failed_precondition("The client has already been terminated."));
        state.timers.clear();
        state.event_manager.clear();
        self.inner.drive(state).await;
    }
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration<P: Persistence + Send + 'static = MemoryPersistence> {
    client: Weak<ClientInner<P>>,
    listener_id: ListenerId,
}

impl<P: Persistence + Send + 'static> ListenerRegistration<P> {
    /// Stops the listener. Its target is released once no other listener shares the query.
    pub async fn remove(self) {
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        let Some(query) = state.event_manager.remove_listener(self.listener_id) else {
            return;
        };
        if state.terminal_error.is_some() {
            return;
        }
        let result = state.sync_engine.unlisten(&query);
        if let Err(error) = inner.finish(state, result).await {
            log::warn!("Failed to stop listening to {}: {error}", query.canonical_id());
        }
    }
}
