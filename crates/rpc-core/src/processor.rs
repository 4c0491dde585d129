//! Processor Runtime (`spec.md` §4.9): owns the duplex stream, the four
//! priority queues, the scope tables, and the API descriptor set.
//! Grounded on the teacher's `JsonRpcTransport` (`mcp/jsonrpc.rs`) —
//! `spawn_*`/`writer_task`/`reader_task`/`Drop` — generalized from "child
//! process stdio, JSON-RPC only" to "abstract duplex stream, the full
//! Message enum".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{Codec, DynamicValue, WireType};
use crate::config::{PriorityConfig, ProcessorConfig};
use crate::dispatcher::{self, DispatchOutcome};
use crate::error::RpcError;
use crate::event_bus::EventBus;
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::message::{
    CancelBody, CloseBody, ErrorResponseBody, EventBody, Message, MessageBody, MessageKind,
    RemoteScopeDiscardedBody, RemoteScopeTriggerBody, RequestBody, ResponseBody,
    ScopeDiscardedBody, ScopeRegistrationBody, StreamChunkBody, StreamStartBody,
};
use crate::queue::PriorityQueue;
use crate::registry::MessageRegistry;
use crate::request_table::RequestTable;
use crate::scope::cancellation::CancellationToken;
use crate::scope::registry::ScopeRegistry;
use crate::scope::stream::{StreamConfig, StreamScope};
use crate::scope::{
    dispose_scope_value, scope_type, LocalScope, RemoteScope, ScopeState, ScopeTables, ScopeValue,
};
use crate::transport::DuplexStream;

/// Reserved api/method names for the heartbeat ping, handled directly in
/// the read loop rather than dispatched through the Calls queue
/// (`spec.md` §4.10 "the ping is itself a request with an id awaited via
/// the Request Table").
pub const PING_API: &str = "$heartbeat";
pub const PING_METHOD: &str = "ping";

/// `spec.md` §4.9 lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct OutgoingItem {
    message: Message,
    completion: oneshot::Sender<Result<(), RpcError>>,
}

struct CallItem {
    request_id: u64,
    body: RequestBody,
    cancel: CancellationToken,
}

fn message_priority(kind: MessageKind, priorities: &PriorityConfig) -> i32 {
    match kind {
        MessageKind::Request
        | MessageKind::Response
        | MessageKind::ErrorResponse
        | MessageKind::Cancel
        | MessageKind::Close => priorities.rpc,
        MessageKind::Event => priorities.event,
        MessageKind::StreamStart | MessageKind::StreamChunk => priorities.stream,
        MessageKind::ScopeDiscarded
        | MessageKind::RemoteScopeDiscarded
        | MessageKind::ScopeTrigger
        | MessageKind::RemoteScopeTrigger
        | MessageKind::ScopeError
        | MessageKind::ScopeEvent
        | MessageKind::RemoteScopeEvent
        | MessageKind::ScopeRegistration => priorities.scope,
    }
}

/// The per-peer runtime orchestrating all traffic over one duplex stream.
pub struct Processor {
    pub config: ProcessorConfig,
    pub codec: Codec,
    state: Mutex<ProcessorState>,
    request_table: Arc<RequestTable>,
    scopes: ScopeTables,
    scope_registry: Arc<ScopeRegistry>,
    events: EventBus,
    scope_events: Mutex<HashMap<u64, EventBus>>,
    streams: Mutex<HashMap<u64, Arc<StreamScope>>>,
    pending_scope_acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    heartbeat: Heartbeat,
    outgoing: PriorityQueue<OutgoingItem>,
    incoming: PriorityQueue<Message>,
    calls: PriorityQueue<CallItem>,
    active_calls: Mutex<HashMap<u64, CancellationToken>>,
    shutdown_token: CancellationToken,
    writer: Mutex<Option<Box<dyn AsyncWrite + Unpin + Send>>>,
    reader: Mutex<Option<Box<dyn AsyncRead + Unpin + Send>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(
        stream: impl DuplexStream,
        config: ProcessorConfig,
        message_registry: Arc<MessageRegistry>,
        scope_registry: Arc<ScopeRegistry>,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = Codec::new(message_registry, config.max_message_length);
        let heartbeat = Heartbeat::new(config.keep_alive.timeout, config.keep_alive.peer_timeout);
        Arc::new(Self {
            outgoing: PriorityQueue::new(config.outgoing_message_queue.capacity),
            incoming: PriorityQueue::new(config.incoming_message_queue.capacity),
            calls: PriorityQueue::new(config.call_queue.capacity),
            request_table: RequestTable::new(config.request_queue.capacity),
            scopes: ScopeTables::new(config.request_queue.capacity.max(64)),
            scope_registry,
            events: EventBus::new(),
            scope_events: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            pending_scope_acks: Mutex::new(HashMap::new()),
            heartbeat,
            active_calls: Mutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
            writer: Mutex::new(Some(Box::new(write_half))),
            reader: Mutex::new(Some(Box::new(read_half))),
            tasks: Mutex::new(Vec::new()),
            state: Mutex::new(ProcessorState::Idle),
            config,
            codec,
        })
    }

    /// Boots the read loop, the queue worker pools, and the heartbeat
    /// timer (`spec.md` §4.9 "Boot").
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if *state != ProcessorState::Idle {
                return;
            }
            *state = ProcessorState::Starting;
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(writer_loop(self.clone())));
        tasks.push(tokio::spawn(reader_loop(self.clone())));
        for _ in 0..self.config.incoming_message_queue.threads.max(1) {
            tasks.push(tokio::spawn(incoming_worker(self.clone())));
        }
        for _ in 0..self.config.call_queue.threads.max(1) {
            tasks.push(tokio::spawn(call_worker(self.clone())));
        }
        tasks.push(tokio::spawn(heartbeat_loop(self.clone())));
        *self.tasks.lock().await = tasks;

        *self.state.lock().await = ProcessorState::Running;
    }

    pub async fn state(&self) -> ProcessorState {
        *self.state.lock().await
    }

    /// Enqueues `message` and waits for the write to land on the wire
    /// (`spec.md` §4.2 "a completion signal that fires when the bytes are
    /// on the wire").
    async fn send(&self, message: Message) -> Result<(), RpcError> {
        let priority = message_priority(message.kind(), &self.config.priorities);
        let (tx, rx) = oneshot::channel();
        self.outgoing
            .push(OutgoingItem { message, completion: tx }, priority, None)
            .await?;
        rx.await.map_err(|_| RpcError::ChannelClosed)?
    }

    /// Enqueues `message` without waiting for delivery, dropping it
    /// silently if the queue is already full (used for `inform_*`
    /// announcements during shutdown, which are best-effort per
    /// `spec.md` §4.5).
    async fn send_best_effort(&self, message: Message) {
        let priority = message_priority(message.kind(), &self.config.priorities);
        let (tx, _rx) = oneshot::channel();
        let _ = self
            .outgoing
            .try_push(OutgoingItem { message, completion: tx }, priority)
            .await;
    }

    async fn call_raw(
        &self,
        api: &str,
        method: &str,
        params: Vec<DynamicValue>,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<Option<DynamicValue>, RpcError> {
        let id = self.request_table.next_id();
        let rx = self.request_table.register(id).await?;
        let request = Message::new(
            self.config.rpc_version,
            MessageBody::Request(RequestBody {
                api: api.to_string(),
                method: method.to_string(),
                params,
            }),
        )
        .with_id(id);
        self.send(request).await?;

        let awaited = async {
            match cancel {
                Some(token) => {
                    tokio::select! {
                        outcome = rx => outcome.unwrap_or(Err(RpcError::ChannelClosed)),
                        _ = token.cancelled() => {
                            self.request_table.remove(id).await;
                            self.send_best_effort(Message::new(
                                self.config.rpc_version,
                                MessageBody::Cancel(CancelBody { target_request_id: id }),
                            ))
                            .await;
                            Err(RpcError::Cancelled)
                        }
                    }
                }
                None => rx.await.unwrap_or(Err(RpcError::ChannelClosed)),
            }
        };

        let outcome = match timeout {
            Some(duration) => match tokio::time::timeout(duration, awaited).await {
                Ok(result) => result?,
                Err(_) => {
                    self.request_table.remove(id).await;
                    return Err(RpcError::Timeout(duration));
                }
            },
            None => awaited.await?,
        };

        match outcome {
            MessageBody::Response(resp) => Ok(resp.value),
            other => Err(RpcError::TypeMismatch {
                expected: "Response".into(),
                actual: format!("{:?}", other.kind()),
            }),
        }
    }

    pub async fn call_value<T: WireType>(
        &self,
        api: &str,
        method: &str,
        params: Vec<DynamicValue>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, RpcError> {
        let value = self.call_raw(api, method, params, cancel, None).await?;
        match value {
            Some(value) => value.decode(&self.codec),
            None => Err(RpcError::TypeMismatch {
                expected: T::type_name().to_string(),
                actual: "<no value>".into(),
            }),
        }
    }

    pub async fn call_void(
        &self,
        api: &str,
        method: &str,
        params: Vec<DynamicValue>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), RpcError> {
        self.call_raw(api, method, params, cancel, None).await?;
        Ok(())
    }

    /// `spec.md` §8 scenario 4: issues a ping request and waits up to
    /// `timeout` for the peer's Response.
    pub async fn ping(&self, timeout: Duration) -> Result<(), RpcError> {
        self.call_raw(PING_API, PING_METHOD, Vec::new(), None, Some(timeout))
            .await?;
        Ok(())
    }

    pub async fn register_event(
        &self,
        name: impl Into<String>,
        handler: crate::event_bus::EventHandler,
    ) -> Result<(), RpcError> {
        self.events.register(name, handler).await
    }

    pub async fn register_scope_event(
        &self,
        scope_id: u64,
        name: impl Into<String>,
        handler: crate::event_bus::EventHandler,
    ) -> Result<(), RpcError> {
        let mut buses = self.scope_events.lock().await;
        let bus = buses.entry(scope_id).or_insert_with(EventBus::new);
        bus.register(name, handler).await
    }

    /// `spec.md` §4.7: processor-scoped event, optionally awaiting the
    /// peer's handlers to complete.
    pub async fn raise_event(
        &self,
        name: &str,
        args: Option<DynamicValue>,
        waiting: bool,
    ) -> Result<(), RpcError> {
        if !waiting {
            let message = Message::new(
                self.config.rpc_version,
                MessageBody::Event(EventBody {
                    name: name.to_string(),
                    args,
                    waiting: false,
                }),
            );
            return self.send(message).await;
        }

        let id = self.request_table.next_id();
        let rx = self.request_table.register(id).await?;
        let message = Message::new(
            self.config.rpc_version,
            MessageBody::Event(EventBody {
                name: name.to_string(),
                args,
                waiting: true,
            }),
        )
        .with_id(id);
        self.send(message).await?;
        rx.await.map_err(|_| RpcError::ChannelClosed)??;
        Ok(())
    }

    pub async fn get_scope(&self, id: u64) -> Option<Arc<dyn ScopeValue>> {
        self.scopes.local_by_id(id).await
    }

    pub async fn get_remote_scope(&self, id: u64) -> Option<Arc<dyn ScopeValue>> {
        self.scopes.remote_by_id(id).await
    }

    /// Looks up a stream scope materialized from an inbound `StreamStart`
    /// (`spec.md` §4.11); `None` once the stream has delivered its final
    /// chunk and been removed, or if no such stream was ever opened.
    pub async fn get_inbound_stream(&self, stream_id: u64) -> Option<Arc<StreamScope>> {
        self.streams.lock().await.get(&stream_id).cloned()
    }

    /// `spec.md` §8 "∀ stored scopes with a key: lookup_by_id(s.id) == s ∧
    /// lookup_by_key(s.key) == s" — the master-side half of that property.
    pub async fn local_scope_id_by_key(&self, key: &str) -> Option<u64> {
        self.scopes.local_id_by_key(key).await
    }

    /// The consumer-side half of the same property.
    pub async fn remote_scope_id_by_key(&self, key: &str) -> Option<u64> {
        self.scopes.remote_id_by_key(key).await
    }

    /// Creates and registers a cancellation scope (`spec.md` §4.6): sends
    /// `ScopeRegistration` to the peer and waits for its `RemoteScopeTrigger`
    /// acknowledgement before returning. Once the supplied `token` fires,
    /// the scope is discarded and (if the peer had acknowledged) a
    /// `ScopeDiscarded` is sent.
    pub async fn create_cancellation_scope(
        self: &Arc<Self>,
        key: Option<String>,
        token: CancellationToken,
    ) -> Result<u64, RpcError> {
        let id = self.scopes.next_scope_id();
        let local = LocalScope {
            id,
            key: key.clone(),
            scope_type: scope_type::CANCELLATION,
            value: Arc::new(token.clone()) as Arc<dyn ScopeValue>,
            dispose_value: false,
            dispose_value_on_error: false,
            inform_consumer_when_disposing: true,
            replace_existing_scope: true,
            state: ScopeState::Creating,
            is_stored: true,
            is_error: false,
            last_exception: None,
        };
        self.dispose_displaced_local(self.scopes.insert_local(local).await?)
            .await;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_scope_acks.lock().await.insert(id, ack_tx);

        let registration = MessageBody::ScopeRegistration(ScopeRegistrationBody {
            scope_id: id,
            key,
            replace_existing_scope: true,
            scope_type: scope_type::CANCELLATION,
            is_stored: true,
            dispose_scope_value: false,
            dispose_scope_value_on_error: false,
            inform_master_when_disposing: true,
            extensions: None,
        });
        self.send(Message::new(self.config.rpc_version, registration))
            .await?;
        ack_rx.await.map_err(|_| RpcError::ChannelClosed)?;

        let processor = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            processor.discard_local_scope(id).await;
        });

        Ok(id)
    }

    async fn discard_local_scope(self: &Arc<Self>, id: u64) {
        if let Some(scope) = self.scopes.discard_local(id).await {
            if scope.should_dispose() {
                dispose_scope_value(&scope.value).await;
            }
            if scope.inform_consumer_when_disposing {
                self.send_best_effort(Message::new(
                    self.config.rpc_version,
                    MessageBody::ScopeDiscarded(ScopeDiscardedBody { scope_id: id }),
                ))
                .await;
            }
        }
    }

    /// Disposes and, if warranted, announces a local scope that
    /// `insert_local` displaced by replacing a keyed entry (`spec.md` §4.5
    /// "the old entry is discarded and disposed").
    async fn dispose_displaced_local(self: &Arc<Self>, displaced: Option<LocalScope>) {
        let Some(scope) = displaced else { return };
        if scope.should_dispose() {
            dispose_scope_value(&scope.value).await;
        }
        if scope.inform_consumer_when_disposing {
            self.send_best_effort(Message::new(
                self.config.rpc_version,
                MessageBody::ScopeDiscarded(ScopeDiscardedBody { scope_id: scope.id }),
            ))
            .await;
        }
    }

    /// Removes and disposes a consumer-side scope mirror, informing the
    /// master if `inform_master_when_disposing` is set (`spec.md` §4.5,
    /// the consumer half of the disposal policy).
    pub(crate) async fn discard_remote_scope(self: &Arc<Self>, id: u64) {
        if let Some(remote) = self.scopes.discard_remote(id).await {
            if let Some(token) = remote.materialized.as_any().downcast_ref::<CancellationToken>() {
                token.cancel();
            }
            if remote.should_dispose() {
                dispose_scope_value(&remote.materialized).await;
            }
            if remote.inform_master_when_disposing {
                self.send_best_effort(Message::new(
                    self.config.rpc_version,
                    MessageBody::RemoteScopeDiscarded(RemoteScopeDiscardedBody { scope_id: id }),
                ))
                .await;
            }
        }
    }

    /// Originates a stream scope (`spec.md` §4.11): registers a `LocalScope`
    /// backing the returned handle, sends `StreamStart`, and spawns the
    /// outbound pump that sends `StreamChunk`s one at a time, only
    /// dispatching the next chunk once the previous one's `Response` has
    /// arrived via the Request Table — the same correlation an ordinary
    /// call uses.
    pub async fn open_stream_scope(
        self: &Arc<Self>,
        key: Option<String>,
        config: StreamConfig,
    ) -> Result<Arc<StreamScope>, RpcError> {
        let id = self.scopes.next_scope_id();
        let scope = Arc::new(StreamScope::new(id, config));
        let local = LocalScope {
            id,
            key: key.clone(),
            scope_type: scope_type::STREAM,
            value: scope.clone() as Arc<dyn ScopeValue>,
            dispose_value: true,
            dispose_value_on_error: true,
            inform_consumer_when_disposing: true,
            replace_existing_scope: true,
            state: ScopeState::Creating,
            is_stored: true,
            is_error: false,
            last_exception: None,
        };
        self.dispose_displaced_local(self.scopes.insert_local(local).await?)
            .await;

        self.send(Message::new(
            self.config.rpc_version,
            MessageBody::StreamStart(StreamStartBody {
                stream_id: id,
                chunk_size: scope.config.chunk_size,
                max_length: scope.config.max_length,
                compression: scope.config.compression.clone(),
            }),
        ))
        .await?;

        let pump = self.clone();
        let pump_scope = scope.clone();
        tokio::spawn(async move {
            pump.pump_stream_outbound(id, pump_scope).await;
        });

        Ok(scope)
    }

    /// Drains `scope`'s outbound chunks onto the wire, one in flight at a
    /// time, stopping on the final chunk, a rejected chunk (e.g.
    /// `max_length` exceeded), or a failed send, and always discarding the
    /// scope when it stops (`spec.md` §4.11).
    async fn pump_stream_outbound(self: Arc<Self>, stream_id: u64, scope: Arc<StreamScope>) {
        loop {
            let chunk = match scope.next_outbound_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(stream_id, error = %err, "stream outbound chunk rejected");
                    break;
                }
            };
            let (data, is_last) = chunk;

            let request_id = self.request_table.next_id();
            let rx = match self.request_table.register(request_id).await {
                Ok(rx) => rx,
                Err(err) => {
                    tracing::warn!(stream_id, error = %err, "could not register stream chunk ack");
                    break;
                }
            };
            let message = Message::new(
                self.config.rpc_version,
                MessageBody::StreamChunk(StreamChunkBody {
                    stream_id,
                    data: data.to_vec(),
                    is_last,
                }),
            )
            .with_id(request_id);
            if self.send(message).await.is_err() {
                self.request_table.remove(request_id).await;
                break;
            }
            if rx.await.unwrap_or(Err(RpcError::ChannelClosed)).is_err() {
                break;
            }
            if is_last {
                break;
            }
        }
        self.discard_local_scope(stream_id).await;
    }

    /// `spec.md` §4.9 "close": stops accepting new work, announces a
    /// `Close`, completes all pending requests with `SessionClosed`,
    /// discards every scope, then releases the transport. Idempotent.
    pub async fn close(self: &Arc<Self>, code: i32, info: Option<String>) -> Result<(), RpcError> {
        self.begin_shutdown(code, info).await;
        Ok(())
    }

    async fn begin_shutdown(self: &Arc<Self>, code: i32, info: Option<String>) {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, ProcessorState::Stopping | ProcessorState::Stopped) {
                return;
            }
            *state = ProcessorState::Stopping;
        }
        self.shutdown_token.cancel();

        self.send_best_effort(Message::new(
            self.config.rpc_version,
            MessageBody::Close(CloseBody { code, info }),
        ))
        .await;

        self.request_table.shutdown().await;

        let (locals, remotes) = self.scopes.drain_all().await;
        for scope in locals {
            if scope.should_dispose() {
                dispose_scope_value(&scope.value).await;
            }
            if scope.inform_consumer_when_disposing {
                self.send_best_effort(Message::new(
                    self.config.rpc_version,
                    MessageBody::ScopeDiscarded(ScopeDiscardedBody { scope_id: scope.id }),
                ))
                .await;
            }
        }
        for scope in remotes {
            if scope.should_dispose() {
                dispose_scope_value(&scope.materialized).await;
            }
            if scope.inform_master_when_disposing {
                self.send_best_effort(Message::new(
                    self.config.rpc_version,
                    MessageBody::RemoteScopeDiscarded(RemoteScopeDiscardedBody { scope_id: scope.id }),
                ))
                .await;
            }
        }

        *self.state.lock().await = ProcessorState::Stopped;
        *self.writer.lock().await = None;
        *self.reader.lock().await = None;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Routes one decoded message to the right subsystem (`spec.md` §4.9
    /// "Read loop").
    async fn route(self: &Arc<Self>, message: Message) {
        let id = message.id;
        match message.body {
            MessageBody::Response(resp) => {
                if let Some(id) = id {
                    self.request_table
                        .complete(id, Ok(MessageBody::Response(resp)))
                        .await;
                }
            }
            MessageBody::ErrorResponse(err) => {
                if let Some(id) = id {
                    self.request_table
                        .complete(
                            id,
                            Err(RpcError::Remote {
                                remote_type: err.remote_type,
                                message: err.message,
                            }),
                        )
                        .await;
                }
            }
            MessageBody::Cancel(body) => {
                let calls = self.active_calls.lock().await;
                if let Some(token) = calls.get(&body.target_request_id) {
                    token.cancel();
                }
            }
            MessageBody::Request(body) => {
                let Some(id) = id else { return };
                if body.api == PING_API && body.method == PING_METHOD {
                    self.send_best_effort(
                        Message::new(self.config.rpc_version, MessageBody::Response(ResponseBody { value: None }))
                            .with_id(id),
                    )
                    .await;
                    return;
                }
                let cancel = self.shutdown_token.child_token();
                self.active_calls.lock().await.insert(id, cancel.clone());
                let priority = self.config.priorities.rpc;
                let _ = self
                    .calls
                    .push(CallItem { request_id: id, body, cancel }, priority, None)
                    .await;
            }
            MessageBody::Event(body) => {
                let processor = self.clone();
                if body.waiting {
                    let result = processor.events.dispatch(&body.name, body.args).await;
                    if let Some(id) = id {
                        let response = match result {
                            Ok(()) => MessageBody::Response(ResponseBody { value: None }),
                            Err(err) => MessageBody::ErrorResponse(ErrorResponseBody {
                                remote_type: "EventHandler".into(),
                                message: err.to_string(),
                            }),
                        };
                        self.send_best_effort(Message::new(self.config.rpc_version, response).with_id(id))
                            .await;
                    }
                } else {
                    tokio::spawn(async move {
                        let _ = processor.events.dispatch(&body.name, body.args).await;
                    });
                }
            }
            MessageBody::ScopeEvent(body) => {
                let result = {
                    let buses = self.scope_events.lock().await;
                    match buses.get(&body.scope_id) {
                        Some(bus) => Some(bus.dispatch(&body.name, body.args.clone()).await),
                        None => {
                            tracing::debug!(scope_id = body.scope_id, name = %body.name, "no handler for scope event");
                            None
                        }
                    }
                };
                if let (true, Some(id), Some(result)) = (body.waiting, id, result) {
                    let response = match result {
                        Ok(()) => MessageBody::Response(ResponseBody { value: None }),
                        Err(err) => MessageBody::ErrorResponse(ErrorResponseBody {
                            remote_type: "EventHandler".into(),
                            message: err.to_string(),
                        }),
                    };
                    self.send_best_effort(Message::new(self.config.rpc_version, response).with_id(id))
                        .await;
                }
            }
            MessageBody::RemoteScopeEvent(_) => {
                // Master-side handling of a consumer-raised scope event
                // mirrors `ScopeEvent` above; omitted here since the
                // runtime's bundled scope types (cancellation, stream)
                // never raise scope-scoped events themselves.
            }
            MessageBody::ScopeRegistration(body) => {
                self.handle_scope_registration(body).await;
            }
            MessageBody::ScopeDiscarded(body) => {
                self.discard_remote_scope(body.scope_id).await;
            }
            MessageBody::RemoteScopeDiscarded(body) => {
                if let Some(scope) = self.scopes.discard_local(body.scope_id).await {
                    if scope.should_dispose() {
                        dispose_scope_value(&scope.value).await;
                    }
                }
            }
            MessageBody::ScopeTrigger(_) => {
                // The bundled scope types never send a master→consumer
                // trigger requiring a response; an extension scope type
                // would match on `scope_id` here the same way
                // `RemoteScopeTrigger` does below.
            }
            MessageBody::RemoteScopeTrigger(body) => {
                self.scopes.mark_local_triggered(body.scope_id).await;
                if let Some(tx) = self.pending_scope_acks.lock().await.remove(&body.scope_id) {
                    let _ = tx.send(());
                }
            }
            MessageBody::ScopeError(body) => {
                tracing::warn!(scope_id = body.scope_id, remote_type = %body.remote_type, message = %body.message, "scope error from peer");
            }
            MessageBody::StreamStart(body) => {
                let scope = Arc::new(StreamScope::new(
                    body.stream_id,
                    crate::scope::stream::StreamConfig {
                        chunk_size: body.chunk_size,
                        max_length: body.max_length,
                        compression: body.compression,
                    },
                ));
                self.streams.lock().await.insert(body.stream_id, scope);
            }
            MessageBody::StreamChunk(body) => {
                let scope = self.streams.lock().await.get(&body.stream_id).cloned();
                if let Some(scope) = scope {
                    scope
                        .deliver_inbound_chunk(bytes::Bytes::from(body.data), body.is_last)
                        .await;
                    if body.is_last {
                        self.streams.lock().await.remove(&body.stream_id);
                    }
                }
                if let Some(id) = id {
                    self.send_best_effort(
                        Message::new(self.config.rpc_version, MessageBody::Response(ResponseBody { value: None }))
                            .with_id(id),
                    )
                    .await;
                }
            }
            MessageBody::Close(body) => {
                tracing::info!(code = body.code, info = ?body.info, "peer requested close");
                self.begin_shutdown(body.code, body.info).await;
            }
        }
    }

    async fn handle_scope_registration(self: &Arc<Self>, body: ScopeRegistrationBody) {
        if self.config.disabled_scope_types.contains(&body.scope_type) {
            tracing::warn!(scope_type = body.scope_type, "rejecting disabled scope type");
            return;
        }
        let Some(descriptor) = self.scope_registry.get(body.scope_type) else {
            tracing::warn!(scope_type = body.scope_type, "no registered factory for scope type");
            return;
        };
        let Some(factory) = descriptor.create_remote_from_value.clone() else {
            tracing::warn!(scope_type = body.scope_type, "scope type has no remote factory");
            return;
        };
        let value = body
            .extensions
            .clone()
            .unwrap_or_else(|| DynamicValue::untyped_json(serde_json::Value::Null));
        match factory(&value) {
            Ok(materialized) => {
                let remote = RemoteScope {
                    id: body.scope_id,
                    key: body.key,
                    scope_type: body.scope_type,
                    scope_value: value,
                    materialized,
                    dispose_value: body.dispose_scope_value,
                    dispose_value_on_error: body.dispose_scope_value_on_error,
                    inform_master_when_disposing: body.inform_master_when_disposing,
                    state: ScopeState::Active,
                    is_error: false,
                };
                if self.scopes.insert_remote(remote).await.is_ok() {
                    self.send_best_effort(Message::new(
                        self.config.rpc_version,
                        MessageBody::RemoteScopeTrigger(RemoteScopeTriggerBody {
                            scope_id: body.scope_id,
                            response_id: None,
                            payload: None,
                        }),
                    ))
                    .await;
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to materialize remote scope"),
        }
    }
}

/// Registers the cancellation and stream scope types (`spec.md` §3 "Scope
/// types", type-ids 2 and 0) with `registry`. The registry is process-wide
/// and additive, so callers sharing one registry across several processors
/// call this once, before the first `Processor::start` (`spec.md` §6
/// "Process-wide state"). Each type is a no-op if already registered.
pub fn register_builtin_scope_types(registry: &ScopeRegistry) -> Result<(), RpcError> {
    if registry.get(scope_type::CANCELLATION).is_none() {
        registry.register(
            crate::scope::registry::ScopeTypeDescriptor::new(scope_type::CANCELLATION, "cancellation")
                .with_remote_factory(Arc::new(|_value: &DynamicValue| {
                    Ok(Arc::new(CancellationToken::new()) as Arc<dyn ScopeValue>)
                })),
        )?;
    }
    if registry.get(scope_type::STREAM).is_none() {
        registry.register(
            crate::scope::registry::ScopeTypeDescriptor::new(scope_type::STREAM, "stream")
                .with_remote_factory(Arc::new(|_value: &DynamicValue| {
                    Ok(Arc::new(StreamScope::new(0, StreamConfig::default())) as Arc<dyn ScopeValue>)
                })),
        )?;
    }
    Ok(())
}

async fn writer_loop(processor: Arc<Processor>) {
    loop {
        let item = processor.outgoing.pop().await;
        let mut writer_guard = processor.writer.lock().await;
        let Some(writer) = writer_guard.as_mut() else {
            let _ = item.completion.send(Err(RpcError::SessionClosed));
            break;
        };
        let result = processor.codec.write_message(writer, &item.message).await;
        if result.is_ok() && processor.config.flush_stream {
            let _ = writer.flush().await;
        }
        drop(writer_guard);
        if result.is_ok() {
            processor.heartbeat.record_sent().await;
        }
        let failed = result.is_err();
        let _ = item.completion.send(result);
        if failed {
            processor.begin_shutdown(-1, Some("transport write failed".into())).await;
            break;
        }
    }
}

async fn reader_loop(processor: Arc<Processor>) {
    loop {
        let mut reader_guard = processor.reader.lock().await;
        let Some(reader) = reader_guard.as_mut() else {
            break;
        };
        let result = processor.codec.read_message(reader).await;
        drop(reader_guard);
        match result {
            Ok(message) => {
                processor.heartbeat.record_received().await;
                let priority = message_priority(message.kind(), &processor.config.priorities);
                if processor.incoming.push(message, priority, None).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "transport read failed, closing session");
                processor.begin_shutdown(-1, Some(err.to_string())).await;
                break;
            }
        }
    }
}

async fn incoming_worker(processor: Arc<Processor>) {
    loop {
        let message = processor.incoming.pop().await;
        processor.route(message).await;
    }
}

async fn call_worker(processor: Arc<Processor>) {
    loop {
        let item = processor.calls.pop().await;
        let outcome = dispatcher::dispatch(&processor, item.request_id, item.body, item.cancel).await;
        processor.active_calls.lock().await.remove(&item.request_id);
        let (body, disconnect) = match outcome {
            DispatchOutcome::Response(response) => (MessageBody::Response(response), false),
            DispatchOutcome::Error(error, disconnect) => (MessageBody::ErrorResponse(error), disconnect),
        };
        let message = Message::new(processor.config.rpc_version, body).with_id(item.request_id);
        let _ = processor.send(message).await;
        if disconnect {
            processor
                .begin_shutdown(1, Some("method flagged disconnect_on_error".into()))
                .await;
        }
    }
}

async fn heartbeat_loop(processor: Arc<Processor>) {
    loop {
        match processor.heartbeat.wait_for_action().await {
            HeartbeatAction::SendPing => {
                let processor = processor.clone();
                tokio::spawn(async move {
                    let _ = processor.ping(Duration::from_secs(10)).await;
                });
            }
            HeartbeatAction::PeerDead => {
                processor
                    .begin_shutdown(-1, Some("peer exceeded keep_alive.peer_timeout".into()))
                    .await;
                break;
            }
        }
    }
}
