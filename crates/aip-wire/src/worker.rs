//! Worker runtime: hosts agents and issues RPC calls through the hub.
//!
//! A [`WorkerRuntime`] holds one connection to the hub. Agents are registered
//! per kind with a factory; an instance is created lazily for every distinct
//! key that receives a message. Outbound calls go through
//! [`WorkerRuntime::send_message`], which correlates the reply, enforces a
//! timeout and surfaces transport failures as errors rather than values.

use crate::codec::CodecRegistry;
use crate::lifecycle::{shutdown_signal, ConnectionState, StateCell};
use crate::message::*;
use crate::transport::{handshake_hmac, hmac_verify, read_message, write_message, WireError};

use aip_types::agent::AgentId;
use aip_types::config::WorkerConfig;
use aip_types::error::{AipError, AipResult};
use aip_types::message::{AnyPayload, Envelope, Payload};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-message context handed to an agent.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub sender: AgentId,
    pub recipient: AgentId,
    pub correlation_id: String,
    /// Fires when the caller gives up or the runtime closes.
    pub cancellation: CancellationToken,
}

/// Failure of an agent's handler. Reported to the caller as a wire error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Unsupported payload type: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    fn code(&self) -> u16 {
        match self {
            HandlerError::Unsupported(_) => codes::BAD_REQUEST,
            HandlerError::Failed(_) => codes::HANDLER_FAILED,
        }
    }
}

/// A message endpoint hosted by a worker.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Handle one inbound request and produce the reply payload.
    async fn on_message(
        &self,
        message: AnyPayload,
        ctx: MessageContext,
    ) -> Result<AnyPayload, HandlerError>;
}

/// Builds the agent instance for a given address.
pub type AgentFactory = Arc<dyn Fn(&AgentId) -> Arc<dyn Agent> + Send + Sync>;

/// Worker runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub hub_addr: String,
    pub worker_id: String,
    pub worker_name: String,
    pub shared_secret: String,
    /// Used when `send_message` is called without an explicit timeout.
    pub request_timeout: Duration,
    /// Upper bound on how long `stop()` waits for in-flight calls.
    pub drain_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            hub_addr: config.hub_addr.clone(),
            worker_id: uuid::Uuid::new_v4().to_string(),
            worker_name: config.worker_name.clone(),
            shared_secret: config.shared_secret.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        }
    }

    /// Options for a runtime connecting to `hub_addr` with defaults otherwise.
    pub fn for_hub(hub_addr: impl Into<String>) -> Self {
        Self {
            hub_addr: hub_addr.into(),
            ..Default::default()
        }
    }
}

/// An outbound request awaiting its response frame.
struct PendingSlot {
    /// Set for `send` frames; a reply must echo it.
    correlation_id: Option<String>,
    tx: oneshot::Sender<WireResponse>,
}

struct Inner {
    options: RuntimeOptions,
    codecs: CodecRegistry,
    state: StateCell,
    factories: RwLock<HashMap<String, AgentFactory>>,
    instances: DashMap<AgentId, Arc<dyn Agent>>,
    pending: DashMap<String, PendingSlot>,
    inbound: DashMap<String, CancellationToken>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    idle: Notify,
    closed_tx: watch::Sender<bool>,
}

/// Handle to a worker runtime. Cheap to clone.
#[derive(Clone)]
pub struct WorkerRuntime {
    inner: Arc<Inner>,
}

impl WorkerRuntime {
    /// Create a runtime that will use `codecs` for every payload it sends or
    /// receives.
    pub fn new(options: RuntimeOptions, codecs: CodecRegistry) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                options,
                codecs,
                state: StateCell::default(),
                factories: RwLock::new(HashMap::new()),
                instances: DashMap::new(),
                pending: DashMap::new(),
                inbound: DashMap::new(),
                outbound: Mutex::new(None),
                reader_task: Mutex::new(None),
                idle: Notify::new(),
                closed_tx,
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.options.worker_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    /// Register the JSON codec for `T` on this runtime.
    pub fn add_message_serializer<T: Payload>(&self) {
        self.inner.codecs.register_json::<T>();
    }

    /// Kinds this runtime hosts, sorted.
    pub fn hosted_kinds(&self) -> Vec<String> {
        let factories = self.inner.factories.read().unwrap_or_else(|e| e.into_inner());
        let mut kinds: Vec<String> = factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Requests sent by this runtime still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Inbound requests whose handler has not finished yet.
    pub fn inflight_handlers(&self) -> usize {
        self.inner.inbound.len()
    }

    /// Host agent kind `kind`, building one instance per key with `factory`.
    ///
    /// Before `start()` the kind is claimed in the handshake; afterwards it is
    /// claimed immediately. Fails with [`AipError::KindConflict`] if another
    /// live worker hosts the kind.
    pub async fn register<F>(&self, kind: impl Into<String>, factory: F) -> AipResult<()>
    where
        F: Fn(&AgentId) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let kind = kind.into();
        {
            let mut factories = self.inner.factories.write().unwrap_or_else(|e| e.into_inner());
            if factories.insert(kind.clone(), Arc::new(factory)).is_some() {
                debug!(kind = %kind, "Replaced agent factory");
            }
        }

        if self.state() != ConnectionState::Connected {
            return Ok(());
        }

        let frame = WireMessage::request(WireRequest::RegisterKind { kind: kind.clone() });
        let result = match self.request(frame, None, self.inner.options.request_timeout).await {
            Ok(WireResponse::KindRegistered { .. }) => Ok(()),
            Ok(WireResponse::Error { code, .. }) if code == codes::KIND_CONFLICT => {
                Err(AipError::KindConflict(kind.clone()))
            }
            Ok(WireResponse::Error { code, message }) => Err(AipError::Remote { code, message }),
            Ok(other) => Err(AipError::Internal(format!(
                "unexpected response to register_kind: {other:?}"
            ))),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let mut factories = self.inner.factories.write().unwrap_or_else(|e| e.into_inner());
            factories.remove(&kind);
        } else {
            info!(kind = %kind, "Agent kind registered");
        }
        result
    }

    /// Host a single shared instance for every key of `kind`.
    pub async fn register_singleton(
        &self,
        kind: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> AipResult<()> {
        self.register(kind, move |_: &AgentId| Arc::clone(&agent))
            .await
    }

    /// Connect to the hub and start serving.
    pub async fn start(&self) -> AipResult<()> {
        self.inner
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            .map_err(|s| AipError::Internal(format!("cannot start runtime in state {s}")))?;

        match self.connect().await {
            Ok(()) => {
                let _ = self
                    .inner
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Connected);
                info!(
                    hub = %self.inner.options.hub_addr,
                    worker = %self.inner.options.worker_id,
                    kinds = ?self.hosted_kinds(),
                    "Worker runtime connected"
                );
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .inner
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> AipResult<()> {
        let opts = &self.inner.options;
        let stream = TcpStream::connect(&opts.hub_addr).await.map_err(|e| {
            AipError::ConnectionLost(format!("cannot reach hub at {}: {e}", opts.hub_addr))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        let nonce = uuid::Uuid::new_v4().to_string();
        let handshake = WireMessage::request(WireRequest::Handshake {
            worker_id: opts.worker_id.clone(),
            worker_name: opts.worker_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            kinds: self.hosted_kinds(),
            auth_hmac: handshake_hmac(&opts.shared_secret, &nonce, &opts.worker_id),
            nonce,
        });
        write_message(&mut writer, &handshake).await?;

        let ack = read_message(&mut reader).await?;
        match ack.kind {
            WireMessageKind::Response(WireResponse::HandshakeAck {
                hub_id,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    }
                    .into());
                }
                if !opts.shared_secret.is_empty()
                    && !hmac_verify(
                        &opts.shared_secret,
                        format!("{nonce}{hub_id}").as_bytes(),
                        &auth_hmac,
                    )
                {
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on handshake ack".into(),
                    )
                    .into());
                }
                debug!(hub_id = %hub_id, "Handshake complete");
            }
            WireMessageKind::Response(WireResponse::Error { code, message })
                if code == codes::KIND_CONFLICT =>
            {
                return Err(AipError::KindConflict(message));
            }
            WireMessageKind::Response(WireResponse::Error { code, message }) => {
                return Err(AipError::Remote { code, message });
            }
            _ => {
                return Err(WireError::HandshakeFailed(
                    "Unexpected response to handshake".to_string(),
                )
                .into());
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
        *self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!(error = %e, "Write to hub failed");
                    break;
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let reader_task = tokio::spawn(async move {
            let result = reader_loop(&inner, &mut reader).await;
            if inner.state.get() != ConnectionState::Closed {
                match result {
                    Ok(()) => warn!("Hub closed the connection"),
                    Err(e) => warn!(error = %e, "Connection to hub lost"),
                }
            }
            inner.close();
        });
        *self.inner.reader_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader_task);
        Ok(())
    }

    /// Send `payload` to `target` and wait for the reply.
    ///
    /// Resolves with the decoded reply payload, or fails with
    /// [`AipError::DeliveryTimeout`] / [`AipError::ConnectionLost`] when no
    /// reply can arrive. `timeout = None` uses the configured request timeout.
    pub async fn send_message<T: Payload>(
        &self,
        payload: &T,
        target: AgentId,
        sender: AgentId,
        timeout: Option<Duration>,
    ) -> AipResult<AnyPayload> {
        self.check_accepting()?;
        let bytes = self.inner.codecs.encode(payload)?;
        self.send_encoded(T::TYPE_NAME, bytes, target, sender, timeout)
            .await
    }

    /// Send a type-erased payload.
    pub async fn send_any(
        &self,
        payload: &AnyPayload,
        target: AgentId,
        sender: AgentId,
        timeout: Option<Duration>,
    ) -> AipResult<AnyPayload> {
        self.check_accepting()?;
        let bytes = self.inner.codecs.encode_any(payload)?;
        self.send_encoded(payload.type_name(), bytes, target, sender, timeout)
            .await
    }

    /// Typed call: send `request` and expect a `Resp` back.
    pub async fn call<Req: Payload, Resp: Payload>(
        &self,
        request: &Req,
        target: AgentId,
        sender: AgentId,
        timeout: Option<Duration>,
    ) -> AipResult<Resp> {
        let reply = self.send_message(request, target, sender, timeout).await?;
        reply.downcast::<Resp>().map_err(|other| AipError::UnexpectedPayload {
            expected: Resp::TYPE_NAME.to_string(),
            actual: other.type_name().to_string(),
        })
    }

    fn check_accepting(&self) -> AipResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Draining | ConnectionState::Closed => Err(AipError::ShuttingDown),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(AipError::NotConnected)
            }
        }
    }

    async fn send_encoded(
        &self,
        payload_type: &str,
        payload: Vec<u8>,
        target: AgentId,
        sender: AgentId,
        timeout: Option<Duration>,
    ) -> AipResult<AnyPayload> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        let envelope = Envelope {
            payload_type: payload_type.to_string(),
            payload,
            sender,
            target: target.clone(),
            correlation_id: correlation_id.clone(),
        };
        let frame = WireMessage {
            id: correlation_id.clone(),
            kind: WireMessageKind::Request(WireRequest::Send { envelope }),
        };

        debug!(target = %target, correlation_id = %correlation_id, payload_type, "Sending message");

        match self.request(frame, Some(correlation_id.clone()), timeout).await? {
            WireResponse::Reply { envelope } => {
                self.inner
                    .codecs
                    .decode(&envelope.payload_type, &envelope.payload)
            }
            WireResponse::Error { code, message } => Err(match code {
                codes::NO_HOST => AipError::AgentNotFound(target.to_string()),
                codes::CALLEE_LOST => AipError::ConnectionLost(message),
                _ => AipError::Remote { code, message },
            }),
            other => Err(AipError::Internal(format!(
                "unexpected response to send: {other:?}"
            ))),
        }
    }

    /// Send a request frame and wait for the matching response frame.
    async fn request(
        &self,
        frame: WireMessage,
        correlation_id: Option<String>,
        timeout: Duration,
    ) -> AipResult<WireResponse> {
        let frame_id = frame.id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            frame_id.clone(),
            PendingSlot {
                correlation_id: correlation_id.clone(),
                tx,
            },
        );

        if !self.inner.send_frame(frame) {
            self.inner.pending.remove(&frame_id);
            self.inner.idle.notify_waiters();
            return Err(AipError::ConnectionLost("not connected to hub".into()));
        }

        // Withdraws the request if this future is dropped before a reply.
        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            frame_id: frame_id.clone(),
            correlation_id: correlation_id.clone(),
            armed: true,
        };

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                guard.disarm();
                Ok(resp)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(AipError::ConnectionLost(
                    "connection to hub closed before reply".into(),
                ))
            }
            Err(_) => {
                drop(guard);
                warn!(
                    frame_id = %frame_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(AipError::DeliveryTimeout {
                    correlation_id: correlation_id.unwrap_or(frame_id),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        self.inner.idle.notify_waiters();
        result
    }

    /// Drain and close: reject new sends, let in-flight calls (both
    /// directions) finish within the drain timeout, then close the
    /// connection.
    pub async fn stop(&self) -> AipResult<()> {
        match self
            .inner
            .state
            .transition(ConnectionState::Connected, ConnectionState::Draining)
        {
            Ok(()) => {}
            Err(ConnectionState::Closed) | Err(ConnectionState::Draining) => return Ok(()),
            Err(_) => {
                self.inner.close();
                return Ok(());
            }
        }

        info!(
            pending = self.pending_calls(),
            handlers = self.inflight_handlers(),
            "Worker runtime draining"
        );
        self.inner
            .send_frame(WireMessage::notification(WireNotification::Draining));

        let drained = tokio::time::timeout(self.inner.options.drain_timeout, self.wait_idle()).await;
        if drained.is_err() {
            warn!(
                pending = self.pending_calls(),
                handlers = self.inflight_handlers(),
                "Drain timeout elapsed, closing with calls in flight"
            );
        }

        self.inner.close();
        info!("Worker runtime closed");
        Ok(())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.is_empty() && self.inner.inbound.is_empty() {
                return;
            }
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once the runtime has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run until `stop_condition` resolves (or the hub connection drops),
    /// then drain and close.
    pub async fn stop_when<F: Future<Output = ()>>(&self, stop_condition: F) -> AipResult<()> {
        tokio::select! {
            _ = stop_condition => info!("Stop condition reached"),
            _ = self.closed() => {}
        }
        self.stop().await
    }

    /// Run until SIGINT/SIGTERM (Ctrl+C on Windows), then drain and close.
    pub async fn stop_when_signal(&self) -> AipResult<()> {
        self.stop_when(shutdown_signal()).await
    }
}

/// Removes an abandoned request from the pending table and tells the callee
/// to stop working on it.
struct PendingGuard {
    inner: Arc<Inner>,
    frame_id: String,
    correlation_id: Option<String>,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.inner.pending.remove(&self.frame_id).is_some() {
            if let Some(correlation_id) = &self.correlation_id {
                self.inner
                    .send_frame(WireMessage::notification(WireNotification::Cancel {
                        correlation_id: correlation_id.clone(),
                    }));
            }
            debug!(frame_id = %self.frame_id, "Withdrew pending request");
        }
        self.inner.idle.notify_waiters();
    }
}

impl Inner {
    /// Queue a frame for the writer task. Returns false when disconnected.
    fn send_frame(&self, frame: WireMessage) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Move to `Closed` and release everything tied to the connection.
    fn close(&self) {
        let previous = self.state.close();
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        // Dropping the senders resolves waiting callers with ConnectionLost.
        self.pending.clear();
        for token in self.inbound.iter() {
            token.cancel();
        }
        if previous != ConnectionState::Closed {
            debug!(previous = %previous, "Worker runtime state -> closed");
        }
        let _ = self.closed_tx.send(true);
        self.idle.notify_waiters();
    }

    /// Resolve a response frame against the pending table.
    fn complete(&self, frame_id: String, resp: WireResponse) {
        let matches = |slot: &PendingSlot| match (&resp, &slot.correlation_id) {
            (WireResponse::Reply { envelope }, Some(expected)) => {
                envelope.correlation_id == *expected
            }
            _ => true,
        };
        match self.pending.remove_if(&frame_id, |_, slot| matches(slot)) {
            Some((_, slot)) => {
                let _ = slot.tx.send(resp);
            }
            None => {
                let correlation_id = match &resp {
                    WireResponse::Reply { envelope } => envelope.correlation_id.clone(),
                    _ => String::new(),
                };
                warn!(
                    frame_id = %frame_id,
                    correlation_id = %correlation_id,
                    "Discarding late or unmatched response"
                );
            }
        }
        self.idle.notify_waiters();
    }

    fn agent_for(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        if let Some(agent) = self.instances.get(id) {
            return Some(Arc::clone(agent.value()));
        }
        let factory = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories.get(&id.kind).cloned()?
        };
        let agent = self
            .instances
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(agent = %id, "Instantiating agent");
                factory(id)
            })
            .value()
            .clone();
        Some(agent)
    }
}

async fn reader_loop(
    inner: &Arc<Inner>,
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<(), WireError> {
    loop {
        let msg = match read_message(reader).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        match msg.kind {
            WireMessageKind::Request(WireRequest::Deliver { envelope }) => {
                let inner = Arc::clone(inner);
                tokio::spawn(handle_deliver(inner, msg.id, envelope));
            }
            WireMessageKind::Request(_) => {
                inner.send_frame(WireMessage::error(
                    msg.id,
                    codes::BAD_REQUEST,
                    "Unexpected request from hub",
                ));
            }
            WireMessageKind::Response(resp) => inner.complete(msg.id, resp),
            WireMessageKind::Notification(WireNotification::Cancel { correlation_id }) => {
                if let Some(token) = inner.inbound.get(&correlation_id) {
                    debug!(correlation_id = %correlation_id, "Caller cancelled in-flight request");
                    token.cancel();
                }
            }
            WireMessageKind::Notification(WireNotification::ShuttingDown) => {
                info!("Hub is shutting down");
            }
            WireMessageKind::Notification(WireNotification::Draining) => {}
        }
    }
}

/// Run the handler for one inbound envelope and send back its reply.
async fn handle_deliver(inner: Arc<Inner>, frame_id: String, envelope: Envelope) {
    if inner.state.get() != ConnectionState::Connected {
        inner.send_frame(WireMessage::error(
            frame_id,
            codes::DRAINING,
            "Worker is draining",
        ));
        return;
    }

    let correlation_id = envelope.correlation_id.clone();
    let token = CancellationToken::new();
    inner.inbound.insert(correlation_id.clone(), token.clone());

    let response = dispatch(&inner, &envelope, token.clone()).await;

    inner.inbound.remove(&correlation_id);
    if token.is_cancelled() {
        debug!(correlation_id = %correlation_id, "Dropping result of cancelled request");
    } else {
        let resp = match response {
            Ok(reply) => WireResponse::Reply { envelope: reply },
            Err((code, message)) => {
                debug!(correlation_id = %correlation_id, code, message = %message, "Request failed");
                WireResponse::Error { code, message }
            }
        };
        inner.send_frame(WireMessage::response(frame_id, resp));
    }
    inner.idle.notify_waiters();
}

async fn dispatch(
    inner: &Inner,
    envelope: &Envelope,
    token: CancellationToken,
) -> Result<Envelope, (u16, String)> {
    let Some(agent) = inner.agent_for(&envelope.target) else {
        return Err((
            codes::NO_HOST,
            format!("No agent kind '{}' on this worker", envelope.target.kind),
        ));
    };

    let payload = inner
        .codecs
        .decode(&envelope.payload_type, &envelope.payload)
        .map_err(|e| match e {
            AipError::CodecNotFound(_) => (codes::CODEC_NOT_FOUND, e.to_string()),
            other => (codes::BAD_REQUEST, other.to_string()),
        })?;

    let ctx = MessageContext {
        sender: envelope.sender.clone(),
        recipient: envelope.target.clone(),
        correlation_id: envelope.correlation_id.clone(),
        cancellation: token.clone(),
    };

    // The handler runs in its own task so a panic fails this call only.
    let mut handler = tokio::spawn(async move { agent.on_message(payload, ctx).await });
    let joined = tokio::select! {
        joined = &mut handler => joined,
        _ = token.cancelled() => {
            handler.abort();
            return Err((codes::HANDLER_FAILED, "cancelled".into()));
        }
    };

    let reply = match joined {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => return Err((e.code(), e.to_string())),
        Err(e) => return Err((codes::HANDLER_FAILED, format!("handler panicked: {e}"))),
    };

    let bytes = inner
        .codecs
        .encode_any(&reply)
        .map_err(|e| match e {
            AipError::CodecNotFound(_) => (codes::CODEC_NOT_FOUND, e.to_string()),
            other => (codes::HANDLER_FAILED, other.to_string()),
        })?;
    Ok(envelope.reply(reply.type_name(), bytes))
}
