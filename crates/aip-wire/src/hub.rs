//! Hub: the rendezvous point that routes envelopes between workers.
//!
//! Every worker opens one TCP connection to the hub, performs a handshake
//! declaring the agent kinds it hosts, and then exchanges frames for the rest
//! of its life. The hub never looks inside an envelope: it reads the target
//! kind, forwards the envelope to the worker hosting that kind under a
//! hub-local frame id, and maps the callee's reply back to the caller.

use crate::directory::Directory;
use crate::message::*;
use crate::transport::{handshake_hmac, hmac_verify, read_message, write_message, WireError};

use aip_types::config::HubConfig;
use aip_types::error::{AipError, AipResult};
use aip_types::message::Envelope;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How long a new connection has to complete its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub listen_addr: SocketAddr,
    pub hub_id: String,
    /// Empty = open mesh; otherwise workers must present a matching HMAC.
    pub shared_secret: String,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            hub_id: uuid::Uuid::new_v4().to_string(),
            shared_secret: String::new(),
        }
    }
}

impl HubOptions {
    pub fn from_config(config: &HubConfig) -> AipResult<Self> {
        let listen_addr = config.listen_addr.parse().map_err(|e| {
            AipError::Config(format!("invalid hub listen_addr '{}': {e}", config.listen_addr))
        })?;
        Ok(Self {
            listen_addr,
            shared_secret: config.shared_secret.clone(),
            ..Default::default()
        })
    }
}

/// A connected worker as seen by the hub.
struct WorkerConn {
    name: String,
    tx: mpsc::UnboundedSender<WireMessage>,
    draining: AtomicBool,
}

/// A forwarded request awaiting the callee's answer.
#[derive(Debug, Clone)]
struct Route {
    origin: String,
    origin_frame_id: String,
    target: String,
    correlation_id: String,
}

struct HubState {
    hub_id: String,
    shared_secret: String,
    directory: Directory,
    workers: DashMap<String, Arc<WorkerConn>>,
    routes: DashMap<String, Route>,
}

/// The running hub.
pub struct Hub {
    local_addr: SocketAddr,
    state: Arc<HubState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Hub {
    /// Bind the listener and start accepting workers.
    pub async fn start(
        options: HubOptions,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(options.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            hub_id = %options.hub_id,
            authenticated = !options.shared_secret.is_empty(),
            "Hub listening"
        );

        let state = Arc::new(HubState {
            hub_id: options.hub_id,
            shared_secret: options.shared_secret,
            directory: Directory::new(),
            workers: DashMap::new(),
            routes: DashMap::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(Self {
            local_addr,
            state: Arc::clone(&state),
            shutdown_tx,
        });

        let accept_handle = tokio::spawn(async move {
            accept_loop(listener, state, shutdown_rx).await;
        });

        Ok((hub, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub_id(&self) -> &str {
        &self.state.hub_id
    }

    pub fn directory(&self) -> &Directory {
        &self.state.directory
    }

    pub fn connected_workers(&self) -> usize {
        self.state.workers.len()
    }

    /// Requests forwarded to a callee that has not answered yet.
    pub fn pending_routes(&self) -> usize {
        self.state.routes.len()
    }

    /// Tell every worker the hub is going away, then stop accepting and
    /// close all connections.
    pub fn shutdown(&self) {
        info!(workers = self.state.workers.len(), "Hub shutting down");
        for worker in self.state.workers.iter() {
            let _ = worker
                .tx
                .send(WireMessage::notification(WireNotification::ShuttingDown));
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolve once [`Hub::shutdown`] has been called.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<HubState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "Accepted worker connection");
                    let state = Arc::clone(&state);
                    let shutdown_rx = shutdown_rx.clone();
                    let (reader, writer) = stream.into_split();
                    tokio::spawn(async move {
                        if let Err(e) = handle_inbound(reader, writer, addr, state, shutdown_rx).await {
                            debug!(peer = %addr, error = %e, "Worker connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Hub accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = shutdown_rx.changed() => {
                info!("Hub accept loop stopped");
                return;
            }
        }
    }
}

/// Handle one worker connection: handshake, then the frame loop.
async fn handle_inbound<R, W>(
    mut reader: R,
    mut writer: W,
    addr: SocketAddr,
    state: Arc<HubState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{

    let msg = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader)).await {
        Ok(msg) => msg?,
        Err(_) => {
            return Err(WireError::HandshakeFailed(
                "timed out waiting for handshake".into(),
            ))
        }
    };

    let (worker_id, conn, mut rx) = match &msg.kind {
        WireMessageKind::Request(WireRequest::Handshake {
            worker_id,
            worker_name,
            protocol_version,
            kinds,
            nonce,
            auth_hmac,
        }) => {
            if *protocol_version != PROTOCOL_VERSION {
                let err = WireMessage::error(
                    msg.id.clone(),
                    codes::BAD_REQUEST,
                    format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, protocol_version
                    ),
                );
                write_message(&mut writer, &err).await?;
                return Err(WireError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: *protocol_version,
                });
            }

            if !state.shared_secret.is_empty()
                && !hmac_verify(
                    &state.shared_secret,
                    format!("{nonce}{worker_id}").as_bytes(),
                    auth_hmac,
                )
            {
                warn!(peer = %addr, worker = %worker_id, "Rejected worker: HMAC verification failed");
                let err = WireMessage::error(
                    msg.id.clone(),
                    codes::AUTH_FAILED,
                    "HMAC authentication failed",
                );
                write_message(&mut writer, &err).await?;
                return Err(WireError::HandshakeFailed(
                    "HMAC verification failed on incoming handshake".into(),
                ));
            }

            let (tx, rx) = mpsc::unbounded_channel::<WireMessage>();
            let conn = Arc::new(WorkerConn {
                name: worker_name.clone(),
                tx,
                draining: AtomicBool::new(false),
            });
            let claimed = match state.workers.entry(worker_id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&conn));
                    true
                }
            };
            if !claimed {
                let err = WireMessage::error(
                    msg.id.clone(),
                    codes::BAD_REQUEST,
                    format!("Worker id '{worker_id}' is already connected"),
                );
                write_message(&mut writer, &err).await?;
                return Err(WireError::HandshakeFailed("duplicate worker id".into()));
            }

            if let Err(AipError::KindConflict(kind)) =
                state.directory.register_all(kinds, worker_id)
            {
                // register_all binds nothing on conflict; only the id claim is undone.
                state.workers.remove(worker_id);
                let err = WireMessage::error(
                    msg.id.clone(),
                    codes::KIND_CONFLICT,
                    format!("Agent kind '{kind}' is hosted by another worker"),
                );
                write_message(&mut writer, &err).await?;
                return Err(WireError::HandshakeFailed(format!(
                    "kind conflict on '{kind}'"
                )));
            }

            let ack_nonce = uuid::Uuid::new_v4().to_string();
            let ack = WireMessage::response(
                msg.id.clone(),
                WireResponse::HandshakeAck {
                    hub_id: state.hub_id.clone(),
                    protocol_version: PROTOCOL_VERSION,
                    auth_hmac: handshake_hmac(&state.shared_secret, &ack_nonce, &state.hub_id),
                    nonce: ack_nonce,
                },
            );
            if let Err(e) = write_message(&mut writer, &ack).await {
                warn!(worker = %worker_id, peer = %addr, error = %e, "Handshake ack failed");
                disconnect(&state, worker_id);
                return Err(e);
            }

            info!(
                worker = %worker_id,
                name = %worker_name,
                peer = %addr,
                kinds = ?kinds,
                "Worker connected"
            );
            (worker_id.clone(), conn, rx)
        }
        _ => {
            warn!(peer = %addr, "Rejected frame before handshake");
            let err = WireMessage::error(
                msg.id.clone(),
                codes::AUTH_REQUIRED,
                "Handshake required before any other request",
            );
            write_message(&mut writer, &err).await?;
            return Err(WireError::HandshakeFailed(
                "rejected request before handshake".into(),
            ));
        }
    };

    let writer_worker = worker_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!(worker = %writer_worker, error = %e, "Write to worker failed");
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            read = read_message(&mut reader) => match read {
                Ok(msg) => handle_frame(&state, &worker_id, &conn, msg),
                Err(WireError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = shutdown_rx.changed() => break Ok(()),
        }
    };

    disconnect(&state, &worker_id);
    drop(conn);
    // The writer drains whatever is still queued (e.g. shutting_down) and
    // exits once the last sender is gone.
    let _ = writer_task.await;
    info!(worker = %worker_id, "Worker disconnected");
    result
}

/// Dispatch one frame from an established worker connection.
fn handle_frame(state: &HubState, worker_id: &str, conn: &WorkerConn, msg: WireMessage) {
    match msg.kind {
        WireMessageKind::Request(WireRequest::RegisterKind { kind }) => {
            let resp = match state.directory.register(&kind, worker_id) {
                Ok(()) => {
                    info!(worker = %worker_id, kind = %kind, "Kind registered");
                    WireMessage::response(msg.id, WireResponse::KindRegistered { kind })
                }
                Err(_) => WireMessage::error(
                    msg.id,
                    codes::KIND_CONFLICT,
                    format!("Agent kind '{kind}' is hosted by another worker"),
                ),
            };
            let _ = conn.tx.send(resp);
        }
        WireMessageKind::Request(WireRequest::Send { envelope }) => {
            route_send(state, worker_id, conn, msg.id, envelope);
        }
        WireMessageKind::Request(_) => {
            let _ = conn.tx.send(WireMessage::error(
                msg.id,
                codes::BAD_REQUEST,
                "Unexpected request in connection loop",
            ));
        }
        WireMessageKind::Response(resp) => complete_route(state, worker_id, msg.id, resp),
        WireMessageKind::Notification(WireNotification::Cancel { correlation_id }) => {
            let key = state
                .routes
                .iter()
                .find(|r| r.origin == worker_id && r.correlation_id == correlation_id)
                .map(|r| r.key().clone());
            if let Some((_, route)) = key.and_then(|k| state.routes.remove(&k)) {
                debug!(correlation_id = %correlation_id, target = %route.target, "Forwarding cancel");
                if let Some(target) = state.workers.get(&route.target) {
                    let _ = target.tx.send(WireMessage::notification(WireNotification::Cancel {
                        correlation_id,
                    }));
                }
            }
        }
        WireMessageKind::Notification(WireNotification::Draining) => {
            info!(worker = %worker_id, name = %conn.name, "Worker draining");
            conn.draining.store(true, Ordering::SeqCst);
        }
        WireMessageKind::Notification(WireNotification::ShuttingDown) => {
            debug!(worker = %worker_id, "Worker announced shutdown");
        }
    }
}

/// Forward a `send` to the worker hosting the target kind.
fn route_send(
    state: &HubState,
    origin: &str,
    origin_conn: &WorkerConn,
    frame_id: String,
    envelope: Envelope,
) {
    let kind = envelope.target.kind.clone();
    let target = match state.directory.lookup(&kind) {
        Some(worker) => worker,
        None => {
            debug!(kind = %kind, correlation_id = %envelope.correlation_id, "No host for kind");
            let _ = origin_conn.tx.send(WireMessage::error(
                frame_id,
                codes::NO_HOST,
                format!("No worker hosts agent kind '{kind}'"),
            ));
            return;
        }
    };

    let Some(target_conn) = state.workers.get(&target).map(|c| c.value().clone()) else {
        let _ = origin_conn.tx.send(WireMessage::error(
            frame_id,
            codes::NO_HOST,
            format!("No worker hosts agent kind '{kind}'"),
        ));
        return;
    };

    if target_conn.draining.load(Ordering::SeqCst) {
        let _ = origin_conn.tx.send(WireMessage::error(
            frame_id,
            codes::DRAINING,
            format!("Worker hosting '{kind}' is draining"),
        ));
        return;
    }

    let hub_frame_id = uuid::Uuid::new_v4().to_string();
    let correlation_id = envelope.correlation_id.clone();
    state.routes.insert(
        hub_frame_id.clone(),
        Route {
            origin: origin.to_string(),
            origin_frame_id: frame_id.clone(),
            target: target.clone(),
            correlation_id: correlation_id.clone(),
        },
    );

    debug!(
        kind = %kind,
        origin = %origin,
        target = %target,
        correlation_id = %correlation_id,
        "Routing envelope"
    );

    let deliver = WireMessage {
        id: hub_frame_id.clone(),
        kind: WireMessageKind::Request(WireRequest::Deliver { envelope }),
    };
    if target_conn.tx.send(deliver).is_err() {
        state.routes.remove(&hub_frame_id);
        let _ = origin_conn.tx.send(WireMessage::error(
            frame_id,
            codes::CALLEE_LOST,
            format!("Connection to worker hosting '{kind}' lost"),
        ));
    }
}

/// Map a callee's reply back to the original caller.
fn complete_route(state: &HubState, from: &str, hub_frame_id: String, resp: WireResponse) {
    let Some((_, route)) = state.routes.remove_if(&hub_frame_id, |_, r| r.target == from) else {
        debug!(frame_id = %hub_frame_id, worker = %from, "Dropping response for unknown route");
        return;
    };
    match state.workers.get(&route.origin) {
        Some(origin) => {
            let _ = origin.tx.send(WireMessage::response(route.origin_frame_id, resp));
        }
        None => debug!(
            correlation_id = %route.correlation_id,
            origin = %route.origin,
            "Caller gone before reply arrived"
        ),
    }
}

/// Release everything a departing worker held.
fn disconnect(state: &HubState, worker_id: &str) {
    state.workers.remove(worker_id);
    let released = state.directory.release_worker(worker_id);
    if !released.is_empty() {
        info!(worker = %worker_id, kinds = ?released, "Released agent kinds");
    }

    let affected: Vec<String> = state
        .routes
        .iter()
        .filter(|r| r.target == worker_id || r.origin == worker_id)
        .map(|r| r.key().clone())
        .collect();

    for key in affected {
        let Some((_, route)) = state.routes.remove(&key) else {
            continue;
        };
        if route.target == worker_id {
            if let Some(origin) = state.workers.get(&route.origin) {
                let _ = origin.tx.send(WireMessage::error(
                    route.origin_frame_id,
                    codes::CALLEE_LOST,
                    "Callee disconnected before replying",
                ));
            }
        } else if let Some(target) = state.workers.get(&route.target) {
            let _ = target.tx.send(WireMessage::notification(WireNotification::Cancel {
                correlation_id: route.correlation_id,
            }));
        }
    }
}
