//! The SSE session server.
//!
//! Route table:
//!
//! | route | auth | behaviour |
//! |---|---|---|
//! | `GET /sse` | signed headers | opens a session; first event is `endpoint` |
//! | `POST /messages/?session_id=` | session id | JSON-RPC in, `202 Accepted`, reply on the stream |
//! | `GET /info` | none | `{"uuid": owner_id}` |

use crate::auth::{require_auth, AuthGateway, AuthenticatedAgent};
use crate::mcp::handle_mcp_request;
use crate::rate_limiter::{gcra_rate_limit, KeyedRateLimiter};
use aip_kernel::ToolDispatcher;
use aip_types::config::GatewayConfig;
use aip_types::error::{AipError, AipResult};
use axum::body::Bytes;
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Per-session outbound buffer.
const SESSION_BUFFER: usize = 64;

struct Session {
    events: mpsc::Sender<Event>,
    /// Cancels the session's in-flight tool calls when the stream closes.
    cancel: CancellationToken,
}

/// Shared state behind every route.
pub struct AppState {
    gateway: Arc<AuthGateway>,
    dispatcher: Arc<ToolDispatcher>,
    sessions: DashMap<String, Session>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(gateway: Arc<AuthGateway>, dispatcher: Arc<ToolDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            dispatcher,
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn owner_id(&self) -> &str {
        self.gateway.owner_id()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// End every open event stream.
    pub fn close_sessions(&self) {
        self.shutdown.cancel();
    }
}

/// Removes the session once its event stream is dropped.
struct SessionGuard {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.state.sessions.remove(&self.session_id) {
            session.cancel.cancel();
            debug!(session = %self.session_id, "SSE session closed");
        }
    }
}

/// Assemble the routes. `limiter` of `None` serves without rate limiting.
pub fn build_router(state: Arc<AppState>, limiter: Option<Arc<KeyedRateLimiter>>) -> Router {
    let authenticated = Router::new()
        .route("/sse", get(open_session))
        .route_layer(middleware::from_fn_with_state(
            state.gateway.clone(),
            require_auth,
        ));

    let mut router = Router::new()
        .merge(authenticated)
        .route("/messages/", post(post_message))
        .route("/messages", post(post_message))
        .route("/info", get(info))
        .with_state(state);
    if let Some(limiter) = limiter {
        router = router.layer(middleware::from_fn_with_state(limiter, gcra_rate_limit));
    }
    router.layer(TraceLayer::new_for_http())
}

async fn open_session(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedAgent(agent)): Extension<AuthenticatedAgent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel(SESSION_BUFFER);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages/?session_id={session_id}"));
    if tx.try_send(endpoint).is_err() {
        warn!(session = %session_id, "Could not queue endpoint event");
    }

    state.sessions.insert(
        session_id.clone(),
        Session {
            events: tx,
            cancel: state.shutdown.child_token(),
        },
    );
    info!(session = %session_id, agent = %agent, "SSE session opened");

    let shutdown = state.shutdown.clone();
    let guard = SessionGuard {
        state,
        session_id,
    };
    let stream = ReceiverStream::new(rx)
        .map(move |event| {
            let _session = &guard;
            Ok::<_, Infallible>(event)
        })
        .take_until(async move { shutdown.cancelled().await });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|s| !s.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "session_id is required");
    };

    let (events, cancel) = match state.sessions.get(&session_id) {
        Some(session) if !session.events.is_closed() => {
            (session.events.clone(), session.cancel.clone())
        }
        _ => {
            debug!(session = %session_id, "Message for unknown session");
            return error_response(StatusCode::NOT_FOUND, "Could not find session");
        }
    };

    let request: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(session = %session_id, error = %e, "Unparseable message");
            return error_response(StatusCode::BAD_REQUEST, "Could not parse message");
        }
    };

    tokio::spawn(async move {
        let Some(response) =
            handle_mcp_request(&request, state.owner_id(), &state.dispatcher, &cancel).await
        else {
            return;
        };
        let event = Event::default().event("message").data(response.to_string());
        if events.send(event).await.is_err() {
            debug!(session = %session_id, "Session closed before reply was sent");
        }
    });

    (StatusCode::ACCEPTED, "Accepted").into_response()
}

async fn info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"uuid": state.owner_id()}))
}

/// Bind `config.listen_addr` and serve until `shutdown` resolves.
///
/// Open sessions are closed as part of shutdown so the graceful drain does
/// not wait on long-lived streams.
pub async fn run_server(
    config: &GatewayConfig,
    state: Arc<AppState>,
    limiter: Option<Arc<KeyedRateLimiter>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> AipResult<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        public_url = config.public_url.as_deref().unwrap_or(""),
        owner = %state.owner_id(),
        "Tool endpoint listening"
    );

    let app = build_router(state.clone(), limiter);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Tool endpoint received shutdown signal");
        state.close_sessions();
    })
    .await
    .map_err(AipError::Io)?;

    info!("Tool endpoint stopped");
    Ok(())
}
