//! Signed-header authentication for the public endpoint.
//!
//! Callers present three headers: `x-agent` (their agent id), `x-timestamp`
//! (unix seconds, decimal) and `x-sign` (hex ed25519 signature over the
//! timestamp text exactly as sent). The gateway rejects stale or future
//! timestamps before looking at the signature, then asks the identity
//! registry whether the caller may use this owner's endpoint.

use aip_types::config::GatewayConfig;
use aip_types::identity::IdentityRegistry;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::middleware::Next;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const HEADER_AGENT: &str = "x-agent";
pub const HEADER_SIGN: &str = "x-sign";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unauthorized")]
    MissingCredentials,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("token expired")]
    Expired,
    #[error("timestamp in the future")]
    FromFuture,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("not authorized")]
    NotAuthorized,
    #[error("identity service unavailable: {0}")]
    Registry(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredentials => StatusCode::UNAUTHORIZED,
            Self::InvalidTimestamp | Self::Expired | Self::FromFuture => StatusCode::BAD_REQUEST,
            Self::InvalidSignature | Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn into_response(self) -> Response<Body> {
        Response::builder()
            .status(self.status())
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"error": self.to_string()}).to_string(),
            ))
            .unwrap_or_default()
    }
}

/// The credentials a caller presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAssertion {
    pub agent_id: String,
    /// Timestamp text as sent; this is the signed message.
    pub timestamp: String,
    pub signature: String,
}

impl AuthAssertion {
    /// Read the three auth headers. Any missing or empty header is a
    /// [`AuthError::MissingCredentials`].
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(AuthError::MissingCredentials)
        };
        Ok(Self {
            agent_id: get(HEADER_AGENT)?,
            timestamp: get(HEADER_TIMESTAMP)?,
            signature: get(HEADER_SIGN)?,
        })
    }
}

/// Freshness limits and the endpoint owner.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub owner_id: String,
    /// Oldest acceptable timestamp age, in seconds.
    pub replay_window_secs: i64,
    /// How far ahead of our clock a timestamp may be, in seconds.
    pub max_future_skew_secs: i64,
}

impl AuthPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            owner_id: config.owner_id.clone(),
            replay_window_secs: i64::try_from(config.replay_window_secs).unwrap_or(i64::MAX),
            max_future_skew_secs: i64::try_from(config.max_future_skew_secs).unwrap_or(i64::MAX),
        }
    }
}

/// Marker inserted into request extensions once a caller is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedAgent(pub String);

pub struct AuthGateway {
    registry: Arc<dyn IdentityRegistry>,
    policy: AuthPolicy,
}

impl AuthGateway {
    pub fn new(registry: Arc<dyn IdentityRegistry>, policy: AuthPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn owner_id(&self) -> &str {
        &self.policy.owner_id
    }

    /// Check `assertion` against the clock reading `now` (unix seconds).
    /// Returns the verified caller id.
    pub async fn verify(&self, assertion: &AuthAssertion, now: i64) -> Result<String, AuthError> {
        let timestamp: i64 = assertion
            .timestamp
            .parse()
            .map_err(|_| AuthError::InvalidTimestamp)?;

        // Widened so extreme header values cannot overflow.
        let age = i128::from(now) - i128::from(timestamp);
        if age > i128::from(self.policy.replay_window_secs) {
            return Err(AuthError::Expired);
        }
        if -age > i128::from(self.policy.max_future_skew_secs) {
            return Err(AuthError::FromFuture);
        }

        let verified = self
            .registry
            .verify(
                &assertion.agent_id,
                assertion.timestamp.as_bytes(),
                &assertion.signature,
            )
            .await
            .map_err(|e| AuthError::Registry(e.to_string()))?;
        if !verified {
            return Err(AuthError::InvalidSignature);
        }

        let authorized = self
            .registry
            .is_authorized(&self.policy.owner_id, &assertion.agent_id)
            .await
            .map_err(|e| AuthError::Registry(e.to_string()))?;
        if !authorized {
            return Err(AuthError::NotAuthorized);
        }

        Ok(assertion.agent_id.clone())
    }

    /// Read the headers and verify them against the current time.
    pub async fn verify_headers(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let assertion = AuthAssertion::from_headers(headers)?;
        self.verify(&assertion, chrono::Utc::now().timestamp()).await
    }
}

/// Middleware guarding routes that need a verified caller.
pub async fn require_auth(
    State(gateway): State<Arc<AuthGateway>>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    match gateway.verify_headers(request.headers()).await {
        Ok(agent_id) => {
            debug!(agent = %agent_id, path = %request.uri().path(), "Caller authenticated");
            request.extensions_mut().insert(AuthenticatedAgent(agent_id));
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), reason = %e, "Rejected request");
            e.into_response()
        }
    }
}
