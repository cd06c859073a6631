//! Cost-aware rate limiting using GCRA (Generic Cell Rate Algorithm).
//!
//! Each route has a token cost (info=1, message=5, opening a session=10).
//! Every client IP gets `rate_limit_per_minute` tokens per minute; zero turns
//! limiting off.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::middleware::Next;
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

fn cost(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

pub fn operation_cost(method: &str, path: &str) -> NonZeroU32 {
    match (method, path) {
        (_, "/info") => cost(1),
        ("GET", "/sse") => cost(10),
        ("POST", p) if p.starts_with("/messages") => cost(5),
        _ => cost(5),
    }
}

pub type KeyedRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// `per_minute` tokens per minute per IP, or `None` when `per_minute` is zero.
pub fn create_rate_limiter(per_minute: u32) -> Option<Arc<KeyedRateLimiter>> {
    let quota = NonZeroU32::new(per_minute)?;
    Some(Arc::new(RateLimiter::keyed(Quota::per_minute(quota))))
}

/// GCRA rate limiting middleware.
///
/// Extracts the client IP from `ConnectInfo`, computes the cost for the
/// requested operation, and checks the GCRA limiter. Returns 429 if the
/// client has exhausted its token budget.
pub async fn gcra_rate_limit(
    axum::extract::State(limiter): axum::extract::State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let cost = operation_cost(&method, &path);

    // A cost above the burst size can never pass; treat it like exhaustion.
    if !matches!(limiter.check_key_n(&ip, cost), Ok(Ok(()))) {
        tracing::warn!(ip = %ip, cost = cost.get(), path = %path, "GCRA rate limit exceeded");
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .header("retry-after", "60")
            .body(Body::from(
                serde_json::json!({"error": "Rate limit exceeded"}).to_string(),
            ))
            .unwrap_or_default();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_costs() {
        assert_eq!(operation_cost("GET", "/info").get(), 1);
        assert_eq!(operation_cost("GET", "/sse").get(), 10);
        assert_eq!(operation_cost("POST", "/messages/").get(), 5);
        assert_eq!(operation_cost("GET", "/elsewhere").get(), 5);
    }

    #[test]
    fn test_quota_exhaustion() {
        let limiter = create_rate_limiter(12).unwrap();
        let ip = IpAddr::from([10, 0, 0, 1]);
        assert!(matches!(limiter.check_key_n(&ip, cost(10)), Ok(Ok(()))));
        assert!(matches!(limiter.check_key_n(&ip, cost(1)), Ok(Ok(()))));
        assert!(!matches!(limiter.check_key_n(&ip, cost(10)), Ok(Ok(()))));

        let other = IpAddr::from([10, 0, 0, 2]);
        assert!(matches!(limiter.check_key_n(&other, cost(10)), Ok(Ok(()))));
    }

    #[test]
    fn test_zero_quota_disables_limiting() {
        assert!(create_rate_limiter(0).is_none());
    }
}
