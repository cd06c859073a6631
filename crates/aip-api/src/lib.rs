//! Public HTTP surface of a tool server.
//!
//! External callers reach a tool table over an MCP-style session: `GET /sse`
//! opens an event stream after the auth gateway accepts the caller's signed
//! headers, and JSON-RPC requests posted to `/messages/` are answered on that
//! stream. `GET /info` reports the owner id for discovery.

pub mod auth;
pub mod identity;
pub mod mcp;
pub mod rate_limiter;
pub mod server;

pub use auth::{AuthAssertion, AuthError, AuthGateway, AuthPolicy};
pub use identity::{sign_auth_headers, StaticIdentityRegistry};
pub use server::{build_router, run_server, AppState};
