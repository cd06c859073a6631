//! AIP wire layer: hub/worker transport and the RPC call layer.
//!
//! Workers open one long-lived TCP connection to a hub and declare which
//! agent kinds they host. The hub routes request envelopes to the worker that
//! hosts the target kind and routes replies back, so workers never need
//! inbound reachability.
//!
//! ## Architecture
//!
//! - **Hub**: rendezvous process owning the agent [`Directory`]
//! - **WorkerRuntime**: hosts agents and issues `send_message` calls
//! - **CodecRegistry**: payload type name to encode/decode functions
//! - **WireMessage**: JSON-framed protocol messages

pub mod codec;
pub mod directory;
pub mod hub;
pub mod lifecycle;
pub mod message;
pub mod transport;
pub mod worker;

pub use codec::{CodecRegistry, JsonCodec, PayloadCodec};
pub use directory::Directory;
pub use hub::{Hub, HubOptions};
pub use lifecycle::ConnectionState;
pub use message::{WireMessage, WireNotification, WireRequest, WireResponse};
pub use transport::WireError;
pub use worker::{Agent, HandlerError, MessageContext, RuntimeOptions, WorkerRuntime};
