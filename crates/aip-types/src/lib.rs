//! Core types and traits for the AIP agent interaction runtime.
//!
//! This crate defines the data structures shared by the wire protocol, the
//! worker runtime, the tool dispatcher and the public HTTP surface. It
//! contains no networking and no business logic.

pub mod agent;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod serde_compat;
pub mod tool;
