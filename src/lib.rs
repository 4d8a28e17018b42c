// src/lib.rs

//! Session layer for a publish/subscribe market-data client.
//!
//! This crate turns a single physical connection (or failover group of
//! connections) into a coherent set of logical subscriptions, a live service
//! catalog, a shared reference dictionary, and a single authenticated login
//! stream. It sits above a raw transport driver (see [`transport::Transport`])
//! and below user-facing request/response APIs.

pub mod config;
pub mod core;
pub mod session;
pub mod transport;

// Re-export
pub use crate::core::SessionError;
pub use crate::session::{DispatchResult, Handle, Session, SessionState, SharedSession};
