// src/core/mod.rs

//! The central module containing the core types of the session layer.

pub mod client;
pub mod errors;
pub mod protocol;

pub use client::{ErrorClient, Handle, ItemClient, ItemEvent};
pub use errors::SessionError;
pub use protocol::{DomainType, Msg};
