// src/core/client.rs

//! The callback seam between the session and the application.
//!
//! Applications implement [`ItemClient`] per subscription; the session fans
//! decoded messages out to it from the dispatch loop. All default methods are
//! no-ops so a client only implements the callbacks it cares about.

use crate::core::protocol::{
    AckMsg, DomainType, GenericMsg, Msg, RefreshMsg, StatusMsg, UpdateMsg,
};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque externally-visible identifier for one registered subscription,
/// stable for the subscription's lifetime and never reissued afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-delivery context handed to every callback: the item's handle, its
/// domain, and the opaque closure supplied at registration.
#[derive(Clone)]
pub struct ItemEvent {
    pub handle: Handle,
    pub domain: DomainType,
    closure: Option<Arc<dyn Any + Send + Sync>>,
}

impl ItemEvent {
    pub(crate) fn new(
        handle: Handle,
        domain: DomainType,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            handle,
            domain,
            closure,
        }
    }

    /// The opaque user data supplied at registration, if any.
    pub fn closure(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.closure.as_deref()
    }
}

impl fmt::Debug for ItemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemEvent")
            .field("handle", &self.handle)
            .field("domain", &self.domain)
            .field("has_closure", &self.closure.is_some())
            .finish()
    }
}

/// The application-side callback interface for one registered item.
///
/// For every inbound message the session calls `on_all_msg` first, then the
/// message-specific callback, synchronously and in subscriber registration
/// order.
pub trait ItemClient: Send + Sync {
    fn on_all_msg(&self, _msg: &Msg, _event: &ItemEvent) {}
    fn on_refresh_msg(&self, _msg: &RefreshMsg, _event: &ItemEvent) {}
    fn on_update_msg(&self, _msg: &UpdateMsg, _event: &ItemEvent) {}
    fn on_status_msg(&self, _msg: &StatusMsg, _event: &ItemEvent) {}
    fn on_generic_msg(&self, _msg: &GenericMsg, _event: &ItemEvent) {}
    fn on_ack_msg(&self, _msg: &AckMsg, _event: &ItemEvent) {}
}

/// Optional sink for usage errors. When registered, usage errors are routed
/// here in addition to the `Err` returned to the caller.
pub trait ErrorClient: Send + Sync {
    fn on_invalid_usage(&self, _text: &str) {}
    fn on_invalid_handle(&self, _handle: Handle, _text: &str) {}
}
