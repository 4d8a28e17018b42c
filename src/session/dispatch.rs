// src/session/dispatch.rs

//! The dispatch loop: one bounded wait on the transport driver merged with
//! the timeout queue, then synchronous callback fan-out.
//!
//! Deliveries are collected while events are processed and performed only
//! after all registry mutation of the iteration, so no callback ever
//! observes a half-merged cache.

use super::timeout::TimeoutTask;
use super::Session;
use crate::core::client::{ItemClient, ItemEvent};
use crate::core::errors::SessionError;
use crate::core::protocol::{AckMsg, GenericMsg, Msg, RefreshMsg, StatusMsg, UpdateMsg};
use crate::transport::TransportEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The outcome of one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// At least one event or expired task was processed.
    Dispatched,
    /// The wait elapsed with nothing to do.
    TimedOut,
}

/// One queued callback payload.
#[derive(Debug, Clone)]
pub(crate) enum DeliveryMsg {
    Refresh(RefreshMsg),
    Update(UpdateMsg),
    Status(StatusMsg),
    Generic(GenericMsg),
    Ack(AckMsg),
}

/// One queued callback: the client, its event context and the message.
/// Snapshotted at queue time so the item may be removed before delivery.
pub(crate) struct Delivery {
    pub client: Arc<dyn ItemClient>,
    pub event: ItemEvent,
    pub msg: DeliveryMsg,
}

impl Delivery {
    /// Invokes `on_all_msg` first, then the message-specific callback.
    pub(crate) fn deliver(self) {
        let domain = self.event.domain;
        match self.msg {
            DeliveryMsg::Refresh(m) => {
                self.client
                    .on_all_msg(&Msg::Refresh(domain, m.clone()), &self.event);
                self.client.on_refresh_msg(&m, &self.event);
            }
            DeliveryMsg::Update(m) => {
                self.client
                    .on_all_msg(&Msg::Update(domain, m.clone()), &self.event);
                self.client.on_update_msg(&m, &self.event);
            }
            DeliveryMsg::Status(m) => {
                self.client
                    .on_all_msg(&Msg::Status(domain, m.clone()), &self.event);
                self.client.on_status_msg(&m, &self.event);
            }
            DeliveryMsg::Generic(m) => {
                self.client
                    .on_all_msg(&Msg::Generic(domain, m.clone()), &self.event);
                self.client.on_generic_msg(&m, &self.event);
            }
            DeliveryMsg::Ack(m) => {
                self.client
                    .on_all_msg(&Msg::Ack(domain, m.clone()), &self.event);
                self.client.on_ack_msg(&m, &self.event);
            }
        }
    }
}

impl Session {
    /// Runs one dispatch iteration: waits up to `timeout` (bounded further by
    /// the earliest pending deadline), processes readiness events in driver
    /// order, then expired tasks in deadline order, and finally performs the
    /// collected callback deliveries.
    pub fn dispatch(&mut self, timeout: Duration) -> Result<DispatchResult, SessionError> {
        let result = self.dispatch_collect(timeout)?;
        for delivery in self.take_deliveries() {
            delivery.deliver();
        }
        Ok(result)
    }

    /// The mutation half of [`Session::dispatch`]: everything except the
    /// callback deliveries, which stay queued. Used by `SharedSession` to
    /// deliver outside its lock.
    pub(crate) fn dispatch_collect(&mut self, timeout: Duration) -> Result<DispatchResult, SessionError> {
        let now = Instant::now();
        let wait = match self.timeouts.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(now)),
            None => timeout,
        };

        let events = self.transport.poll(wait)?;
        let mut worked = !events.is_empty();
        for event in events {
            match event {
                TransportEvent::Channel { channel, event } => {
                    self.on_channel_event(channel, event);
                }
                TransportEvent::Message { channel, token, msg } => {
                    self.route_message(channel, token, msg);
                }
            }
        }

        let now = Instant::now();
        while let Some(task) = self.timeouts.pop_expired(now) {
            worked = true;
            match task {
                TimeoutTask::ItemClosedStatus { slot, text } => {
                    self.simulate_closed_status(slot, text);
                }
                TimeoutTask::DictionaryEncodeContinue { slot } => {
                    self.continue_local_encode(slot);
                }
                TimeoutTask::DictionaryItemRemove { slot } => {
                    self.remove_dictionary_item(slot);
                }
                TimeoutTask::LoginReplay { slot } => {
                    self.replay_login_refresh(slot);
                }
            }
        }

        Ok(if worked {
            DispatchResult::Dispatched
        } else {
            DispatchResult::TimedOut
        })
    }

    pub(crate) fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }
}
