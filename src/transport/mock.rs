// src/transport/mock.rs

//! A scripted in-memory transport driver.
//!
//! Tests (and loopback deployments) queue channel events and inbound messages
//! on the [`MockTransport`] handle, drive the session's dispatch loop, and
//! then inspect what the session submitted. The handle is cheaply cloneable;
//! all clones share one inner state.

use super::{ChannelEventKind, ChannelId, IoctlCode, Transport, TransportEvent};
use crate::config::{ChannelConfig, ChannelKind};
use crate::core::errors::SessionError;
use crate::core::protocol::Msg;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One recorded outbound submission.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub channel: ChannelId,
    pub token: u64,
    pub msg: Msg,
}

/// One recorded ioctl application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlRecord {
    pub channel: ChannelId,
    pub code: IoctlCode,
    pub value: i32,
}

#[derive(Default)]
struct MockInner {
    next_channel: u64,
    pending: VecDeque<TransportEvent>,
    submissions: Vec<SubmitRecord>,
    ioctls: Vec<IoctlRecord>,
    registered: Vec<ChannelId>,
    closed: Vec<ChannelId>,
    fail_submits_remaining: usize,
    fail_submit_streams: Vec<i32>,
    fail_ioctl_codes: Vec<IoctlCode>,
    fail_register_interest: bool,
}

/// A scripted [`Transport`] implementation backed by shared state.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one event for the next poll.
    pub fn push_event(&self, event: TransportEvent) {
        self.inner.lock().pending.push_back(event);
    }

    /// Queues a channel lifecycle event.
    pub fn push_channel_event(&self, channel: ChannelId, event: ChannelEventKind) {
        self.push_event(TransportEvent::Channel { channel, event });
    }

    /// Queues an inbound message carrying the given routing token.
    pub fn push_message(&self, channel: ChannelId, token: u64, msg: Msg) {
        self.push_event(TransportEvent::Message {
            channel,
            token,
            msg,
        });
    }

    /// Every submission the session made, in order.
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.inner.lock().submissions.clone()
    }

    /// The routing token the session attached when submitting on the given
    /// stream, if any submission on that stream was recorded.
    pub fn token_for_stream(&self, stream_id: i32) -> Option<u64> {
        self.inner
            .lock()
            .submissions
            .iter()
            .rev()
            .find(|s| s.msg.stream_id() == stream_id)
            .map(|s| s.token)
    }

    pub fn ioctls(&self) -> Vec<IoctlRecord> {
        self.inner.lock().ioctls.clone()
    }

    pub fn registered_channels(&self) -> Vec<ChannelId> {
        self.inner.lock().registered.clone()
    }

    pub fn closed_channels(&self) -> Vec<ChannelId> {
        self.inner.lock().closed.clone()
    }

    /// Makes the next `count` submissions fail.
    pub fn fail_next_submits(&self, count: usize) {
        self.inner.lock().fail_submits_remaining = count;
    }

    /// Makes any submission on the given stream id fail.
    pub fn fail_submit_on_stream(&self, stream_id: i32) {
        self.inner.lock().fail_submit_streams.push(stream_id);
    }

    /// Makes applications of the given tuning code fail.
    pub fn fail_ioctl(&self, code: IoctlCode) {
        self.inner.lock().fail_ioctl_codes.push(code);
    }

    /// Makes readiness registration fail.
    pub fn fail_register_interest(&self, fail: bool) {
        self.inner.lock().fail_register_interest = fail;
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, config: &ChannelConfig) -> Result<ChannelId, SessionError> {
        if config.kind == ChannelKind::SeqMulticast {
            return Err(SessionError::InvalidConfiguration(format!(
                "Connection kind {:?} is not supported by this driver",
                config.kind
            )));
        }
        let mut inner = self.inner.lock();
        inner.next_channel += 1;
        Ok(ChannelId(inner.next_channel))
    }

    fn ioctl(
        &mut self,
        channel: ChannelId,
        code: IoctlCode,
        value: i32,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.fail_ioctl_codes.contains(&code) {
            return Err(SessionError::ChannelError {
                channel: channel.to_string(),
                text: format!("ioctl {code} rejected"),
            });
        }
        inner.ioctls.push(IoctlRecord {
            channel,
            code,
            value,
        });
        Ok(())
    }

    fn register_interest(&mut self, channel: ChannelId) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.fail_register_interest {
            return Err(SessionError::ChannelError {
                channel: channel.to_string(),
                text: "selector registration failed".to_string(),
            });
        }
        inner.registered.push(channel);
        Ok(())
    }

    fn deregister_interest(&mut self, channel: ChannelId) -> Result<(), SessionError> {
        self.inner.lock().registered.retain(|c| *c != channel);
        Ok(())
    }

    fn submit(&mut self, channel: ChannelId, msg: &Msg, token: u64) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.fail_submits_remaining > 0 {
            inner.fail_submits_remaining -= 1;
            return Err(SessionError::SubmitFailed {
                stream_id: msg.stream_id(),
                text: "scripted submit failure".to_string(),
            });
        }
        if inner.fail_submit_streams.contains(&msg.stream_id()) {
            return Err(SessionError::SubmitFailed {
                stream_id: msg.stream_id(),
                text: "scripted submit failure".to_string(),
            });
        }
        inner.submissions.push(SubmitRecord {
            channel,
            token,
            msg: msg.clone(),
        });
        Ok(())
    }

    fn close(&mut self, channel: ChannelId) -> Result<(), SessionError> {
        self.inner.lock().closed.push(channel);
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Vec<TransportEvent>, SessionError> {
        // Scripted driver: whatever is queued is already "ready".
        let mut inner = self.inner.lock();
        Ok(inner.pending.drain(..).collect())
    }
}
