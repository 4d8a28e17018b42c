// src/transport/mod.rs

//! The seam to the raw transport driver.
//!
//! The driver owns sockets, TLS, compression and ping timers; this crate only
//! consumes it through the [`Transport`] trait: connect, submit, per-channel
//! tuning, and a readiness poll delivering channel events and decoded
//! messages.

use crate::config::ChannelConfig;
use crate::core::errors::SessionError;
use crate::core::protocol::Msg;
use std::time::Duration;
use strum::Display;

pub mod mock;

/// Identifies one driver-side channel. The id survives descriptor swaps
/// (`FdChange`); it is the channel's logical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-channel tuning knobs applied through [`Transport::ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum IoctlCode {
    SystemWriteBuffers,
    SystemReadBuffers,
    CompressionThreshold,
    HighWaterMark,
}

/// A channel lifecycle event reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    /// The connection attempt was accepted; not yet usable.
    Opened,
    /// The channel is up; carries the negotiated protocol version pair.
    Up { major_version: u8, minor_version: u8 },
    /// The driver swapped the underlying descriptor (e.g. protocol upgrade).
    /// Readiness interest must be re-registered.
    FdChange,
    /// The channel is ready for admin-domain traffic.
    Ready,
    /// The channel dropped; the driver will retry on its own.
    DownReconnecting,
    /// The channel dropped for good.
    Down,
    /// A non-fatal driver condition worth logging.
    Warning(String),
}

/// One event returned by [`Transport::poll`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A channel lifecycle change.
    Channel {
        channel: ChannelId,
        event: ChannelEventKind,
    },
    /// A decoded inbound message. `token` is the opaque reference attached
    /// on submit for this stream; the session routes by it, never by handle.
    Message {
        channel: ChannelId,
        token: u64,
        msg: Msg,
    },
}

/// The transport driver contract.
///
/// Implementations are single-threaded from the session's point of view:
/// every call happens on the thread currently driving the session.
pub trait Transport: Send {
    /// Initiates one connection attempt for the configured endpoint.
    fn connect(&mut self, config: &ChannelConfig) -> Result<ChannelId, SessionError>;

    /// Applies one tuning knob to a live channel.
    fn ioctl(&mut self, channel: ChannelId, code: IoctlCode, value: i32)
    -> Result<(), SessionError>;

    /// Registers the channel's readiness source with the driver's selector.
    fn register_interest(&mut self, channel: ChannelId) -> Result<(), SessionError>;

    /// Removes the channel's readiness source.
    fn deregister_interest(&mut self, channel: ChannelId) -> Result<(), SessionError>;

    /// Submits an outbound message, associating `token` with the message's
    /// stream so inbound traffic on that stream carries it back.
    fn submit(&mut self, channel: ChannelId, msg: &Msg, token: u64) -> Result<(), SessionError>;

    /// Closes the channel and releases driver resources.
    fn close(&mut self, channel: ChannelId) -> Result<(), SessionError>;

    /// Blocks up to `timeout` (or not at all for `Duration::ZERO`) waiting
    /// for readiness, then returns the pending events in driver order.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, SessionError>;
}
