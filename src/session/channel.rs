// src/session/channel.rs

//! Channel lifecycle: connection attempts, transport tuning on `Up`,
//! readiness registration, and close/removal back to the channel pool.

use super::stream_id::StreamIdPool;
use super::{Session, SessionState};
use crate::config::{ChannelConfig, ChannelKind, SessionRole};
use crate::core::errors::SessionError;
use crate::core::protocol::State;
use crate::transport::{ChannelEventKind, ChannelId, IoctlCode};
use tracing::{debug, error, info, warn};

/// One physical connection attempt.
pub(crate) struct ChannelEntry {
    pub name: String,
    pub id: ChannelId,
    pub config: ChannelConfig,
    pub major_version: u8,
    pub minor_version: u8,
    /// Index of this channel's dictionary in the dictionary manager.
    pub dictionary: usize,
    pub streams: StreamIdPool,
    pub login_sent: bool,
    pub directory_sent: bool,
    pub up: bool,
}

impl ChannelEntry {
    fn reset(&mut self, config: ChannelConfig, id: ChannelId, dictionary: usize, role: SessionRole) {
        self.name = config.name.clone();
        self.id = id;
        self.config = config;
        self.major_version = 0;
        self.minor_version = 0;
        self.dictionary = dictionary;
        self.streams = StreamIdPool::new(role);
        self.login_sent = false;
        self.directory_sent = false;
        self.up = false;
    }
}

/// The active channel list plus the pool of released channel objects.
pub(crate) struct ChannelSet {
    pub active: Vec<ChannelEntry>,
    pool: Vec<ChannelEntry>,
    /// Set once on the first `Ready` of the session; later `Ready` events
    /// are ordinary per-channel events.
    pub bootstrap_ready: bool,
}

impl ChannelSet {
    pub(crate) fn new() -> Self {
        Self {
            active: Vec::new(),
            pool: Vec::new(),
            bootstrap_ready: false,
        }
    }

    /// Takes a channel object from the pool (fully reset) or constructs a
    /// fresh one.
    pub(crate) fn acquire(
        &mut self,
        config: ChannelConfig,
        id: ChannelId,
        dictionary: usize,
        role: SessionRole,
    ) -> ChannelEntry {
        match self.pool.pop() {
            Some(mut entry) => {
                entry.reset(config, id, dictionary, role);
                entry
            }
            None => ChannelEntry {
                name: config.name.clone(),
                id,
                config,
                major_version: 0,
                minor_version: 0,
                dictionary,
                streams: StreamIdPool::new(role),
                login_sent: false,
                directory_sent: false,
                up: false,
            },
        }
    }

    /// Removes the channel from the active list and returns its object to
    /// the pool.
    pub(crate) fn release(&mut self, id: ChannelId) {
        if let Some(pos) = self.active.iter().position(|c| c.id == id) {
            let entry = self.active.remove(pos);
            self.pool.push(entry);
        }
    }

    pub(crate) fn by_id(&self, id: ChannelId) -> Option<&ChannelEntry> {
        self.active.iter().find(|c| c.id == id)
    }

    pub(crate) fn by_id_mut(&mut self, id: ChannelId) -> Option<&mut ChannelEntry> {
        self.active.iter_mut().find(|c| c.id == id)
    }

    pub(crate) fn first_up(&self) -> Option<&ChannelEntry> {
        self.active.iter().find(|c| c.up)
    }
}

/// Rejects connection kinds the session does not support. Runs before any
/// connect attempt so a bad configuration never half-connects.
pub(crate) fn validate_channel_kinds(channels: &[ChannelConfig]) -> Result<(), SessionError> {
    for cfg in channels {
        if cfg.kind == ChannelKind::SeqMulticast {
            return Err(SessionError::InvalidConfiguration(format!(
                "Channel '{}' uses unsupported connection kind {:?}",
                cfg.name, cfg.kind
            )));
        }
    }
    Ok(())
}

impl Session {
    /// Builds one connection attempt per configured endpoint.
    pub(crate) fn connect_channels(&mut self) -> Result<(), SessionError> {
        for cfg in self.config.channels.clone() {
            let id = self.transport.connect(&cfg)?;
            let dictionary = self.dictionaries.dictionary_for_new_channel(id);
            let entry = self
                .channels
                .acquire(cfg, id, dictionary, self.config.role);
            info!(
                "Created channel '{}' ({}) for session '{}'",
                entry.name, entry.id, self.config.name
            );
            self.channels.active.push(entry);
        }
        Ok(())
    }

    /// Entry point for driver channel events, called from the dispatch loop.
    pub(crate) fn on_channel_event(&mut self, channel: ChannelId, event: ChannelEventKind) {
        match event {
            ChannelEventKind::Opened => {
                debug!("Channel {channel} opened");
            }
            ChannelEventKind::Up {
                major_version,
                minor_version,
            } => self.on_channel_up(channel, major_version, minor_version),
            ChannelEventKind::FdChange => self.on_channel_fd_change(channel),
            ChannelEventKind::Ready => self.on_channel_ready(channel),
            ChannelEventKind::DownReconnecting => self.on_channel_down(channel, true),
            ChannelEventKind::Down => self.on_channel_down(channel, false),
            ChannelEventKind::Warning(text) => {
                warn!("Channel {channel} warning: {text}");
            }
        }
    }

    fn on_channel_up(&mut self, channel: ChannelId, major_version: u8, minor_version: u8) {
        let Some(entry) = self.channels.by_id_mut(channel) else {
            warn!("Up event for unknown channel {channel}, ignored");
            return;
        };
        entry.up = true;
        entry.major_version = major_version;
        entry.minor_version = minor_version;
        let cfg = entry.config.clone();
        let name = entry.name.clone();
        info!("Channel '{name}' is up, protocol version {major_version}.{minor_version}");

        // Transport-level tuning. Any failure is fatal to this channel; the
        // tune is not retried.
        let tunings = [
            (IoctlCode::SystemWriteBuffers, cfg.sys_send_buf_size),
            (IoctlCode::SystemReadBuffers, cfg.sys_recv_buf_size),
            (IoctlCode::CompressionThreshold, cfg.compression_threshold),
            (IoctlCode::HighWaterMark, cfg.high_water_mark),
        ];
        for (code, value) in tunings {
            if value <= 0 {
                continue;
            }
            if let Err(e) = self.transport.ioctl(channel, code, value) {
                error!("Failed to set {code}={value} on channel '{name}': {e}");
                self.close_channel(channel, "transport tuning failed");
                return;
            }
        }

        // Initial readiness registration is fatal to channel bring-up when
        // it fails.
        if let Err(e) = self.transport.register_interest(channel) {
            error!("Failed to register channel '{name}' with the readiness selector: {e}");
            self.close_channel(channel, "selector registration failed");
            return;
        }

        self.set_state(SessionState::ChannelUp);
        self.send_login_request(channel);
    }

    /// The driver swapped the underlying descriptor; re-register the
    /// readiness source while preserving the channel's logical identity.
    fn on_channel_fd_change(&mut self, channel: ChannelId) {
        if let Err(e) = self.transport.deregister_interest(channel) {
            warn!("Failed to deregister channel {channel} on fd change: {e}");
        }
        if let Err(e) = self.transport.register_interest(channel) {
            warn!("Failed to re-register channel {channel} on fd change: {e}");
        }
        debug!("Channel {channel} re-registered after fd change");
    }

    fn on_channel_ready(&mut self, channel: ChannelId) {
        if !self.channels.bootstrap_ready {
            // Only the first Ready of the session triggers session-level
            // admin handling; further Ready events are per-channel.
            self.channels.bootstrap_ready = true;
            debug!("Channel {channel} ready, session bootstrap readiness marked");
        } else {
            self.on_login_channel_ready(channel);
        }
    }

    /// Shared down path. A reconnecting drop keeps items open with a
    /// suspect status; a final drop removes every item bound to the channel
    /// and returns the channel object to the pool.
    pub(crate) fn on_channel_down(&mut self, channel: ChannelId, reconnecting: bool) {
        let name = self
            .channels
            .by_id(channel)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| channel.to_string());
        if reconnecting {
            warn!("Channel '{name}' down, driver is reconnecting");
        } else {
            warn!("Channel '{name}' down");
        }
        if let Some(entry) = self.channels.by_id_mut(channel) {
            entry.up = false;
        }
        // The session only degrades when no other channel remains up.
        if self.channels.first_up().is_none() {
            self.set_state(SessionState::ChannelDown);
        }

        self.broadcast_login_status(if reconnecting {
            State::open_suspect("channel down, reconnecting")
        } else {
            State::closed_recover_suspect("channel down")
        });

        let slots = self.registry.slots_on_channel(channel);
        if reconnecting {
            for slot in slots {
                self.push_item_status(slot, State::open_suspect("channel down, reconnecting"));
            }
            return;
        }

        for slot in slots {
            self.push_item_status(slot, State::closed_recover_suspect("channel down"));
            self.remove_and_release(slot);
        }

        let _ = self.transport.deregister_interest(channel);
        let _ = self.transport.close(channel);
        self.dictionaries.on_channel_closed(channel);
        self.channels.release(channel);
    }

    /// Closes one channel because of a local failure (tuning, registration,
    /// or a fatal admin stream state).
    pub(crate) fn close_channel(&mut self, channel: ChannelId, reason: &str) {
        warn!("Closing channel {channel}: {reason}");
        self.on_channel_down(channel, false);
    }
}
