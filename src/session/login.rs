// src/session/login.rs

//! The login stream: one shared admin stream per channel, fanned out to
//! every login subscriber, driving the session bootstrap forward.

use super::{DeliveryMsg, Session, SessionState};
use crate::config::LoginConfig;
use crate::core::protocol::{
    DataState, DomainType, LoginAttrib, Msg, MsgKey, Payload, RefreshMsg, RequestMsg, State,
    StatusMsg, StreamState, LOGIN_STREAM_ID,
};
use crate::transport::ChannelId;
use tracing::{debug, info, warn};

/// Routing token of the login stream.
pub(crate) const LOGIN_TOKEN: u64 = LOGIN_STREAM_ID as u64;

/// Shared login stream state: the subscriber set and the last refresh, kept
/// for replay to late subscribers.
pub(crate) struct LoginState {
    pub subscribers: Vec<usize>,
    pub last_refresh: Option<RefreshMsg>,
    pub(crate) user_name: String,
    attrib: LoginAttrib,
}

impl LoginState {
    pub(crate) fn new(config: &LoginConfig) -> Self {
        Self {
            subscribers: Vec::new(),
            last_refresh: None,
            user_name: config.user_name.clone(),
            attrib: LoginAttrib {
                application_id: config.application_id.clone(),
                position: config.position.clone(),
            },
        }
    }

    pub(crate) fn request(&self) -> RequestMsg {
        RequestMsg {
            stream_id: LOGIN_STREAM_ID,
            key: MsgKey::with_name(&self.user_name),
            streaming: true,
            batch_names: Vec::new(),
            payload: Payload::Login(self.attrib.clone()),
        }
    }
}

impl Session {
    /// Opens the login stream on a freshly up channel. Sent at most once per
    /// connection attempt.
    pub(crate) fn send_login_request(&mut self, channel: ChannelId) {
        let Some(entry) = self.channels.by_id_mut(channel) else {
            return;
        };
        if entry.login_sent {
            return;
        }
        entry.login_sent = true;
        let name = entry.name.clone();
        let request = self.login.request();
        debug!(
            "Sending login request for user '{}' on channel '{name}'",
            self.login.user_name
        );
        if let Err(e) = self
            .transport
            .submit(channel, &Msg::Request(DomainType::Login, request), LOGIN_TOKEN)
        {
            self.close_channel(channel, &format!("login request submit failed: {e}"));
        }
    }

    /// Handles an inbound message routed by the login token.
    pub(crate) fn process_login_msg(&mut self, channel: ChannelId, msg: Msg) {
        match msg {
            Msg::Refresh(_, refresh) => self.on_login_refresh(channel, refresh),
            Msg::Status(_, status) => self.on_login_status(channel, status),
            Msg::Generic(_, generic) => self.fan_out_login(DeliveryMsg::Generic(generic)),
            Msg::Ack(_, ack) => self.fan_out_login(DeliveryMsg::Ack(ack)),
            other => {
                debug!("Ignoring {} message on the login stream", other.name());
            }
        }
    }

    fn on_login_refresh(&mut self, channel: ChannelId, refresh: RefreshMsg) {
        let state = refresh.state.clone();
        info!("Login stream on channel {channel}: {state}");
        self.login.last_refresh = Some(refresh.clone());
        self.fan_out_login(DeliveryMsg::Refresh(refresh));
        self.apply_login_state(channel, state);
    }

    fn on_login_status(&mut self, channel: ChannelId, status: StatusMsg) {
        let state = status.state.clone();
        self.fan_out_login(DeliveryMsg::Status(status));
        if let Some(state) = state {
            info!("Login stream status on channel {channel}: {state}");
            self.apply_login_state(channel, state);
        }
    }

    /// Advances or degrades the session state from a login stream state. A
    /// non-open login stream tears the channel down; login subscribers are
    /// removed after the already queued deliveries.
    fn apply_login_state(&mut self, channel: ChannelId, state: State) {
        if state.stream_state == StreamState::Open {
            if state.data_state == DataState::Suspect {
                self.set_state(SessionState::LoginStreamOpenSuspect);
            } else {
                self.set_state(SessionState::LoginStreamOpenOk);
                self.send_directory_request(channel);
            }
            return;
        }
        warn!("Login stream is no longer open: {state}");
        self.set_state(SessionState::ChannelUpStreamNotOpen);
        let subscribers = std::mem::take(&mut self.login.subscribers);
        for slot in subscribers {
            self.timeouts.cancel_slot(slot);
            self.registry.remove(slot);
        }
        self.close_channel(channel, "login stream closed");
    }

    /// Queues one delivery per login subscriber, in registration order.
    pub(crate) fn fan_out_login(&mut self, msg: DeliveryMsg) {
        for slot in self.login.subscribers.clone() {
            self.push_delivery(slot, msg.clone());
        }
    }

    /// Delivers a synthetic login status carrying the given state. The
    /// subscriber set is left untouched.
    pub(crate) fn broadcast_login_status(&mut self, state: State) {
        if self.login.subscribers.is_empty() {
            return;
        }
        let status = StatusMsg {
            stream_id: LOGIN_STREAM_ID,
            key: MsgKey::with_name(&self.login.user_name),
            state: Some(state),
        };
        self.fan_out_login(DeliveryMsg::Status(status));
    }

    /// A channel became ready again after the session already bootstrapped.
    pub(crate) fn on_login_channel_ready(&mut self, channel: ChannelId) {
        debug!("Channel {channel} ready");
        self.broadcast_login_status(State::open_ok());
    }

    /// Replays the stored login refresh to one late subscriber.
    pub(crate) fn replay_login_refresh(&mut self, slot: usize) {
        if let Some(refresh) = self.login.last_refresh.clone() {
            self.push_delivery(slot, DeliveryMsg::Refresh(refresh));
        }
    }
}
