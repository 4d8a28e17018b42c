// src/session/directory.rs

//! The source directory stream and its service cache.
//!
//! The cache is dual-indexed: requests name a service either by id or by
//! name, so both lookups must stay consistent across every merge, including
//! a service renaming itself in an update.

use super::{DeliveryMsg, Session, SessionState};
use crate::core::protocol::{
    DomainType, Msg, MsgKey, Payload, RefreshMsg, RequestMsg, ServiceAction, ServiceInfo,
    ServiceUpdate, StatusMsg, DIRECTORY_STREAM_ID,
};
use crate::transport::ChannelId;
use bitflags::bitflags;
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Routing token of the source directory stream.
pub(crate) const DIRECTORY_TOKEN: u64 = DIRECTORY_STREAM_ID as u64;

/// Directory filter bits requested on the admin stream.
pub const SERVICE_INFO_FILTER: u32 = 0x01;
pub const SERVICE_STATE_FILTER: u32 = 0x02;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ServiceFlags: u8 {
        const UP = 0b001;
        const ACCEPTING_REQUESTS = 0b010;
        const DELETED = 0b100;
    }
}

/// One cached service.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Service {
    pub id: u16,
    pub info: ServiceInfo,
    pub flags: ServiceFlags,
    pub channel: ChannelId,
}

impl Service {
    /// A service takes item requests only while up, accepting and not
    /// deleted.
    pub(crate) fn is_usable(&self) -> bool {
        self.flags
            .contains(ServiceFlags::UP | ServiceFlags::ACCEPTING_REQUESTS)
            && !self.flags.contains(ServiceFlags::DELETED)
    }
}

/// The service cache: arena storage indexed by id and by name.
pub(crate) struct DirectoryCache {
    entries: Vec<Option<Service>>,
    by_id: HashMap<u16, usize>,
    by_name: IndexMap<String, usize>,
}

impl DirectoryCache {
    pub(crate) fn new(service_count_hint: usize) -> Self {
        Self {
            entries: Vec::with_capacity(service_count_hint),
            by_id: HashMap::with_capacity(service_count_hint),
            by_name: IndexMap::with_capacity(service_count_hint),
        }
    }

    pub(crate) fn by_id(&self, id: u16) -> Option<&Service> {
        self.entries.get(*self.by_id.get(&id)?)?.as_ref()
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<&Service> {
        self.entries.get(*self.by_name.get(name)?)?.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Applies one directory payload to the cache. Returns the ids of
    /// services that became usable by this merge.
    pub(crate) fn merge(
        &mut self,
        updates: &[ServiceUpdate],
        channel: ChannelId,
    ) -> Vec<u16> {
        let mut became_usable = Vec::new();
        for update in updates {
            let was_usable = self.by_id(update.id).is_some_and(Service::is_usable);
            match update.action {
                ServiceAction::Add => self.apply_add(update, channel),
                ServiceAction::Update => self.apply_update(update),
                ServiceAction::Delete => self.apply_delete(update.id),
                ServiceAction::Unknown(code) => {
                    warn!(
                        "Unknown directory action code {code} for service id {}, ignored",
                        update.id
                    );
                    continue;
                }
            }
            let usable = self.by_id(update.id).is_some_and(Service::is_usable);
            if usable && !was_usable {
                became_usable.push(update.id);
            }
        }
        became_usable
    }

    fn apply_add(&mut self, update: &ServiceUpdate, channel: ChannelId) {
        let Some(info) = &update.info else {
            warn!("Directory add for service id {} carries no info, ignored", update.id);
            return;
        };
        // A name being re-announced under a different id evicts the stale
        // entry so the name index never points at two services.
        if let Some(&stale) = self.by_name.get(&info.name) {
            let stale_id = self.entries[stale].as_ref().map(|s| s.id);
            if stale_id != Some(update.id) {
                if let Some(stale_id) = stale_id {
                    self.by_id.remove(&stale_id);
                }
                self.by_name.swap_remove(&info.name);
                self.entries[stale] = None;
            }
        }

        let mut flags = ServiceFlags::empty();
        if let Some(state) = update.state {
            flags.set(ServiceFlags::UP, state.service_up);
            flags.set(ServiceFlags::ACCEPTING_REQUESTS, state.accepting_requests);
        }
        let service = Service {
            id: update.id,
            info: info.clone(),
            flags,
            channel,
        };

        match self.by_id.get(&update.id).copied() {
            Some(idx) => {
                // Re-add of a known id: the name index may need re-keying.
                if let Some(old) = &self.entries[idx] {
                    if old.info.name != info.name {
                        self.by_name.swap_remove(&old.info.name);
                    }
                }
                self.by_name.insert(info.name.clone(), idx);
                self.entries[idx] = Some(service);
            }
            None => {
                let idx = self.entries.len();
                self.entries.push(Some(service));
                self.by_id.insert(update.id, idx);
                self.by_name.insert(info.name.clone(), idx);
                debug!("Directory added service '{}' (id {})", info.name, update.id);
            }
        }
    }

    fn apply_update(&mut self, update: &ServiceUpdate) {
        let Some(&idx) = self.by_id.get(&update.id) else {
            warn!("Directory update for unknown service id {}, ignored", update.id);
            return;
        };
        let Some(service) = self.entries[idx].as_mut() else {
            return;
        };
        if let Some(info) = &update.info {
            if service.info.name != info.name {
                // Atomic re-key: the old name disappears in the same merge
                // step that introduces the new one.
                let old = std::mem::replace(&mut service.info, info.clone());
                self.by_name.swap_remove(&old.name);
                self.by_name.insert(info.name.clone(), idx);
            } else {
                service.info = info.clone();
            }
        }
        if let Some(state) = update.state {
            service.flags.set(ServiceFlags::UP, state.service_up);
            service
                .flags
                .set(ServiceFlags::ACCEPTING_REQUESTS, state.accepting_requests);
        }
    }

    fn apply_delete(&mut self, id: u16) {
        let Some(&idx) = self.by_id.get(&id) else {
            warn!("Directory delete for unknown service id {id}, ignored");
            return;
        };
        // Deletion marks the entry; both indexes keep resolving it so late
        // requests get a deterministic not-usable answer instead of a miss.
        if let Some(service) = self.entries[idx].as_mut() {
            service.flags.insert(ServiceFlags::DELETED);
            info!("Directory deleted service '{}' (id {id})", service.info.name);
        }
    }
}

/// Directory stream state: the cache plus the subscriber set.
pub(crate) struct DirectoryState {
    pub cache: DirectoryCache,
    pub subscribers: Vec<usize>,
}

impl DirectoryState {
    pub(crate) fn new(service_count_hint: usize) -> Self {
        Self {
            cache: DirectoryCache::new(service_count_hint),
            subscribers: Vec::new(),
        }
    }
}

impl Session {
    /// Opens the directory stream once login is established on the channel.
    pub(crate) fn send_directory_request(&mut self, channel: ChannelId) {
        let Some(entry) = self.channels.by_id_mut(channel) else {
            return;
        };
        if entry.directory_sent {
            return;
        }
        entry.directory_sent = true;
        let request = RequestMsg {
            stream_id: DIRECTORY_STREAM_ID,
            key: MsgKey {
                filter: Some(SERVICE_INFO_FILTER | SERVICE_STATE_FILTER),
                ..Default::default()
            },
            streaming: true,
            batch_names: Vec::new(),
            payload: Payload::None,
        };
        debug!("Sending directory request on channel {channel}");
        if let Err(e) = self.transport.submit(
            channel,
            &Msg::Request(DomainType::Source, request),
            DIRECTORY_TOKEN,
        ) {
            self.close_channel(channel, &format!("directory request submit failed: {e}"));
        }
    }

    /// Handles an inbound message routed by the directory token.
    pub(crate) fn process_directory_msg(&mut self, channel: ChannelId, msg: Msg) {
        match msg {
            Msg::Refresh(_, refresh) => self.on_directory_refresh(channel, refresh),
            Msg::Update(_, update) => {
                let usable = match &update.payload {
                    Payload::Services(updates) => self.directory.cache.merge(updates, channel),
                    _ => Vec::new(),
                };
                self.fan_out_directory(DeliveryMsg::Update(update));
                self.request_dictionaries_if_needed(channel, &usable);
            }
            Msg::Status(_, status) => self.on_directory_status(channel, status),
            Msg::Generic(_, generic) => self.fan_out_directory(DeliveryMsg::Generic(generic)),
            other => {
                debug!("Ignoring {} message on the directory stream", other.name());
            }
        }
    }

    fn on_directory_refresh(&mut self, channel: ChannelId, refresh: RefreshMsg) {
        let state = refresh.state.clone();
        if !state.stream_state.is_open() {
            warn!("Directory stream is no longer open: {state}");
            self.fan_out_directory(DeliveryMsg::Refresh(refresh));
            self.close_channel(channel, "directory stream closed");
            return;
        }
        let usable = match &refresh.payload {
            Payload::Services(updates) => self.directory.cache.merge(updates, channel),
            _ => Vec::new(),
        };
        info!(
            "Directory refresh on channel {channel}: {} services cached",
            self.directory.cache.len()
        );
        self.fan_out_directory(DeliveryMsg::Refresh(refresh));
        if state.data_state == crate::core::protocol::DataState::Suspect {
            self.set_state(SessionState::DirectoryStreamOpenSuspect);
        } else {
            self.set_state(SessionState::DirectoryStreamOpenOk);
        }
        self.request_dictionaries_if_needed(channel, &usable);
    }

    fn on_directory_status(&mut self, channel: ChannelId, status: StatusMsg) {
        let state = status.state.clone();
        self.fan_out_directory(DeliveryMsg::Status(status));
        let Some(state) = state else { return };
        if !state.stream_state.is_open() {
            warn!("Directory stream is no longer open: {state}");
            self.close_channel(channel, "directory stream closed");
        } else if state.data_state == crate::core::protocol::DataState::Suspect {
            self.set_state(SessionState::DirectoryStreamOpenSuspect);
        }
    }

    /// Queues one delivery per directory subscriber, in registration order.
    fn fan_out_directory(&mut self, msg: DeliveryMsg) {
        for slot in self.directory.subscribers.clone() {
            self.push_delivery(slot, msg.clone());
        }
    }
}
