// src/session/items.rs

//! The item registry: the arena of live subscriptions, the handle map for
//! outbound API calls, and the type-keyed slot pools for reuse.
//!
//! Inbound routing never goes through the handle map; it resolves the
//! transport-attached token (the arena slot index offset by
//! [`TOKEN_BASE`]). Handles are monotonically generated and never reissued.

use super::dictionary::{DICTIONARY_VERBOSITY_NORMAL, ENUM_DICTIONARY_TOKEN, FIELD_DICTIONARY_TOKEN};
use super::directory::{DIRECTORY_TOKEN, SERVICE_INFO_FILTER, SERVICE_STATE_FILTER};
use super::login::LOGIN_TOKEN;
use super::timeout::TimeoutTask;
use super::{ClientRef, DeliveryMsg, Session};
use crate::core::client::{Handle, ItemClient, ItemEvent};
use crate::core::errors::SessionError;
use crate::core::protocol::{
    CloseMsg, DomainType, GenericMsg, Msg, MsgKey, PostMsg, RequestMsg, State, StatusMsg,
    StreamState, DICTIONARY_RWFENUM, DICTIONARY_RWFFLD, DIRECTORY_STREAM_ID,
    ENUM_DICTIONARY_STREAM_ID, FIELD_DICTIONARY_STREAM_ID, LOGIN_STREAM_ID,
};
use crate::transport::ChannelId;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Tokens below this value are reserved for admin streams (login 1,
/// directory 2, dictionaries 3 and 4); item tokens are `TOKEN_BASE + slot`.
pub(crate) const TOKEN_BASE: u64 = 16;

/// State of a plain single-stream subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SingleState {
    pub name: Option<String>,
    pub service_id: Option<u16>,
    pub service_name: Option<String>,
    pub channel: Option<ChannelId>,
    /// Arena slot of the owning batch, if this single came from a batch
    /// expansion. Non-owning back-reference.
    pub parent_batch: Option<usize>,
}

/// State of a batch registration: one wire request, many logical streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct BatchState {
    pub sub_items: Vec<usize>,
    pub base_stream_id: i32,
    /// Sub-items not yet individually closed. The batch returns to its pool
    /// exactly when this reaches zero.
    pub live_count: usize,
    pub channel: Option<ChannelId>,
}

/// State of a dictionary subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DictionaryItemState {
    pub name: String,
    pub filter: u32,
    /// Multi-part encode cursor: current field id (field dictionary) or
    /// table position (enum dictionary).
    pub cursor: i32,
    /// True when served by local re-encode rather than wire traffic.
    pub served_locally: bool,
    pub channel: Option<ChannelId>,
    /// Set when a deferred removal is already scheduled.
    pub pending_remove: bool,
}

/// The per-variant state of an item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ItemKind {
    Single(SingleState),
    Batch(BatchState),
    Login,
    Directory { channel: Option<ChannelId> },
    Dictionary(DictionaryItemState),
}

impl ItemKind {
    fn pool_key(&self) -> PoolKey {
        match self {
            ItemKind::Single(_) => PoolKey::Single,
            ItemKind::Batch(_) => PoolKey::Batch,
            ItemKind::Login => PoolKey::Login,
            ItemKind::Directory { .. } => PoolKey::Directory,
            ItemKind::Dictionary(_) => PoolKey::Dictionary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PoolKey {
    Single,
    Batch,
    Login,
    Directory,
    Dictionary,
}

/// One live subscription.
pub(crate) struct Item {
    pub handle: Handle,
    /// 0 until a wire stream is assigned, then channel-scoped.
    pub stream_id: i32,
    pub domain: DomainType,
    pub client: Arc<dyn ItemClient>,
    pub closure: Option<Arc<dyn Any + Send + Sync>>,
    pub kind: ItemKind,
}

impl Item {
    pub(crate) fn event(&self) -> ItemEvent {
        ItemEvent::new(self.handle, self.domain, self.closure.clone())
    }
}

/// Handle→item registry with arena storage and type-keyed slot reuse.
pub(crate) struct ItemRegistry {
    slots: Vec<Option<Item>>,
    pools: HashMap<PoolKey, Vec<usize>>,
    handle_map: HashMap<Handle, usize>,
    next_handle: u64,
}

impl ItemRegistry {
    pub(crate) fn new(item_count_hint: usize) -> Self {
        Self {
            slots: Vec::with_capacity(item_count_hint),
            pools: HashMap::new(),
            handle_map: HashMap::with_capacity(item_count_hint),
            next_handle: 0,
        }
    }

    /// Mints the next handle. Values only ever increase; a removed handle's
    /// numeric value is never reissued.
    pub(crate) fn next_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::new(self.next_handle)
    }

    /// Inserts a fully constructed item, reusing a pooled slot of the same
    /// type when one is available. Every field of a reused slot is
    /// overwritten by the new item, so a reused slot is indistinguishable
    /// from a fresh one.
    pub(crate) fn insert(&mut self, item: Item) -> usize {
        let handle = item.handle;
        let key = item.kind.pool_key();
        let slot = match self.pools.get_mut(&key).and_then(Vec::pop) {
            Some(slot) => {
                self.slots[slot] = Some(item);
                slot
            }
            None => {
                self.slots.push(Some(item));
                self.slots.len() - 1
            }
        };
        self.handle_map.insert(handle, slot);
        trace!("Added item {handle} to item map (slot {slot})");
        slot
    }

    /// Removes the item: drops it from the handle map and returns the slot
    /// to its type-specific pool. Returns the removed item so the caller can
    /// release its stream id and deliver any final callbacks.
    pub(crate) fn remove(&mut self, slot: usize) -> Option<Item> {
        let item = self.slots.get_mut(slot)?.take()?;
        self.handle_map.remove(&item.handle);
        self.pools
            .entry(item.kind.pool_key())
            .or_default()
            .push(slot);
        trace!(
            "Removed item {} of stream id {} from item map",
            item.handle, item.stream_id
        );
        Some(item)
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Item> {
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut Item> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Resolves a handle for an outbound API call.
    pub(crate) fn slot_of_handle(&self, handle: Handle) -> Option<usize> {
        self.handle_map.get(&handle).copied()
    }

    /// Resolves a transport routing token to a slot.
    pub(crate) fn slot_of_token(&self, token: u64) -> Option<usize> {
        if token < TOKEN_BASE {
            return None;
        }
        let slot = (token - TOKEN_BASE) as usize;
        self.slots.get(slot)?.as_ref().map(|_| slot)
    }

    /// The routing token attached to submissions for this slot.
    pub(crate) fn token_of_slot(slot: usize) -> u64 {
        TOKEN_BASE + slot as u64
    }

    /// Number of live items reachable through the handle map.
    pub(crate) fn len(&self) -> usize {
        self.handle_map.len()
    }

    /// Slots of all live items, in slot order.
    pub(crate) fn live_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Slots of live items bound to the given channel (singles, directory
    /// items and dictionary items; login items are session-wide).
    pub(crate) fn slots_on_channel(&self, channel: ChannelId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let item = s.as_ref()?;
                let bound = match &item.kind {
                    ItemKind::Single(state) => state.channel == Some(channel),
                    ItemKind::Batch(state) => state.channel == Some(channel),
                    ItemKind::Directory { channel: ch } => *ch == Some(channel),
                    ItemKind::Dictionary(state) => state.channel == Some(channel),
                    ItemKind::Login => false,
                };
                bound.then_some(i)
            })
            .collect()
    }
}

/// How a request's service reference resolved against the directory cache.
enum ServiceResolution {
    Resolved(ChannelId, u16),
    /// The named service is unknown or not usable; carries the status text
    /// for the deferred closed-status callback.
    Unknown(String),
    Unspecified,
}

/// Snapshot of the fields a close needs, taken before any mutation.
enum CloseAction {
    Plain,
    Dictionary {
        pending: bool,
    },
    Single {
        channel: Option<ChannelId>,
        stream_id: i32,
        domain: DomainType,
    },
    Batch {
        sub_items: Vec<usize>,
    },
}

/// The key echoed on synthetic status messages for an item.
fn item_key(item: &Item) -> MsgKey {
    match &item.kind {
        ItemKind::Single(state) => MsgKey {
            name: state.name.clone(),
            service_id: state.service_id,
            service_name: state.service_name.clone(),
            filter: None,
        },
        ItemKind::Dictionary(state) => MsgKey {
            name: Some(state.name.clone()),
            service_id: None,
            service_name: None,
            filter: Some(state.filter),
        },
        _ => MsgKey::default(),
    }
}

impl Session {
    /// Opens a subscription and returns its handle. The handle is valid
    /// immediately, even when the request cannot currently be resolved; in
    /// that case a closed status arrives through a deferred callback.
    pub fn register_client(
        &mut self,
        request: RequestMsg,
        domain: DomainType,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        match domain {
            DomainType::Login => self.register_login(client, closure),
            DomainType::Source => self.register_directory(client, closure),
            DomainType::Dictionary => self.register_dictionary(request, client, closure),
            _ if request.batch_names.is_empty() => {
                self.register_single(domain, request, client, closure)
            }
            _ => self.register_batch(domain, request, client, closure),
        }
    }

    fn register_login(
        &mut self,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        let handle = self.registry.next_handle();
        let slot = self.registry.insert(Item {
            handle,
            stream_id: LOGIN_STREAM_ID,
            domain: DomainType::Login,
            client,
            closure,
            kind: ItemKind::Login,
        });
        self.login.subscribers.push(slot);
        // A late subscriber gets the stored refresh through a zero-delay
        // task, never synchronously inside this call.
        if self.login.last_refresh.is_some() {
            self.timeouts
                .schedule(Duration::ZERO, TimeoutTask::LoginReplay { slot });
        }
        Ok(handle)
    }

    fn register_directory(
        &mut self,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        let channels: Vec<ChannelId> = self.channels.active.iter().map(|c| c.id).collect();
        let mut first: Option<Handle> = None;
        if channels.is_empty() {
            let handle = self.registry.next_handle();
            let slot = self.registry.insert(Item {
                handle,
                stream_id: DIRECTORY_STREAM_ID,
                domain: DomainType::Source,
                client,
                closure,
                kind: ItemKind::Directory { channel: None },
            });
            self.directory.subscribers.push(slot);
            return Ok(handle);
        }
        for channel in channels {
            let handle = self.registry.next_handle();
            let slot = self.registry.insert(Item {
                handle,
                stream_id: DIRECTORY_STREAM_ID,
                domain: DomainType::Source,
                client: client.clone(),
                closure: closure.clone(),
                kind: ItemKind::Directory {
                    channel: Some(channel),
                },
            });
            self.directory.subscribers.push(slot);
            first.get_or_insert(handle);
        }
        first.ok_or_else(|| SessionError::Internal("directory registration yielded no handle".to_string()))
    }

    fn register_dictionary(
        &mut self,
        request: RequestMsg,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        let Some(name) = request.key.name.clone() else {
            return self.usage_error(
                "Dictionary request must name \"RWFFld\" or \"RWFEnum\".".to_string(),
            );
        };
        if name != DICTIONARY_RWFFLD && name != DICTIONARY_RWFENUM {
            return self.usage_error(format!(
                "Invalid dictionary name '{name}'. Dictionary requests must name \"RWFFld\" or \"RWFEnum\"."
            ));
        }
        let filter = request.key.filter.unwrap_or(DICTIONARY_VERBOSITY_NORMAL);
        let is_field = name == DICTIONARY_RWFFLD;
        let stream_id = if is_field {
            FIELD_DICTIONARY_STREAM_ID
        } else {
            ENUM_DICTIONARY_STREAM_ID
        };

        if request.key.service_name.is_some() || request.key.service_id.is_some() {
            return match self.resolve_service(&request.key) {
                ServiceResolution::Resolved(channel, service_id) => {
                    let handle = self.registry.next_handle();
                    let slot = self.registry.insert(Item {
                        handle,
                        stream_id,
                        domain: DomainType::Dictionary,
                        client,
                        closure,
                        kind: ItemKind::Dictionary(DictionaryItemState {
                            name,
                            filter,
                            cursor: 0,
                            served_locally: false,
                            channel: Some(channel),
                            pending_remove: false,
                        }),
                    });
                    if let Some(dict) = self.dictionaries.for_channel(channel) {
                        dict.listeners.push(slot);
                    }
                    let token = ItemRegistry::token_of_slot(slot);
                    let mut wire = request;
                    wire.stream_id = stream_id;
                    wire.key.service_id = Some(service_id);
                    wire.key.filter = Some(filter);
                    if let Err(e) =
                        self.transport
                            .submit(channel, &Msg::Request(DomainType::Dictionary, wire), token)
                    {
                        if let Some(dict) = self.dictionaries.for_channel(channel) {
                            dict.listeners.retain(|s| *s != slot);
                        }
                        self.registry.remove(slot);
                        return Err(SessionError::SubmitFailed {
                            stream_id,
                            text: e.to_string(),
                        });
                    }
                    Ok(handle)
                }
                ServiceResolution::Unknown(text) => {
                    self.insert_unresolved_dictionary(name, filter, stream_id, client, closure, text)
                }
                ServiceResolution::Unspecified => self.usage_error(
                    "Passed in request message does not identify any service.".to_string(),
                ),
            };
        }

        // No service named: serve from a resident dictionary by deferred
        // multi-part re-encode.
        let Some(dict) = self.dictionaries.resident_dictionary() else {
            return self.usage_error(
                "Dictionary request without a service requires a resident dictionary.".to_string(),
            );
        };
        let cursor = if is_field { dict.min_fid() } else { 0 };
        let handle = self.registry.next_handle();
        let slot = self.registry.insert(Item {
            handle,
            stream_id,
            domain: DomainType::Dictionary,
            client,
            closure,
            kind: ItemKind::Dictionary(DictionaryItemState {
                name,
                filter,
                cursor,
                served_locally: true,
                channel: None,
                pending_remove: false,
            }),
        });
        self.timeouts
            .schedule(Duration::ZERO, TimeoutTask::DictionaryEncodeContinue { slot });
        Ok(handle)
    }

    fn insert_unresolved_dictionary(
        &mut self,
        name: String,
        filter: u32,
        stream_id: i32,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
        text: String,
    ) -> Result<Handle, SessionError> {
        let handle = self.registry.next_handle();
        let slot = self.registry.insert(Item {
            handle,
            stream_id,
            domain: DomainType::Dictionary,
            client,
            closure,
            kind: ItemKind::Dictionary(DictionaryItemState {
                name,
                filter,
                cursor: 0,
                served_locally: false,
                channel: None,
                pending_remove: false,
            }),
        });
        self.timeouts.schedule(
            self.config.request_timeout,
            TimeoutTask::ItemClosedStatus { slot, text },
        );
        Ok(handle)
    }

    fn register_single(
        &mut self,
        domain: DomainType,
        request: RequestMsg,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        match self.resolve_service(&request.key) {
            ServiceResolution::Resolved(channel, service_id) => {
                let stream_id = {
                    let Some(entry) = self.channels.by_id_mut(channel) else {
                        return self.usage_error(format!(
                            "Service channel {channel} is no longer active."
                        ));
                    };
                    entry.streams.alloc()?
                };
                let handle = self.registry.next_handle();
                let slot = self.registry.insert(Item {
                    handle,
                    stream_id,
                    domain,
                    client,
                    closure,
                    kind: ItemKind::Single(SingleState {
                        name: request.key.name.clone(),
                        service_id: Some(service_id),
                        service_name: request.key.service_name.clone(),
                        channel: Some(channel),
                        parent_batch: None,
                    }),
                });
                let token = ItemRegistry::token_of_slot(slot);
                let mut wire = request;
                wire.stream_id = stream_id;
                wire.key.service_id = Some(service_id);
                if let Err(e) =
                    self.transport
                        .submit(channel, &Msg::Request(domain, wire), token)
                {
                    self.registry.remove(slot);
                    if let Some(entry) = self.channels.by_id_mut(channel) {
                        entry.streams.release(stream_id);
                    }
                    return Err(SessionError::SubmitFailed {
                        stream_id,
                        text: e.to_string(),
                    });
                }
                Ok(handle)
            }
            ServiceResolution::Unknown(text) => {
                // The handle is minted now; the stream never opens and a
                // closed status arrives through the timeout queue.
                let handle = self.registry.next_handle();
                let slot = self.registry.insert(Item {
                    handle,
                    stream_id: 0,
                    domain,
                    client,
                    closure,
                    kind: ItemKind::Single(SingleState {
                        name: request.key.name.clone(),
                        service_id: request.key.service_id,
                        service_name: request.key.service_name.clone(),
                        channel: None,
                        parent_batch: None,
                    }),
                });
                self.timeouts.schedule(
                    self.config.request_timeout,
                    TimeoutTask::ItemClosedStatus { slot, text },
                );
                Ok(handle)
            }
            ServiceResolution::Unspecified => self.usage_error(
                "Passed in request message does not identify any service.".to_string(),
            ),
        }
    }

    fn register_batch(
        &mut self,
        domain: DomainType,
        request: RequestMsg,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        let names = request.batch_names.clone();
        match self.resolve_service(&request.key) {
            ServiceResolution::Resolved(channel, service_id) => {
                // One id for the batch stream itself plus one per item.
                let base = {
                    let Some(entry) = self.channels.by_id_mut(channel) else {
                        return self.usage_error(format!(
                            "Service channel {channel} is no longer active."
                        ));
                    };
                    entry.streams.alloc_range(names.len() as i32 + 1)?
                };
                let batch_handle = self.registry.next_handle();
                let batch_slot = self.registry.insert(Item {
                    handle: batch_handle,
                    stream_id: base,
                    domain,
                    client: client.clone(),
                    closure: closure.clone(),
                    kind: ItemKind::Batch(BatchState {
                        sub_items: Vec::new(),
                        base_stream_id: base,
                        live_count: names.len(),
                        channel: Some(channel),
                    }),
                });
                let mut sub_items = Vec::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    let handle = self.registry.next_handle();
                    let slot = self.registry.insert(Item {
                        handle,
                        stream_id: base + 1 + i as i32,
                        domain,
                        client: client.clone(),
                        closure: closure.clone(),
                        kind: ItemKind::Single(SingleState {
                            name: Some(name.clone()),
                            service_id: Some(service_id),
                            service_name: request.key.service_name.clone(),
                            channel: Some(channel),
                            parent_batch: Some(batch_slot),
                        }),
                    });
                    sub_items.push(slot);
                }
                if let Some(item) = self.registry.get_mut(batch_slot) {
                    if let ItemKind::Batch(batch) = &mut item.kind {
                        batch.sub_items = sub_items.clone();
                    }
                }

                let token = ItemRegistry::token_of_slot(batch_slot);
                let mut wire = request;
                wire.stream_id = base;
                wire.key.service_id = Some(service_id);
                if let Err(e) =
                    self.transport
                        .submit(channel, &Msg::Request(domain, wire), token)
                {
                    // The expansion is atomic: every item and every stream id
                    // of the range is taken back.
                    for slot in sub_items {
                        self.registry.remove(slot);
                    }
                    self.registry.remove(batch_slot);
                    if let Some(entry) = self.channels.by_id_mut(channel) {
                        for i in 0..=names.len() as i32 {
                            entry.streams.release(base + i);
                        }
                    }
                    return Err(SessionError::SubmitFailed {
                        stream_id: base,
                        text: e.to_string(),
                    });
                }
                Ok(batch_handle)
            }
            ServiceResolution::Unknown(text) => {
                let handle = self.registry.next_handle();
                let slot = self.registry.insert(Item {
                    handle,
                    stream_id: 0,
                    domain,
                    client,
                    closure,
                    kind: ItemKind::Batch(BatchState::default()),
                });
                self.timeouts.schedule(
                    self.config.request_timeout,
                    TimeoutTask::ItemClosedStatus { slot, text },
                );
                Ok(handle)
            }
            ServiceResolution::Unspecified => self.usage_error(
                "Passed in request message does not identify any service.".to_string(),
            ),
        }
    }

    fn resolve_service(&self, key: &MsgKey) -> ServiceResolution {
        if let Some(name) = &key.service_name {
            return match self.directory.cache.by_name(name) {
                Some(service) if service.is_usable() => {
                    ServiceResolution::Resolved(service.channel, service.id)
                }
                _ => ServiceResolution::Unknown(format!("Service name of '{name}' is not found.")),
            };
        }
        if let Some(id) = key.service_id {
            return match self.directory.cache.by_id(id) {
                Some(service) if service.is_usable() => {
                    ServiceResolution::Resolved(service.channel, service.id)
                }
                _ => ServiceResolution::Unknown(format!("Service id of '{id}' is not found.")),
            };
        }
        ServiceResolution::Unspecified
    }

    /// Modifies an open subscription: changed priority, pause, or view. Batch
    /// streams cannot be reissued; login and dictionary reissues must keep
    /// their identity.
    pub fn reissue(&mut self, handle: Handle, request: RequestMsg) -> Result<(), SessionError> {
        let Some(slot) = self.registry.slot_of_handle(handle) else {
            return self.handle_error(handle);
        };
        let token = ItemRegistry::token_of_slot(slot);
        let (kind, stream_id, domain) = {
            let Some(item) = self.registry.get(slot) else {
                return self.handle_error(handle);
            };
            (item.kind.clone(), item.stream_id, item.domain)
        };
        match kind {
            ItemKind::Batch(_) => {
                self.usage_error("Invalid attempt to reissue a batch stream.".to_string())
            }
            ItemKind::Login => {
                if let Some(name) = &request.key.name {
                    if *name != self.login.user_name {
                        return self.usage_error(
                            "Invalid attempt to reissue the login stream with a different user name."
                                .to_string(),
                        );
                    }
                }
                let channels: Vec<ChannelId> = self
                    .channels
                    .active
                    .iter()
                    .filter(|c| c.up)
                    .map(|c| c.id)
                    .collect();
                for channel in channels {
                    let mut wire = self.login.request();
                    wire.streaming = request.streaming;
                    if let Err(e) = self.transport.submit(
                        channel,
                        &Msg::Request(DomainType::Login, wire),
                        LOGIN_TOKEN,
                    ) {
                        self.close_channel(channel, &format!("login reissue submit failed: {e}"));
                    }
                }
                Ok(())
            }
            ItemKind::Directory { channel } => {
                let channels: Vec<ChannelId> = match channel {
                    Some(channel) => vec![channel],
                    None => self.channels.active.iter().map(|c| c.id).collect(),
                };
                let filter = request
                    .key
                    .filter
                    .unwrap_or(SERVICE_INFO_FILTER | SERVICE_STATE_FILTER);
                for channel in channels {
                    let wire = RequestMsg {
                        stream_id: DIRECTORY_STREAM_ID,
                        key: MsgKey {
                            filter: Some(filter),
                            ..Default::default()
                        },
                        streaming: true,
                        batch_names: Vec::new(),
                        payload: Default::default(),
                    };
                    if let Err(e) = self.transport.submit(
                        channel,
                        &Msg::Request(DomainType::Source, wire),
                        DIRECTORY_TOKEN,
                    ) {
                        self.close_channel(channel, &format!("directory reissue submit failed: {e}"));
                    }
                }
                Ok(())
            }
            ItemKind::Dictionary(state) => {
                if let Some(name) = &request.key.name {
                    if *name != state.name {
                        return self.usage_error(
                            "Invalid attempt to reissue a dictionary stream with a different name."
                                .to_string(),
                        );
                    }
                }
                if state.served_locally {
                    // Restart the local encode from the first part.
                    let Some(dict) = self.dictionaries.resident_dictionary() else {
                        return self.usage_error(
                            "Dictionary stream can no longer be served locally.".to_string(),
                        );
                    };
                    let cursor = if state.name == DICTIONARY_RWFFLD {
                        dict.min_fid()
                    } else {
                        0
                    };
                    if let Some(item) = self.registry.get_mut(slot) {
                        if let ItemKind::Dictionary(state) = &mut item.kind {
                            state.cursor = cursor;
                        }
                    }
                    self.timeouts
                        .schedule(Duration::ZERO, TimeoutTask::DictionaryEncodeContinue { slot });
                    return Ok(());
                }
                let Some(channel) = state.channel else {
                    return self
                        .usage_error("Attempt to reissue an item stream that is not open.".to_string());
                };
                let mut wire = request;
                wire.stream_id = stream_id;
                self.transport
                    .submit(channel, &Msg::Request(DomainType::Dictionary, wire), token)
                    .map_err(|e| SessionError::SubmitFailed {
                        stream_id,
                        text: e.to_string(),
                    })
            }
            ItemKind::Single(state) => {
                let Some(channel) = state.channel else {
                    return self
                        .usage_error("Attempt to reissue an item stream that is not open.".to_string());
                };
                let mut wire = request;
                wire.stream_id = stream_id;
                wire.key.service_id = state.service_id;
                self.transport
                    .submit(channel, &Msg::Request(domain, wire), token)
                    .map_err(|e| SessionError::SubmitFailed {
                        stream_id,
                        text: e.to_string(),
                    })
            }
        }
    }

    /// Closes a subscription: close message first (when a wire stream was
    /// ever assigned), then handle-map removal, stream-id release and slot
    /// pooling.
    pub fn unregister(&mut self, handle: Handle) -> Result<(), SessionError> {
        let Some(slot) = self.registry.slot_of_handle(handle) else {
            return self.handle_error(handle);
        };
        self.close_slot(slot);
        Ok(())
    }

    pub(crate) fn close_slot(&mut self, slot: usize) {
        let action = {
            let Some(item) = self.registry.get(slot) else {
                return;
            };
            match &item.kind {
                ItemKind::Login | ItemKind::Directory { .. } => CloseAction::Plain,
                ItemKind::Dictionary(state) => CloseAction::Dictionary {
                    pending: state.pending_remove,
                },
                ItemKind::Single(state) => CloseAction::Single {
                    channel: state.channel,
                    stream_id: item.stream_id,
                    domain: item.domain,
                },
                ItemKind::Batch(batch) => CloseAction::Batch {
                    sub_items: batch.sub_items.clone(),
                },
            }
        };
        match action {
            CloseAction::Plain => self.remove_and_release(slot),
            CloseAction::Dictionary { pending } => {
                if pending {
                    return;
                }
                if let Some(item) = self.registry.get_mut(slot) {
                    if let ItemKind::Dictionary(state) = &mut item.kind {
                        state.pending_remove = true;
                    }
                }
                // Stop any encode continuation, then let the item linger so
                // in-flight parts still find the slot.
                self.timeouts.cancel_slot(slot);
                self.timeouts.schedule(
                    self.config.dictionary_close_delay,
                    TimeoutTask::DictionaryItemRemove { slot },
                );
            }
            CloseAction::Single {
                channel,
                stream_id,
                domain,
            } => {
                if stream_id != 0 {
                    if let Some(channel) = channel {
                        let close = Msg::Close(domain, CloseMsg { stream_id });
                        let token = ItemRegistry::token_of_slot(slot);
                        if let Err(e) = self.transport.submit(channel, &close, token) {
                            warn!("Failed to submit close for stream {stream_id}: {e}");
                        }
                    }
                }
                self.remove_and_release(slot);
            }
            CloseAction::Batch { sub_items } => {
                if sub_items.is_empty() {
                    // An unresolved batch never expanded; the batch slot is
                    // the only record and must be removed directly.
                    self.remove_and_release(slot);
                    return;
                }
                for sub in sub_items {
                    if self.registry.get(sub).is_some() {
                        self.close_slot(sub);
                    }
                }
            }
        }
    }

    /// Removes the item from every index it participates in and releases its
    /// stream id back to the channel pool.
    pub(crate) fn remove_and_release(&mut self, slot: usize) {
        self.timeouts.cancel_slot(slot);
        let Some(item) = self.registry.remove(slot) else {
            return;
        };
        let channel = match &item.kind {
            ItemKind::Single(state) => state.channel,
            ItemKind::Batch(state) => state.channel,
            ItemKind::Directory { channel } => *channel,
            ItemKind::Dictionary(state) => state.channel,
            ItemKind::Login => None,
        };
        if let Some(channel) = channel {
            if let Some(entry) = self.channels.by_id_mut(channel) {
                entry.streams.release(item.stream_id);
            }
        }
        match item.kind {
            ItemKind::Login => self.login.subscribers.retain(|s| *s != slot),
            ItemKind::Directory { .. } => self.directory.subscribers.retain(|s| *s != slot),
            ItemKind::Dictionary(state) => {
                if let Some(channel) = state.channel {
                    if let Some(dict) = self.dictionaries.for_channel(channel) {
                        dict.listeners.retain(|s| *s != slot);
                    }
                }
            }
            ItemKind::Single(state) => {
                if let Some(parent) = state.parent_batch {
                    self.on_batch_sub_closed(parent);
                }
            }
            ItemKind::Batch(batch) => {
                // Sub-items outlive the batch; drop their back-references so
                // a reused batch slot is never decremented by them.
                for sub in batch.sub_items {
                    if let Some(sub_item) = self.registry.get_mut(sub) {
                        if let ItemKind::Single(state) = &mut sub_item.kind {
                            state.parent_batch = None;
                        }
                    }
                }
            }
        }
    }

    /// One sub-item of the batch closed; the batch itself pools exactly when
    /// the last one goes.
    fn on_batch_sub_closed(&mut self, batch_slot: usize) {
        let done = {
            let Some(item) = self.registry.get_mut(batch_slot) else {
                return;
            };
            let ItemKind::Batch(batch) = &mut item.kind else {
                return;
            };
            batch.live_count = batch.live_count.saturating_sub(1);
            batch.live_count == 0
        };
        if done {
            self.remove_and_release(batch_slot);
        }
    }

    /// Fires the deferred closed status for an unresolvable request, then
    /// removes the item.
    pub(crate) fn simulate_closed_status(&mut self, slot: usize, text: String) {
        let status = {
            let Some(item) = self.registry.get(slot) else {
                return;
            };
            StatusMsg {
                stream_id: item.stream_id,
                key: item_key(item),
                state: Some(State::closed_suspect(text)),
            }
        };
        self.push_delivery(slot, DeliveryMsg::Status(status));
        self.remove_and_release(slot);
    }

    /// Queues a synthetic status callback for the item.
    pub(crate) fn push_item_status(&mut self, slot: usize, state: State) {
        let status = {
            let Some(item) = self.registry.get(slot) else {
                return;
            };
            StatusMsg {
                stream_id: item.stream_id,
                key: item_key(item),
                state: Some(state),
            }
        };
        self.push_delivery(slot, DeliveryMsg::Status(status));
    }

    /// Final removal of a closed reserved-stream dictionary item after its
    /// grace period.
    pub(crate) fn remove_dictionary_item(&mut self, slot: usize) {
        let wire = {
            let Some(item) = self.registry.get(slot) else {
                return;
            };
            match &item.kind {
                ItemKind::Dictionary(state) if !state.served_locally => {
                    state.channel.map(|channel| (channel, item.stream_id))
                }
                _ => None,
            }
        };
        if let Some((channel, stream_id)) = wire {
            let close = Msg::Close(DomainType::Dictionary, CloseMsg { stream_id });
            let token = ItemRegistry::token_of_slot(slot);
            if let Err(e) = self.transport.submit(channel, &close, token) {
                warn!("Failed to submit dictionary close for stream {stream_id}: {e}");
            }
        }
        self.remove_and_release(slot);
    }

    /// Sends a generic message on an open item stream.
    pub fn submit_generic(&mut self, handle: Handle, mut msg: GenericMsg) -> Result<(), SessionError> {
        let Some(slot) = self.registry.slot_of_handle(handle) else {
            return self.handle_error(handle);
        };
        let (channel, stream_id, domain, token) = self.submit_target(slot)?;
        msg.stream_id = stream_id;
        self.transport
            .submit(channel, &Msg::Generic(domain, msg), token)
            .map_err(|e| SessionError::SubmitFailed {
                stream_id,
                text: e.to_string(),
            })
    }

    /// Sends a post message on an open item stream.
    pub fn submit_post(&mut self, handle: Handle, mut msg: PostMsg) -> Result<(), SessionError> {
        let Some(slot) = self.registry.slot_of_handle(handle) else {
            return self.handle_error(handle);
        };
        let (channel, stream_id, domain, token) = self.submit_target(slot)?;
        msg.stream_id = stream_id;
        self.transport
            .submit(channel, &Msg::Post(domain, msg), token)
            .map_err(|e| SessionError::SubmitFailed {
                stream_id,
                text: e.to_string(),
            })
    }

    fn submit_target(
        &mut self,
        slot: usize,
    ) -> Result<(ChannelId, i32, DomainType, u64), SessionError> {
        let target = {
            let Some(item) = self.registry.get(slot) else {
                return Err(SessionError::Internal("submit target slot vanished".to_string()));
            };
            match &item.kind {
                ItemKind::Single(state) => state
                    .channel
                    .map(|c| (c, item.stream_id, item.domain, ItemRegistry::token_of_slot(slot))),
                ItemKind::Login => self
                    .channels
                    .first_up()
                    .map(|c| (c.id, LOGIN_STREAM_ID, DomainType::Login, LOGIN_TOKEN)),
                ItemKind::Directory { channel } => channel
                    .or_else(|| self.channels.first_up().map(|c| c.id))
                    .map(|c| (c, DIRECTORY_STREAM_ID, DomainType::Source, DIRECTORY_TOKEN)),
                ItemKind::Dictionary(state) if !state.served_locally => state
                    .channel
                    .map(|c| (c, item.stream_id, item.domain, ItemRegistry::token_of_slot(slot))),
                ItemKind::Dictionary(_) | ItemKind::Batch(_) => None,
            }
        };
        match target {
            Some(target) => Ok(target),
            None => self.usage_error(
                "Attempt to submit a message on a stream that is not open.".to_string(),
            ),
        }
    }

    /// Routes one inbound item message by its transport token. Batch tokens
    /// re-resolve the target sub-item by stream offset.
    pub(crate) fn route_message(&mut self, channel: ChannelId, token: u64, msg: Msg) {
        match token {
            LOGIN_TOKEN => return self.process_login_msg(channel, msg),
            DIRECTORY_TOKEN => return self.process_directory_msg(channel, msg),
            FIELD_DICTIONARY_TOKEN | ENUM_DICTIONARY_TOKEN => {
                return self.process_dictionary_msg(channel, token, msg);
            }
            _ => {}
        }
        let Some(slot) = self.registry.slot_of_token(token) else {
            debug!(
                "Dropping inbound {} message with unknown token {token}",
                msg.name()
            );
            return;
        };
        let target = match self.registry.get(slot).map(|item| &item.kind) {
            Some(ItemKind::Batch(batch)) if msg.stream_id() != batch.base_stream_id => {
                let offset = msg.stream_id() - batch.base_stream_id - 1;
                match usize::try_from(offset).ok().and_then(|o| batch.sub_items.get(o)) {
                    Some(sub) => *sub,
                    None => {
                        debug!(
                            "Dropping inbound {} message for unknown batch stream {}",
                            msg.name(),
                            msg.stream_id()
                        );
                        return;
                    }
                }
            }
            Some(_) => slot,
            None => return,
        };
        self.deliver_item_msg(target, msg);
    }

    fn deliver_item_msg(&mut self, slot: usize, msg: Msg) {
        let closes_stream = match &msg {
            Msg::Refresh(_, m) => {
                !m.state.stream_state.is_open()
                    || (m.state.stream_state == StreamState::NonStreaming && m.complete)
            }
            Msg::Status(_, m) => m
                .state
                .as_ref()
                .is_some_and(|s| !s.stream_state.is_open()),
            _ => false,
        };
        match msg {
            Msg::Refresh(_, m) => self.push_delivery(slot, DeliveryMsg::Refresh(m)),
            Msg::Update(_, m) => self.push_delivery(slot, DeliveryMsg::Update(m)),
            Msg::Status(_, m) => self.push_delivery(slot, DeliveryMsg::Status(m)),
            Msg::Generic(_, m) => self.push_delivery(slot, DeliveryMsg::Generic(m)),
            Msg::Ack(_, m) => self.push_delivery(slot, DeliveryMsg::Ack(m)),
            other => {
                debug!("Ignoring inbound {} message on an item stream", other.name());
                return;
            }
        }
        if closes_stream {
            // The provider closed the stream; the item goes after the queued
            // delivery.
            self.remove_and_release(slot);
        }
    }
}
