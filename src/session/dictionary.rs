// src/session/dictionary.rs

//! Reference dictionaries: per-channel network download on the reserved
//! streams, a session-wide local dictionary, and the deferred multi-part
//! re-encode served to dictionary subscribers.

use super::items::ItemKind;
use super::timeout::TimeoutTask;
use super::{DeliveryMsg, Session};
use crate::core::protocol::{
    DataDictionary, DictionaryPayload, DomainType, EncodeResult, Msg, MsgKey, Payload, RefreshMsg,
    RequestMsg, State, DICTIONARY_RWFENUM, DICTIONARY_RWFFLD, ENUM_DICTIONARY_STREAM_ID,
    FIELD_DICTIONARY_STREAM_ID,
};
use crate::transport::ChannelId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routing token of the field dictionary stream.
pub(crate) const FIELD_DICTIONARY_TOKEN: u64 = FIELD_DICTIONARY_STREAM_ID as u64;
/// Routing token of the enum dictionary stream.
pub(crate) const ENUM_DICTIONARY_TOKEN: u64 = ENUM_DICTIONARY_STREAM_ID as u64;

/// Dictionary verbosity requested on download: full definitions.
pub const DICTIONARY_VERBOSITY_NORMAL: u32 = 0x07;

/// Download state of one channel's reference dictionary.
pub(crate) struct ChannelDictionary {
    pub channel: ChannelId,
    /// Accumulates multi-part download payloads until both dictionaries are
    /// complete.
    building: DataDictionary,
    pub resident: Option<Arc<DataDictionary>>,
    field_loaded: bool,
    enum_loaded: bool,
    /// True when the resident dictionary came from local files rather than
    /// a download.
    local: bool,
    pub downloading: bool,
    /// Slots of dictionary items subscribed to this channel's download.
    pub listeners: Vec<usize>,
}

impl ChannelDictionary {
    pub(crate) fn is_ready(&self) -> bool {
        self.local || (self.field_loaded && self.enum_loaded)
    }
}

/// All dictionary state of the session: one entry per channel plus the
/// optional local dictionary shared by every channel.
pub(crate) struct DictionaryManager {
    list: Vec<ChannelDictionary>,
    local: Option<Arc<DataDictionary>>,
}

impl DictionaryManager {
    pub(crate) fn new() -> Self {
        Self {
            list: Vec::new(),
            local: None,
        }
    }

    /// Installs the dictionary loaded from local files at bootstrap. Every
    /// channel created afterwards starts ready.
    pub(crate) fn install_local(&mut self, dict: DataDictionary) {
        self.local = Some(Arc::new(dict));
    }

    /// Creates the dictionary entry for a new channel and returns its index.
    pub(crate) fn dictionary_for_new_channel(&mut self, channel: ChannelId) -> usize {
        self.list.push(ChannelDictionary {
            channel,
            building: DataDictionary::new(),
            resident: self.local.clone(),
            field_loaded: false,
            enum_loaded: false,
            local: self.local.is_some(),
            downloading: false,
            listeners: Vec::new(),
        });
        self.list.len() - 1
    }

    pub(crate) fn any_ready(&self) -> bool {
        self.local.is_some() || self.list.iter().any(ChannelDictionary::is_ready)
    }

    pub(crate) fn for_channel(&mut self, channel: ChannelId) -> Option<&mut ChannelDictionary> {
        self.list.iter_mut().find(|d| d.channel == channel)
    }

    /// Drops partial download state when a channel goes away. A completed
    /// resident dictionary is kept; it stays valid for local re-encode.
    pub(crate) fn on_channel_closed(&mut self, channel: ChannelId) {
        if let Some(dict) = self.for_channel(channel) {
            dict.downloading = false;
            dict.listeners.clear();
            if !dict.is_ready() {
                dict.building = DataDictionary::new();
                dict.field_loaded = false;
                dict.enum_loaded = false;
            }
        }
    }

    /// The dictionary used to serve subscribers locally: the file-loaded one
    /// when present, otherwise any completed download.
    pub(crate) fn resident_dictionary(&self) -> Option<Arc<DataDictionary>> {
        if let Some(local) = &self.local {
            return Some(local.clone());
        }
        self.list.iter().find_map(|d| d.resident.clone())
    }
}

impl Session {
    /// Starts a dictionary download on the channel once a usable service
    /// appears, unless one is already resident or in flight.
    pub(crate) fn request_dictionaries_if_needed(
        &mut self,
        channel: ChannelId,
        usable_services: &[u16],
    ) {
        use crate::config::DictionarySource;
        if !matches!(self.config.dictionary, DictionarySource::Network) {
            return;
        }
        let Some(&service_id) = usable_services.first() else {
            return;
        };
        match self.dictionaries.for_channel(channel) {
            Some(dict) if !dict.is_ready() && !dict.downloading => {}
            _ => return,
        }
        self.download_dictionaries(channel, service_id);
    }

    /// Submits the field and enum dictionary requests on their reserved
    /// streams.
    pub(crate) fn download_dictionaries(&mut self, channel: ChannelId, service_id: u16) {
        if let Some(dict) = self.dictionaries.for_channel(channel) {
            dict.downloading = true;
        }
        info!("Downloading dictionaries from service id {service_id} on channel {channel}");
        let requests = [
            (
                FIELD_DICTIONARY_STREAM_ID,
                DICTIONARY_RWFFLD,
                FIELD_DICTIONARY_TOKEN,
            ),
            (
                ENUM_DICTIONARY_STREAM_ID,
                DICTIONARY_RWFENUM,
                ENUM_DICTIONARY_TOKEN,
            ),
        ];
        for (stream_id, name, token) in requests {
            let request = RequestMsg {
                stream_id,
                key: MsgKey {
                    name: Some(name.to_string()),
                    service_id: Some(service_id),
                    service_name: None,
                    filter: Some(DICTIONARY_VERBOSITY_NORMAL),
                },
                streaming: false,
                batch_names: Vec::new(),
                payload: Payload::None,
            };
            if let Err(e) =
                self.transport
                    .submit(channel, &Msg::Request(DomainType::Dictionary, request), token)
            {
                self.close_channel(channel, &format!("dictionary request submit failed: {e}"));
                return;
            }
        }
    }

    /// Handles an inbound message routed by a dictionary token.
    pub(crate) fn process_dictionary_msg(&mut self, channel: ChannelId, token: u64, msg: Msg) {
        match msg {
            Msg::Refresh(_, refresh) => self.on_dictionary_refresh(channel, token, refresh),
            Msg::Status(_, status) => {
                let state = status.state.clone();
                let listeners = self
                    .dictionaries
                    .for_channel(channel)
                    .map(|d| d.listeners.clone())
                    .unwrap_or_default();
                for slot in listeners {
                    self.push_delivery(slot, DeliveryMsg::Status(status.clone()));
                }
                if let Some(state) = state {
                    if !state.stream_state.is_open() {
                        // The download is not retried; items fall back to a
                        // later channel or a local dictionary.
                        warn!("Dictionary download stream closed on channel {channel}: {state}");
                        if let Some(dict) = self.dictionaries.for_channel(channel) {
                            dict.downloading = false;
                        }
                    }
                }
            }
            other => {
                debug!("Ignoring {} message on a dictionary stream", other.name());
            }
        }
    }

    fn on_dictionary_refresh(&mut self, channel: ChannelId, token: u64, refresh: RefreshMsg) {
        let complete = refresh.complete;
        let listeners = {
            let Some(dict) = self.dictionaries.for_channel(channel) else {
                return;
            };
            if let Payload::Dictionary(payload) = &refresh.payload {
                match payload {
                    DictionaryPayload::Fields(fields) => dict.building.add_fields(fields.clone()),
                    DictionaryPayload::EnumTables(tables) => {
                        dict.building.add_enum_tables(tables.clone())
                    }
                }
            }
            if complete {
                if token == FIELD_DICTIONARY_TOKEN {
                    dict.field_loaded = true;
                    debug!(
                        "Field dictionary complete on channel {channel}: {} entries",
                        dict.building.entry_count()
                    );
                } else {
                    dict.enum_loaded = true;
                    debug!(
                        "Enum dictionary complete on channel {channel}: {} tables",
                        dict.building.enum_table_count()
                    );
                }
                if dict.field_loaded && dict.enum_loaded {
                    // Freeze: the building copy becomes the immutable
                    // resident dictionary.
                    dict.resident = Some(Arc::new(std::mem::take(&mut dict.building)));
                    dict.downloading = false;
                    info!("Dictionary download complete on channel {channel}");
                }
            }
            dict.listeners.clone()
        };
        // Forward the part to every wire dictionary subscriber, re-targeted
        // onto each item's own stream.
        for slot in listeners {
            if self
                .registry
                .get(slot)
                .is_some_and(|item| item.stream_id == refresh.stream_id)
            {
                self.push_delivery(slot, DeliveryMsg::Refresh(refresh.clone()));
            }
        }
    }

    /// Encodes and delivers the next part of a locally served dictionary
    /// item, rescheduling itself until the final part.
    pub(crate) fn continue_local_encode(&mut self, slot: usize) {
        let Some(dict) = self.dictionaries.resident_dictionary() else {
            return;
        };
        let Some(item) = self.registry.get_mut(slot) else {
            return;
        };
        let stream_id = item.stream_id;
        let ItemKind::Dictionary(state) = &mut item.kind else {
            return;
        };
        let name = state.name.clone();
        let filter = state.filter;
        let is_field = name == DICTIONARY_RWFFLD;

        // The first-part flag is derived from the cursor position, never
        // tracked separately.
        let first_part = if is_field {
            state.cursor == dict.min_fid()
        } else {
            state.cursor == 0
        };
        let (payload, result) = if is_field {
            dict.encode_field_part(&mut state.cursor)
        } else {
            dict.encode_enum_part(&mut state.cursor)
        };
        let complete = result == EncodeResult::Success;

        let refresh = RefreshMsg {
            stream_id,
            key: MsgKey {
                name: Some(name),
                service_id: None,
                service_name: None,
                filter: Some(filter),
            },
            state: State::open_ok(),
            solicited: true,
            complete,
            clear_cache: first_part,
            payload: Payload::Dictionary(payload),
        };
        self.push_delivery(slot, DeliveryMsg::Refresh(refresh));

        if !complete {
            self.timeouts.schedule(
                self.config.dictionary_part_delay,
                TimeoutTask::DictionaryEncodeContinue { slot },
            );
        }
    }
}
