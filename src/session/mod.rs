// src/session/mod.rs

//! The session: lifecycle state machine, public API surface, and the glue
//! between the per-domain managers.

use crate::config::{DictionarySource, SessionConfig};
use crate::core::client::{ErrorClient, ItemClient};
use crate::core::errors::SessionError;
use crate::core::protocol::DataDictionary;
use crate::transport::Transport;
use std::sync::Arc;
use strum::Display;
use tracing::{debug, info};

pub mod channel;
pub mod dictionary;
pub mod directory;
pub mod dispatch;
pub mod items;
pub mod login;
pub mod pump;
pub mod stream_id;
pub mod timeout;

// Handle and the callback types live next to the traits; re-exported here
// because the session mints and consumes them.
pub use crate::core::client::{Handle, ItemEvent};
pub use dispatch::DispatchResult;
pub use pump::SharedSession;

pub(crate) use channel::ChannelSet;
pub(crate) use dictionary::DictionaryManager;
pub(crate) use directory::DirectoryState;
pub(crate) use dispatch::{Delivery, DeliveryMsg};
pub(crate) use items::ItemRegistry;
pub(crate) use login::LoginState;
pub(crate) use timeout::TimeoutQueue;

/// The session lifecycle. States only ever advance along the bootstrap
/// sequence (login before directory) and fall back to `ChannelDown` on
/// connectivity loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum SessionState {
    Uninitialized,
    /// Bootstrap ran: configuration validated, local dictionary loaded,
    /// connection attempts issued.
    Initialized,
    ChannelDown,
    ChannelUp,
    /// The channel is up but the login stream was denied or closed.
    ChannelUpStreamNotOpen,
    LoginStreamOpenSuspect,
    LoginStreamOpenOk,
    DirectoryStreamOpenSuspect,
    DirectoryStreamOpenOk,
}

/// One client/server session: a failover group of channels multiplexing many
/// logical subscriptions over shared login/directory/dictionary streams.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) registry: ItemRegistry,
    pub(crate) channels: ChannelSet,
    pub(crate) login: LoginState,
    pub(crate) directory: DirectoryState,
    pub(crate) dictionaries: DictionaryManager,
    pub(crate) error_client: Option<Arc<dyn ErrorClient>>,
    pub(crate) deliveries: Vec<Delivery>,
}

impl Session {
    /// Bootstraps a session: validates the configured channels, loads a
    /// local dictionary when one is configured (a load failure is fatal),
    /// and issues one connection attempt per configured endpoint.
    pub fn initialize(
        config: SessionConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, SessionError> {
        if config.channels.is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "At least one channel must be configured".to_string(),
            ));
        }
        // Unsupported connection kinds are rejected before any connect
        // attempt is made.
        channel::validate_channel_kinds(&config.channels)?;

        let mut session = Self {
            state: SessionState::Uninitialized,
            transport,
            timeouts: TimeoutQueue::new(),
            registry: ItemRegistry::new(config.item_count_hint),
            channels: ChannelSet::new(),
            login: LoginState::new(&config.login),
            directory: DirectoryState::new(config.service_count_hint),
            dictionaries: DictionaryManager::new(),
            error_client: None,
            deliveries: Vec::new(),
            config,
        };

        if let DictionarySource::File {
            field_dictionary_path,
            enum_type_path,
        } = session.config.dictionary.clone()
        {
            let mut dict = DataDictionary::new();
            dict.load_field_dictionary(&field_dictionary_path)?;
            dict.load_enum_type_dictionary(&enum_type_path)?;
            info!(
                "Loaded local dictionary: {} fields, {} enum tables",
                dict.entry_count(),
                dict.enum_table_count()
            );
            session.dictionaries.install_local(dict);
        }

        session.connect_channels()?;
        session.state = SessionState::Initialized;
        debug!("Session '{}' initialized", session.config.name);
        Ok(session)
    }

    /// Registers a callback sink for usage errors. When set, usage errors
    /// are routed to it in addition to the returned `Err`.
    pub fn set_error_client(&mut self, client: Arc<dyn ErrorClient>) {
        self.error_client = Some(client);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn instance_name(&self) -> &str {
        &self.config.name
    }

    /// Number of items currently reachable through the handle map.
    pub fn item_count(&self) -> usize {
        self.registry.len()
    }

    /// True once a reference dictionary is fully loaded (both field and enum
    /// parts of a network download, or a local-file dictionary).
    pub fn is_dictionary_ready(&self) -> bool {
        self.dictionaries.any_ready()
    }

    /// Closes every channel and drops the session back to `Uninitialized`.
    /// Items are removed without further callbacks.
    pub fn uninitialize(&mut self) {
        let ids: Vec<_> = self.channels.active.iter().map(|c| c.id).collect();
        for id in ids {
            let _ = self.transport.deregister_interest(id);
            let _ = self.transport.close(id);
        }
        self.channels.active.clear();
        for slot in self.registry.live_slots() {
            self.timeouts.cancel_slot(slot);
            self.registry.remove(slot);
        }
        self.login.subscribers.clear();
        self.directory.subscribers.clear();
        self.state = SessionState::Uninitialized;
        info!("Session '{}' uninitialized", self.config.name);
    }

    // --- internal helpers shared by the per-domain managers ---

    /// Queues a callback delivery for the item in `slot`. Deliveries are
    /// performed after all registry mutation of the current pump iteration.
    pub(crate) fn push_delivery(&mut self, slot: usize, msg: DeliveryMsg) {
        if let Some(item) = self.registry.get(slot) {
            self.deliveries.push(Delivery {
                client: item.client.clone(),
                event: item.event(),
                msg,
            });
        }
    }

    /// Reports a usage error: routed to the error client when one is
    /// registered, and always returned to the caller.
    pub(crate) fn usage_error<T>(&self, text: String) -> Result<T, SessionError> {
        tracing::error!("{text} Instance name='{}'.", self.config.name);
        if let Some(client) = &self.error_client {
            client.on_invalid_usage(&text);
        }
        Err(SessionError::InvalidUsage(text))
    }

    /// Reports an invalid handle the same way.
    pub(crate) fn handle_error<T>(&self, handle: Handle) -> Result<T, SessionError> {
        let text = format!("Attempt to use invalid Handle {handle}.");
        tracing::error!("{text} Instance name='{}'.", self.config.name);
        if let Some(client) = &self.error_client {
            client.on_invalid_handle(handle, &text);
        }
        Err(SessionError::InvalidHandle(handle.as_u64()))
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {} -> {}", self.state, state);
            self.state = state;
        }
    }
}

/// Shared reference to an application callback implementation.
pub type ClientRef = Arc<dyn ItemClient>;
