// src/config.rs

//! Typed session and channel parameters.
//!
//! Loading and parsing configuration files is a collaborator's concern; this
//! module only defines the already-validated parameter structs the session
//! consumes. The structs are serde-ready so the external loader can
//! deserialize straight into them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The kind of physical connection a channel uses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    #[default]
    Socket,
    EncryptedSocket,
    WebSocket,
    /// Present for configuration compatibility; this session does not
    /// support it and rejects it before any connect attempt.
    SeqMulticast,
}

/// Parameters of one physical connection attempt.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ChannelKind,
    pub address: String,

    /// Transport send buffer size in bytes. `0` keeps the driver default.
    #[serde(default)]
    pub sys_send_buf_size: i32,
    /// Transport receive buffer size in bytes. `0` keeps the driver default.
    #[serde(default)]
    pub sys_recv_buf_size: i32,
    /// Messages larger than this are compressed. `0` keeps the driver default.
    #[serde(default)]
    pub compression_threshold: i32,
    /// Outbound queue size that triggers a flush. `0` disables the mark.
    #[serde(default)]
    pub high_water_mark: i32,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Socket,
            address: address.into(),
            sys_send_buf_size: 0,
            sys_recv_buf_size: 0,
            compression_threshold: 0,
            high_water_mark: 0,
        }
    }
}

/// Whether the session drives consumer or provider streams. Chosen at
/// construction; it selects the sign of minted stream ids and the usage-error
/// routing strategy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionRole {
    #[default]
    Consumer,
    Provider,
}

/// Where the reference dictionary comes from.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DictionarySource {
    /// Download from the network once a usable service is seen.
    #[default]
    Network,
    /// Load from local files at bootstrap; a load failure is fatal.
    File {
        field_dictionary_path: PathBuf,
        enum_type_path: PathBuf,
    },
}

/// Identity fields carried on the login request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginConfig {
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_application_id")]
    pub application_id: String,
    #[serde(default = "default_position")]
    pub position: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            application_id: default_application_id(),
            position: default_position(),
        }
    }
}

/// The complete, validated parameter set for one session instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_instance_name")]
    pub name: String,
    #[serde(default)]
    pub role: SessionRole,
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub dictionary: DictionarySource,

    /// Sizing hint for the handle map.
    #[serde(default = "default_item_count_hint")]
    pub item_count_hint: usize,
    /// Sizing hint for the directory cache.
    #[serde(default = "default_service_count_hint")]
    pub service_count_hint: usize,

    /// Delay before a deferred closed-status callback is delivered.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Delay between multi-part dictionary encode continuations.
    #[serde(default = "default_dictionary_part_delay", with = "humantime_serde")]
    pub dictionary_part_delay: Duration,
    /// Grace period before a closed reserved-stream dictionary item is
    /// removed and pooled.
    #[serde(default = "default_dictionary_close_delay", with = "humantime_serde")]
    pub dictionary_close_delay: Duration,
    /// Upper bound one background pump iteration blocks waiting for
    /// readiness.
    #[serde(default = "default_pump_timeout", with = "humantime_serde")]
    pub pump_timeout: Duration,
}

impl SessionConfig {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            name: default_instance_name(),
            role: SessionRole::Consumer,
            channels,
            login: LoginConfig::default(),
            dictionary: DictionarySource::Network,
            item_count_hint: default_item_count_hint(),
            service_count_hint: default_service_count_hint(),
            request_timeout: default_request_timeout(),
            dictionary_part_delay: default_dictionary_part_delay(),
            dictionary_close_delay: default_dictionary_close_delay(),
            pump_timeout: default_pump_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "Session_1".to_string()
}

fn default_user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "user".to_string())
}

fn default_application_id() -> String {
    "256".to_string()
}

fn default_position() -> String {
    "localhost".to_string()
}

fn default_item_count_hint() -> usize {
    1024
}

fn default_service_count_hint() -> usize {
    513
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_dictionary_part_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_dictionary_close_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_pump_timeout() -> Duration {
    Duration::from_millis(1000)
}
