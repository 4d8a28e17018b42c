// src/core/protocol/mod.rs

//! The in-memory message envelope model exchanged with the transport driver.
//!
//! The wire representation of these messages belongs to the codec, which is a
//! collaborator of this crate. The session layer only routes and inspects the
//! decoded envelopes defined here.

use bytes::Bytes;
use strum::Display;

pub mod dictionary;
pub mod state;

pub use dictionary::{DataDictionary, DictionaryPayload, EncodeResult, FieldDef};
pub use state::{DataState, State, StateCode, StreamState};

/// Reserved stream id of the login stream.
pub const LOGIN_STREAM_ID: i32 = 1;
/// Reserved stream id of the source directory stream.
pub const DIRECTORY_STREAM_ID: i32 = 2;
/// Default stream id of the field dictionary stream.
pub const FIELD_DICTIONARY_STREAM_ID: i32 = 3;
/// Default stream id of the enum dictionary stream.
pub const ENUM_DICTIONARY_STREAM_ID: i32 = 4;

/// Well-known name of the field definition dictionary.
pub const DICTIONARY_RWFFLD: &str = "RWFFld";
/// Well-known name of the enum type dictionary.
pub const DICTIONARY_RWFENUM: &str = "RWFEnum";

/// The message domain a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DomainType {
    Login,
    Source,
    Dictionary,
    MarketPrice,
    MarketByOrder,
    MarketByPrice,
    SymbolList,
}

/// The key identifying the requested instrument or admin stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgKey {
    pub name: Option<String>,
    pub service_id: Option<u16>,
    pub service_name: Option<String>,
    /// Filter bits, used by dictionary requests to select verbosity.
    pub filter: Option<u32>,
}

impl MsgKey {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// The payload carried by a message, already decoded by the codec.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    None,
    /// An opaque application payload the session does not inspect.
    Opaque(Bytes),
    /// One part of a field or enum dictionary download.
    Dictionary(DictionaryPayload),
    /// A source directory service list.
    Services(Vec<ServiceUpdate>),
    /// Identity attributes of a login request or refresh.
    Login(LoginAttrib),
}

/// Identity attributes carried on the login stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginAttrib {
    pub application_id: String,
    pub position: String,
}

/// A consumer request opening or reissuing a stream.
#[derive(Debug, Clone, Default)]
pub struct RequestMsg {
    pub stream_id: i32,
    pub key: MsgKey,
    pub streaming: bool,
    /// Item names of a batch request; empty for a plain single request.
    pub batch_names: Vec<String>,
    pub payload: Payload,
}

/// A refresh (initial image or multi-part continuation).
#[derive(Debug, Clone)]
pub struct RefreshMsg {
    pub stream_id: i32,
    pub key: MsgKey,
    pub state: State,
    pub solicited: bool,
    pub complete: bool,
    /// True on the first part of a multi-part refresh; tells the consumer to
    /// drop any previously cached image.
    pub clear_cache: bool,
    pub payload: Payload,
}

/// An incremental update.
#[derive(Debug, Clone)]
pub struct UpdateMsg {
    pub stream_id: i32,
    pub key: MsgKey,
    pub payload: Payload,
}

/// A status change on a stream.
#[derive(Debug, Clone)]
pub struct StatusMsg {
    pub stream_id: i32,
    pub key: MsgKey,
    pub state: Option<State>,
}

/// A bi-directional generic message.
#[derive(Debug, Clone)]
pub struct GenericMsg {
    pub stream_id: i32,
    pub key: MsgKey,
    pub payload: Payload,
}

/// An off-stream or on-stream post.
#[derive(Debug, Clone)]
pub struct PostMsg {
    pub stream_id: i32,
    pub key: MsgKey,
    pub payload: Payload,
}

/// An acknowledgment of a post.
#[derive(Debug, Clone)]
pub struct AckMsg {
    pub stream_id: i32,
    pub ack_id: u32,
    pub text: Option<String>,
}

/// A close of a stream.
#[derive(Debug, Clone)]
pub struct CloseMsg {
    pub stream_id: i32,
}

/// A decoded message envelope together with its domain.
#[derive(Debug, Clone)]
pub enum Msg {
    Request(DomainType, RequestMsg),
    Refresh(DomainType, RefreshMsg),
    Update(DomainType, UpdateMsg),
    Status(DomainType, StatusMsg),
    Generic(DomainType, GenericMsg),
    Ack(DomainType, AckMsg),
    Close(DomainType, CloseMsg),
    Post(DomainType, PostMsg),
}

impl Msg {
    pub fn domain(&self) -> DomainType {
        match self {
            Msg::Request(d, _)
            | Msg::Refresh(d, _)
            | Msg::Update(d, _)
            | Msg::Status(d, _)
            | Msg::Generic(d, _)
            | Msg::Ack(d, _)
            | Msg::Close(d, _)
            | Msg::Post(d, _) => *d,
        }
    }

    pub fn stream_id(&self) -> i32 {
        match self {
            Msg::Request(_, m) => m.stream_id,
            Msg::Refresh(_, m) => m.stream_id,
            Msg::Update(_, m) => m.stream_id,
            Msg::Status(_, m) => m.stream_id,
            Msg::Generic(_, m) => m.stream_id,
            Msg::Ack(_, m) => m.stream_id,
            Msg::Close(_, m) => m.stream_id,
            Msg::Post(_, m) => m.stream_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Msg::Request(..) => "Request",
            Msg::Refresh(..) => "Refresh",
            Msg::Update(..) => "Update",
            Msg::Status(..) => "Status",
            Msg::Generic(..) => "Generic",
            Msg::Ack(..) => "Ack",
            Msg::Close(..) => "Close",
            Msg::Post(..) => "Post",
        }
    }
}

/// The merge action of one entry in a source directory service list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Add,
    Update,
    Delete,
    /// An action code this session does not understand. Logged and ignored.
    Unknown(u8),
}

/// The static description of one advertised service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub capabilities: Vec<DomainType>,
    pub dictionaries_provided: Vec<String>,
}

/// The dynamic state of one advertised service.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServiceState {
    pub service_up: bool,
    pub accepting_requests: bool,
}

/// One entry of a source directory payload: a service and the action to
/// apply to it when merging into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceUpdate {
    pub action: ServiceAction,
    pub id: u16,
    pub info: Option<ServiceInfo>,
    pub state: Option<ServiceState>,
}
