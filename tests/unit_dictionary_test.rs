// Dictionary handling: local file load, multi-part local re-encode, network
// download, and the deferred close of reserved-stream dictionary items.
use parking_lot::Mutex;
use rwfsession::config::{ChannelConfig, DictionarySource, SessionConfig};
use rwfsession::core::client::{ItemClient, ItemEvent};
use rwfsession::core::protocol::{
    DictionaryPayload, DomainType, FieldDef, Msg, MsgKey, Payload, RefreshMsg, RequestMsg,
    ServiceAction, ServiceInfo, ServiceState, ServiceUpdate, State, StatusMsg,
};
use rwfsession::transport::mock::MockTransport;
use rwfsession::transport::{ChannelEventKind, ChannelId};
use rwfsession::{Session, SessionError};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct PartRecord {
    clear_cache: bool,
    complete: bool,
    entries: usize,
}

#[derive(Default)]
struct PartClient {
    parts: Mutex<Vec<PartRecord>>,
    statuses: Mutex<Vec<String>>,
}

impl ItemClient for PartClient {
    fn on_refresh_msg(&self, msg: &RefreshMsg, _event: &ItemEvent) {
        let entries = match &msg.payload {
            Payload::Dictionary(DictionaryPayload::Fields(fields)) => fields.len(),
            Payload::Dictionary(DictionaryPayload::EnumTables(tables)) => tables.len(),
            _ => 0,
        };
        self.parts.lock().push(PartRecord {
            clear_cache: msg.clear_cache,
            complete: msg.complete,
            entries,
        });
    }
    fn on_status_msg(&self, msg: &StatusMsg, _event: &ItemEvent) {
        let text = msg.state.as_ref().map(|s| s.text.clone()).unwrap_or_default();
        self.statuses.lock().push(text);
    }
}

fn write_field_dictionary(count: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "! field dictionary fixture").unwrap();
    for fid in 1..=count {
        writeln!(file, "FIELD_{fid} \"FIELD {fid}\" {fid} NULL INTEGER 5 UINT64 2").unwrap();
    }
    file.flush().unwrap();
    file
}

fn write_enum_dictionary() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "! enum type fixture").unwrap();
    writeln!(file, "PRCTCK_1 14").unwrap();
    writeln!(file, "0 \" \"").unwrap();
    writeln!(file, "1 \"+\"").unwrap();
    writeln!(file, "2 \"-\"").unwrap();
    file.flush().unwrap();
    file
}

fn local_config(fields: usize) -> (SessionConfig, tempfile::NamedTempFile, tempfile::NamedTempFile) {
    let field_file = write_field_dictionary(fields);
    let enum_file = write_enum_dictionary();
    let mut config = SessionConfig::new(vec![ChannelConfig::new("chan-a", "localhost:14002")]);
    config.dictionary = DictionarySource::File {
        field_dictionary_path: field_file.path().to_path_buf(),
        enum_type_path: enum_file.path().to_path_buf(),
    };
    config.dictionary_part_delay = Duration::ZERO;
    config.dictionary_close_delay = Duration::ZERO;
    (config, field_file, enum_file)
}

fn dictionary_request(name: &str) -> RequestMsg {
    RequestMsg {
        stream_id: 0,
        key: MsgKey::with_name(name),
        streaming: false,
        batch_names: Vec::new(),
        payload: Payload::None,
    }
}

#[test]
fn local_dictionary_is_ready_right_after_initialize() {
    let (config, _f, _e) = local_config(10);
    let session = Session::initialize(config, Box::new(MockTransport::new())).unwrap();
    assert!(session.is_dictionary_ready());
}

#[test]
fn local_dictionary_load_failure_is_fatal() {
    let enum_file = write_enum_dictionary();
    let mut config = SessionConfig::new(vec![ChannelConfig::new("chan-a", "localhost:14002")]);
    config.dictionary = DictionarySource::File {
        field_dictionary_path: "/nonexistent/RDMFieldDictionary".into(),
        enum_type_path: enum_file.path().to_path_buf(),
    };
    let result = Session::initialize(config, Box::new(MockTransport::new()));
    assert!(matches!(result, Err(SessionError::DictionaryLoad(_))));
}

#[test]
fn small_locally_served_dictionary_arrives_as_one_complete_part() {
    let (config, _f, _e) = local_config(10);
    let transport = MockTransport::new();
    let mut session = Session::initialize(config, Box::new(transport.clone())).unwrap();
    let client = Arc::new(PartClient::default());

    session
        .register_client(dictionary_request("RWFFld"), DomainType::Dictionary, client.clone(), None)
        .unwrap();
    // Served through the timeout queue, not synchronously.
    assert!(client.parts.lock().is_empty());
    session.dispatch(Duration::ZERO).unwrap();

    let parts = client.parts.lock().clone();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].clear_cache);
    assert!(parts[0].complete);
    assert_eq!(parts[0].entries, 10);
    // No wire traffic was involved.
    assert!(transport.submissions().is_empty());
}

#[test]
fn large_locally_served_dictionary_is_split_into_parts() {
    // 600 fields exceed one 512-entry part.
    let (config, _f, _e) = local_config(600);
    let mut session = Session::initialize(config, Box::new(MockTransport::new())).unwrap();
    let client = Arc::new(PartClient::default());

    session
        .register_client(dictionary_request("RWFFld"), DomainType::Dictionary, client.clone(), None)
        .unwrap();
    session.dispatch(Duration::ZERO).unwrap();
    // The continuation is a separate scheduled task.
    session.dispatch(Duration::ZERO).unwrap();

    let parts = client.parts.lock().clone();
    assert_eq!(parts.len(), 2);
    assert!(parts[0].clear_cache && !parts[0].complete);
    assert_eq!(parts[0].entries, 512);
    assert!(!parts[1].clear_cache && parts[1].complete);
    assert_eq!(parts[1].entries, 88);
}

#[test]
fn locally_served_enum_dictionary_completes() {
    let (config, _f, _e) = local_config(10);
    let mut session = Session::initialize(config, Box::new(MockTransport::new())).unwrap();
    let client = Arc::new(PartClient::default());

    session
        .register_client(dictionary_request("RWFEnum"), DomainType::Dictionary, client.clone(), None)
        .unwrap();
    session.dispatch(Duration::ZERO).unwrap();

    let parts = client.parts.lock().clone();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].complete);
    assert_eq!(parts[0].entries, 1);
}

#[test]
fn dictionary_request_must_name_a_wellknown_dictionary() {
    let (config, _f, _e) = local_config(10);
    let mut session = Session::initialize(config, Box::new(MockTransport::new())).unwrap();
    let client = Arc::new(PartClient::default());

    let result = session.register_client(
        dictionary_request("RWFBogus"),
        DomainType::Dictionary,
        client,
        None,
    );
    assert!(matches!(result, Err(SessionError::InvalidUsage(_))));
}

#[test]
fn dictionary_without_service_and_without_resident_copy_is_a_usage_error() {
    let config = SessionConfig::new(vec![ChannelConfig::new("chan-a", "localhost:14002")]);
    let mut session = Session::initialize(config, Box::new(MockTransport::new())).unwrap();
    let client = Arc::new(PartClient::default());

    let result = session.register_client(
        dictionary_request("RWFFld"),
        DomainType::Dictionary,
        client,
        None,
    );
    assert!(matches!(result, Err(SessionError::InvalidUsage(_))));
}

#[test]
fn closing_a_dictionary_item_is_deferred_past_a_grace_period() {
    let (config, _f, _e) = local_config(10);
    let mut session = Session::initialize(config, Box::new(MockTransport::new())).unwrap();
    let client = Arc::new(PartClient::default());

    let handle = session
        .register_client(dictionary_request("RWFFld"), DomainType::Dictionary, client.clone(), None)
        .unwrap();
    session.dispatch(Duration::ZERO).unwrap();

    session.unregister(handle).unwrap();
    // Still in the map until the grace task fires.
    assert_eq!(session.item_count(), 1);
    session.dispatch(Duration::ZERO).unwrap();
    assert_eq!(session.item_count(), 0);
}

fn network_bootstrap(transport: &MockTransport) -> Session {
    let config = SessionConfig::new(vec![ChannelConfig::new("chan-a", "localhost:14002")]);
    let mut session = Session::initialize(config, Box::new(transport.clone())).unwrap();
    let chan = ChannelId(1);
    transport.push_channel_event(
        chan,
        ChannelEventKind::Up {
            major_version: 14,
            minor_version: 1,
        },
    );
    transport.push_message(
        chan,
        1,
        Msg::Refresh(
            DomainType::Login,
            RefreshMsg {
                stream_id: 1,
                key: MsgKey::with_name("tester"),
                state: State::open_ok(),
                solicited: true,
                complete: true,
                clear_cache: true,
                payload: Payload::None,
            },
        ),
    );
    transport.push_message(
        chan,
        2,
        Msg::Refresh(
            DomainType::Source,
            RefreshMsg {
                stream_id: 2,
                key: MsgKey::default(),
                state: State::open_ok(),
                solicited: true,
                complete: true,
                clear_cache: true,
                payload: Payload::Services(vec![ServiceUpdate {
                    action: ServiceAction::Add,
                    id: 10,
                    info: Some(ServiceInfo {
                        name: "DIRECT_FEED".to_string(),
                        capabilities: vec![DomainType::MarketPrice],
                        dictionaries_provided: vec!["RWFFld".to_string(), "RWFEnum".to_string()],
                    }),
                    state: Some(ServiceState {
                        service_up: true,
                        accepting_requests: true,
                    }),
                }]),
            },
        ),
    );
    session.dispatch(Duration::ZERO).unwrap();
    session
}

fn field_part(stream_id: i32, complete: bool) -> RefreshMsg {
    RefreshMsg {
        stream_id,
        key: MsgKey::with_name("RWFFld"),
        state: State::open_ok(),
        solicited: true,
        complete,
        clear_cache: false,
        payload: Payload::Dictionary(DictionaryPayload::Fields(vec![FieldDef {
            fid: 1,
            acronym: "PROD_PERM".to_string(),
            field_type: "UINT64".to_string(),
            length: 5,
        }])),
    }
}

fn enum_part(stream_id: i32, complete: bool) -> RefreshMsg {
    RefreshMsg {
        stream_id,
        key: MsgKey::with_name("RWFEnum"),
        state: State::open_ok(),
        solicited: true,
        complete,
        clear_cache: false,
        payload: Payload::Dictionary(DictionaryPayload::EnumTables(Vec::new())),
    }
}

#[test]
fn network_download_becomes_ready_when_both_dictionaries_complete() {
    let transport = MockTransport::new();
    let mut session = network_bootstrap(&transport);
    assert!(!session.is_dictionary_ready());

    transport.push_message(ChannelId(1), 3, Msg::Refresh(DomainType::Dictionary, field_part(3, false)));
    transport.push_message(ChannelId(1), 3, Msg::Refresh(DomainType::Dictionary, field_part(3, true)));
    session.dispatch(Duration::ZERO).unwrap();
    assert!(!session.is_dictionary_ready());

    transport.push_message(ChannelId(1), 4, Msg::Refresh(DomainType::Dictionary, enum_part(4, true)));
    session.dispatch(Duration::ZERO).unwrap();
    assert!(session.is_dictionary_ready());

    // A later serviceless request can now be served from the resident copy.
    let client = Arc::new(PartClient::default());
    session
        .register_client(dictionary_request("RWFFld"), DomainType::Dictionary, client.clone(), None)
        .unwrap();
    session.dispatch(Duration::ZERO).unwrap();
    let parts = client.parts.lock().clone();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].complete);
}

#[test]
fn wire_dictionary_subscriber_sees_forwarded_download_parts() {
    let transport = MockTransport::new();
    let mut session = network_bootstrap(&transport);
    let client = Arc::new(PartClient::default());

    let mut request = dictionary_request("RWFFld");
    request.key.service_name = Some("DIRECT_FEED".to_string());
    session
        .register_client(request, DomainType::Dictionary, client.clone(), None)
        .unwrap();

    let enum_client = Arc::new(PartClient::default());
    let mut request = dictionary_request("RWFEnum");
    request.key.service_name = Some("DIRECT_FEED".to_string());
    session
        .register_client(request, DomainType::Dictionary, enum_client.clone(), None)
        .unwrap();

    // Each item opened its own wire request on its conventional stream.
    for stream_id in [3, 4] {
        let wire_tokens: Vec<u64> = transport
            .submissions()
            .iter()
            .filter(|s| s.msg.stream_id() == stream_id)
            .map(|s| s.token)
            .collect();
        assert!(wire_tokens.iter().any(|t| *t > 4));
    }

    transport.push_message(ChannelId(1), 3, Msg::Refresh(DomainType::Dictionary, field_part(3, true)));
    transport.push_message(ChannelId(1), 4, Msg::Refresh(DomainType::Dictionary, enum_part(4, true)));
    session.dispatch(Duration::ZERO).unwrap();
    assert_eq!(client.parts.lock().len(), 1);
    assert_eq!(enum_client.parts.lock().len(), 1);
}
