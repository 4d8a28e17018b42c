// Source directory at the session level: subscriber fan-out and the effect
// of service state changes on later item requests.
use parking_lot::Mutex;
use rwfsession::config::{ChannelConfig, SessionConfig};
use rwfsession::core::client::{ItemClient, ItemEvent};
use rwfsession::core::protocol::{
    DomainType, Msg, MsgKey, Payload, RefreshMsg, RequestMsg, ServiceAction, ServiceInfo,
    ServiceState, ServiceUpdate, State, StatusMsg, StreamState, UpdateMsg,
};
use rwfsession::transport::mock::MockTransport;
use rwfsession::transport::{ChannelEventKind, ChannelId};
use rwfsession::Session;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Record {
    kind: &'static str,
    text: String,
    stream_state: Option<StreamState>,
}

#[derive(Default)]
struct RecordingClient {
    records: Mutex<Vec<Record>>,
}

impl RecordingClient {
    fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }
}

impl ItemClient for RecordingClient {
    fn on_refresh_msg(&self, _msg: &RefreshMsg, _event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "refresh",
            text: String::new(),
            stream_state: None,
        });
    }
    fn on_update_msg(&self, _msg: &UpdateMsg, _event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "update",
            text: String::new(),
            stream_state: None,
        });
    }
    fn on_status_msg(&self, msg: &StatusMsg, _event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "status",
            text: msg.state.as_ref().map(|s| s.text.clone()).unwrap_or_default(),
            stream_state: msg.state.as_ref().map(|s| s.stream_state),
        });
    }
}

fn service_add(id: u16, name: &str) -> ServiceUpdate {
    ServiceUpdate {
        action: ServiceAction::Add,
        id,
        info: Some(ServiceInfo {
            name: name.to_string(),
            capabilities: vec![DomainType::MarketPrice],
            dictionaries_provided: Vec::new(),
        }),
        state: Some(ServiceState {
            service_up: true,
            accepting_requests: true,
        }),
    }
}

fn bootstrap(transport: &MockTransport) -> Session {
    let mut config = SessionConfig::new(vec![ChannelConfig::new("chan-a", "localhost:14002")]);
    config.request_timeout = Duration::ZERO;
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
                payload: Payload::Services(vec![service_add(10, "DIRECT_FEED")]),
            },
        ),
    );
    session.dispatch(Duration::ZERO).unwrap();
    session
}

fn directory_update(updates: Vec<ServiceUpdate>) -> Msg {
    Msg::Update(
        DomainType::Source,
        UpdateMsg {
            stream_id: 2,
            key: MsgKey::default(),
            payload: Payload::Services(updates),
        },
    )
}

#[test]
fn directory_subscriber_receives_update_fanout() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());
    session
        .register_client(RequestMsg::default(), DomainType::Source, client.clone(), None)
        .unwrap();

    transport.push_message(
        ChannelId(1),
        2,
        directory_update(vec![service_add(11, "SECOND_FEED")]),
    );
    session.dispatch(Duration::ZERO).unwrap();

    let records = client.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, "update");
}

#[test]
fn requests_against_a_downed_service_get_the_deferred_status() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    // The service stops accepting requests.
    transport.push_message(
        ChannelId(1),
        2,
        directory_update(vec![ServiceUpdate {
            action: ServiceAction::Update,
            id: 10,
            info: None,
            state: Some(ServiceState {
                service_up: true,
                accepting_requests: false,
            }),
        }]),
    );
    session.dispatch(Duration::ZERO).unwrap();

    let request = RequestMsg {
        key: MsgKey {
            name: Some("EUR=".to_string()),
            service_name: Some("DIRECT_FEED".to_string()),
            ..Default::default()
        },
        streaming: true,
        ..Default::default()
    };
    let before = transport.submissions().len();
    session
        .register_client(request, DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    assert_eq!(transport.submissions().len(), before);

    session.dispatch(Duration::ZERO).unwrap();
    let records = client.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text, "Service name of 'DIRECT_FEED' is not found.");
    assert_eq!(records[0].stream_state, Some(StreamState::Closed));
}

#[test]
fn deleted_service_stops_taking_requests_but_existing_items_survive() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let request = RequestMsg {
        key: MsgKey {
            name: Some("EUR=".to_string()),
            service_name: Some("DIRECT_FEED".to_string()),
            ..Default::default()
        },
        streaming: true,
        ..Default::default()
    };
    session
        .register_client(request.clone(), DomainType::MarketPrice, client.clone(), None)
        .unwrap();

    transport.push_message(
        ChannelId(1),
        2,
        directory_update(vec![ServiceUpdate {
            action: ServiceAction::Delete,
            id: 10,
            info: None,
            state: None,
        }]),
    );
    session.dispatch(Duration::ZERO).unwrap();
    // The open stream is untouched by the delete.
    assert_eq!(session.item_count(), 1);

    // New requests against the deleted service are refused with the
    // deferred status.
    session
        .register_client(request, DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    session.dispatch(Duration::ZERO).unwrap();
    assert!(client
        .records()
        .iter()
        .any(|r| r.kind == "status" && r.stream_state == Some(StreamState::Closed)));
}

#[test]
fn directory_reissue_resubmits_the_admin_request() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());
    let handle = session
        .register_client(RequestMsg::default(), DomainType::Source, client, None)
        .unwrap();

    let before = transport.submissions().len();
    session
        .reissue(
            handle,
            RequestMsg {
                key: MsgKey {
                    filter: Some(0x01),
                    ..Default::default()
                },
                streaming: true,
                ..Default::default()
            },
        )
        .unwrap();

    let submissions = transport.submissions();
    assert_eq!(submissions.len(), before + 1);
    let last = submissions.last().cloned().unwrap();
    assert_eq!(last.msg.stream_id(), 2);
    assert!(matches!(last.msg, Msg::Request(DomainType::Source, _)));
}
