// Single item streams: request submission, routing, deferred closed status
// for unknown services, stream-id reuse after close.
use bytes::Bytes;
use parking_lot::Mutex;
use rwfsession::config::{ChannelConfig, SessionConfig};
use rwfsession::core::client::{ItemClient, ItemEvent};
use rwfsession::core::protocol::{
    AckMsg, DomainType, GenericMsg, Msg, MsgKey, Payload, PostMsg, RefreshMsg, RequestMsg,
    ServiceAction, ServiceInfo, ServiceState, ServiceUpdate, State, StateCode, StatusMsg,
    StreamState, UpdateMsg,
};
use rwfsession::transport::mock::MockTransport;
use rwfsession::transport::{ChannelEventKind, ChannelId};
use rwfsession::{Session, SessionError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Record {
    kind: &'static str,
    stream_id: i32,
    handle: u64,
    text: String,
    code: Option<StateCode>,
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
    fn on_refresh_msg(&self, msg: &RefreshMsg, event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "refresh",
            stream_id: msg.stream_id,
            handle: event.handle.as_u64(),
            text: msg.state.text.clone(),
            code: Some(msg.state.code),
            stream_state: Some(msg.state.stream_state),
        });
    }
    fn on_update_msg(&self, msg: &UpdateMsg, event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "update",
            stream_id: msg.stream_id,
            handle: event.handle.as_u64(),
            text: String::new(),
            code: None,
            stream_state: None,
        });
    }
    fn on_ack_msg(&self, msg: &AckMsg, event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "ack",
            stream_id: msg.stream_id,
            handle: event.handle.as_u64(),
            text: String::new(),
            code: None,
            stream_state: None,
        });
    }
    fn on_status_msg(&self, msg: &StatusMsg, event: &ItemEvent) {
        self.records.lock().push(Record {
            kind: "status",
            stream_id: msg.stream_id,
            handle: event.handle.as_u64(),
            text: msg.state.as_ref().map(|s| s.text.clone()).unwrap_or_default(),
            code: msg.state.as_ref().map(|s| s.code),
            stream_state: msg.state.as_ref().map(|s| s.stream_state),
        });
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
                payload: Payload::Services(vec![ServiceUpdate {
                    action: ServiceAction::Add,
                    id: 10,
                    info: Some(ServiceInfo {
                        name: "DIRECT_FEED".to_string(),
                        capabilities: vec![DomainType::MarketPrice],
                        dictionaries_provided: Vec::new(),
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

fn market_request(name: &str) -> RequestMsg {
    RequestMsg {
        stream_id: 0,
        key: MsgKey {
            name: Some(name.to_string()),
            service_name: Some("DIRECT_FEED".to_string()),
            ..Default::default()
        },
        streaming: true,
        batch_names: Vec::new(),
        payload: Payload::None,
    }
}

fn item_refresh(stream_id: i32) -> RefreshMsg {
    RefreshMsg {
        stream_id,
        key: MsgKey::default(),
        state: State::open_ok(),
        solicited: true,
        complete: true,
        clear_cache: true,
        payload: Payload::None,
    }
}

#[test]
fn first_item_request_opens_stream_5_with_the_resolved_service_id() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let handle = session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client.clone(), None)
        .unwrap();

    let request = transport
        .submissions()
        .into_iter()
        .find_map(|s| match s.msg {
            Msg::Request(DomainType::MarketPrice, req) => Some(req),
            _ => None,
        })
        .unwrap();
    assert_eq!(request.stream_id, 5);
    assert_eq!(request.key.service_id, Some(10));

    // The driver routes the image back by token, not by handle.
    let token = transport.token_for_stream(5).unwrap();
    transport.push_message(
        ChannelId(1),
        token,
        Msg::Refresh(DomainType::MarketPrice, item_refresh(5)),
    );
    transport.push_message(
        ChannelId(1),
        token,
        Msg::Update(
            DomainType::MarketPrice,
            UpdateMsg {
                stream_id: 5,
                key: MsgKey::default(),
                payload: Payload::None,
            },
        ),
    );
    session.dispatch(Duration::ZERO).unwrap();

    let records = client.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].kind, "refresh");
    assert_eq!(records[1].kind, "update");
    assert!(records.iter().all(|r| r.handle == handle.as_u64()));
}

#[test]
fn unknown_service_name_yields_a_deferred_closed_status() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());
    let submissions_before = transport.submissions().len();

    let mut request = market_request("EUR=");
    request.key.service_name = Some("NOSUCH".to_string());
    let handle = session
        .register_client(request, DomainType::MarketPrice, client.clone(), None)
        .unwrap();

    // No wire traffic, and the status is not delivered synchronously.
    assert_eq!(transport.submissions().len(), submissions_before);
    assert!(client.records().is_empty());

    session.dispatch(Duration::ZERO).unwrap();
    let records = client.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, "status");
    assert_eq!(records[0].text, "Service name of 'NOSUCH' is not found.");
    // The stream closes outright with no refinement code; the text alone
    // carries the reason.
    assert_eq!(records[0].stream_state, Some(StreamState::Closed));
    assert_eq!(records[0].code, Some(StateCode::None));

    // The item is gone once the status fired.
    assert!(matches!(
        session.unregister(handle),
        Err(SessionError::InvalidHandle(_))
    ));
}

#[test]
fn unknown_service_id_yields_the_id_variant_of_the_status_text() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let request = RequestMsg {
        key: MsgKey {
            name: Some("EUR=".to_string()),
            service_id: Some(42),
            ..Default::default()
        },
        streaming: true,
        ..Default::default()
    };
    session
        .register_client(request, DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    session.dispatch(Duration::ZERO).unwrap();

    assert_eq!(client.records()[0].text, "Service id of '42' is not found.");
}

#[test]
fn request_without_any_service_is_a_usage_error() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let request = RequestMsg {
        key: MsgKey::with_name("EUR="),
        streaming: true,
        ..Default::default()
    };
    assert!(matches!(
        session.register_client(request, DomainType::MarketPrice, client, None),
        Err(SessionError::InvalidUsage(_))
    ));
}

#[test]
fn provider_close_removes_the_item_and_frees_its_stream_id() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    let token = transport.token_for_stream(5).unwrap();

    transport.push_message(
        ChannelId(1),
        token,
        Msg::Status(
            DomainType::MarketPrice,
            StatusMsg {
                stream_id: 5,
                key: MsgKey::default(),
                state: Some(State::closed_suspect("item not entitled")),
            },
        ),
    );
    session.dispatch(Duration::ZERO).unwrap();

    assert_eq!(client.records()[0].text, "item not entitled");
    assert_eq!(session.item_count(), 0);

    // The released id is reused by the next registration.
    session
        .register_client(market_request("JPY="), DomainType::MarketPrice, client, None)
        .unwrap();
    let last = transport.submissions().pop().unwrap();
    assert_eq!(last.msg.stream_id(), 5);
}

#[test]
fn non_streaming_complete_refresh_closes_the_stream() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    let token = transport.token_for_stream(5).unwrap();

    let mut refresh = item_refresh(5);
    refresh.state = State::new(StreamState::NonStreaming, rwfsession::core::protocol::DataState::Ok);
    transport.push_message(ChannelId(1), token, Msg::Refresh(DomainType::MarketPrice, refresh));
    session.dispatch(Duration::ZERO).unwrap();

    assert_eq!(client.records().len(), 1);
    assert_eq!(session.item_count(), 0);
}

#[test]
fn unregister_submits_a_close_message_first() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let handle = session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    session.unregister(handle).unwrap();

    let last = transport.submissions().pop().unwrap();
    assert!(matches!(last.msg, Msg::Close(DomainType::MarketPrice, _)));
    assert_eq!(last.msg.stream_id(), 5);
    assert_eq!(session.item_count(), 0);

    // Stream id 5 comes back for the next item.
    session
        .register_client(market_request("JPY="), DomainType::MarketPrice, client, None)
        .unwrap();
    assert_eq!(transport.submissions().pop().unwrap().msg.stream_id(), 5);
}

#[test]
fn submit_generic_rides_the_item_stream() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let handle = session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client, None)
        .unwrap();
    session
        .submit_generic(
            handle,
            GenericMsg {
                stream_id: 0,
                key: MsgKey::default(),
                payload: Payload::None,
            },
        )
        .unwrap();

    let last = transport.submissions().pop().unwrap();
    assert!(matches!(last.msg, Msg::Generic(DomainType::MarketPrice, _)));
    assert_eq!(last.msg.stream_id(), 5);
}

#[test]
fn post_and_ack_ride_the_item_stream() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());

    let handle = session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client.clone(), None)
        .unwrap();
    session
        .submit_post(
            handle,
            PostMsg {
                stream_id: 0,
                key: MsgKey::default(),
                payload: Payload::Opaque(Bytes::from_static(b"bid/ask contribution")),
            },
        )
        .unwrap();

    let last = transport.submissions().pop().unwrap();
    assert!(matches!(last.msg, Msg::Post(DomainType::MarketPrice, _)));
    assert_eq!(last.msg.stream_id(), 5);

    // The provider acknowledges on the same stream.
    transport.push_message(
        ChannelId(1),
        last.token,
        Msg::Ack(
            DomainType::MarketPrice,
            AckMsg {
                stream_id: 5,
                ack_id: 1,
                text: None,
            },
        ),
    );
    session.dispatch(Duration::ZERO).unwrap();
    assert_eq!(client.records().last().map(|r| r.kind), Some("ack"));
}

#[test]
fn operations_on_an_unknown_handle_report_invalid_handle() {
    let transport = MockTransport::new();
    let mut session = bootstrap(&transport);
    let client = Arc::new(RecordingClient::default());
    let handle = session
        .register_client(market_request("EUR="), DomainType::MarketPrice, client, None)
        .unwrap();
    session.unregister(handle).unwrap();

    assert!(matches!(
        session.unregister(handle),
        Err(SessionError::InvalidHandle(_))
    ));
    assert!(matches!(
        session.reissue(handle, RequestMsg::default()),
        Err(SessionError::InvalidHandle(_))
    ));
}
