// src/core/protocol/state.rs

//! Stream and data state carried on refresh and status messages.

use strum::Display;

/// The state of the logical stream itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StreamState {
    /// The stream is open and the provider will send further data.
    Open,
    /// The stream is open but the provider does not expect to send more data.
    NonStreaming,
    /// The stream is closed but may be reopened later (e.g. after reconnect).
    ClosedRecover,
    /// The stream is closed and will not be reopened.
    Closed,
    /// The stream was redirected to another provider.
    Redirected,
}

impl StreamState {
    /// Returns true for the states in which the stream keeps delivering data.
    pub fn is_open(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::NonStreaming)
    }
}

/// The health of the data flowing on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DataState {
    NoChange,
    Ok,
    Suspect,
}

/// A status code refining the stream/data state pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum StateCode {
    #[default]
    None,
    NotFound,
    Timeout,
    NotAuthorized,
    UsageError,
    NoResources,
}

/// The full state block carried on refresh and status messages.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StateCode,
    pub text: String,
}

impl State {
    pub fn new(stream_state: StreamState, data_state: DataState) -> Self {
        Self {
            stream_state,
            data_state,
            code: StateCode::None,
            text: String::new(),
        }
    }

    pub fn with_text(
        stream_state: StreamState,
        data_state: DataState,
        text: impl Into<String>,
    ) -> Self {
        Self {
            stream_state,
            data_state,
            code: StateCode::None,
            text: text.into(),
        }
    }

    /// An `Open`/`Ok` state, the normal healthy stream state.
    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok)
    }

    /// An `Open`/`Suspect` state, used when connectivity degrades but the
    /// stream itself is expected to recover.
    pub fn open_suspect(text: impl Into<String>) -> Self {
        Self::with_text(StreamState::Open, DataState::Suspect, text)
    }

    /// A terminal `Closed`/`Suspect` state.
    pub fn closed_suspect(text: impl Into<String>) -> Self {
        Self::with_text(StreamState::Closed, DataState::Suspect, text)
    }

    /// A recoverable `ClosedRecover`/`Suspect` state.
    pub fn closed_recover_suspect(text: impl Into<String>) -> Self {
        Self::with_text(StreamState::ClosedRecover, DataState::Suspect, text)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} - text: \"{}\"",
            self.stream_state, self.data_state, self.code, self.text
        )
    }
}
