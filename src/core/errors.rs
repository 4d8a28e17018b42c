// src/core/errors.rs

//! Defines the primary error type for the session layer.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the session.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Channel error on '{channel}': {text}")]
    ChannelError { channel: String, text: String },

    #[error("Submit failed on stream {stream_id}: {text}")]
    SubmitFailed { stream_id: i32, text: String },

    #[error("Dictionary load error: {0}")]
    DictionaryLoad(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Unable to obtain next available stream id for item request")]
    StreamIdExhausted,

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for SessionError {
    fn clone(&self) -> Self {
        match self {
            SessionError::Io(e) => SessionError::Io(Arc::clone(e)),
            SessionError::InvalidUsage(s) => SessionError::InvalidUsage(s.clone()),
            SessionError::InvalidHandle(h) => SessionError::InvalidHandle(*h),
            SessionError::InvalidConfiguration(s) => SessionError::InvalidConfiguration(s.clone()),
            SessionError::ChannelError { channel, text } => SessionError::ChannelError {
                channel: channel.clone(),
                text: text.clone(),
            },
            SessionError::SubmitFailed { stream_id, text } => SessionError::SubmitFailed {
                stream_id: *stream_id,
                text: text.clone(),
            },
            SessionError::DictionaryLoad(s) => SessionError::DictionaryLoad(s.clone()),
            SessionError::InvalidState(s) => SessionError::InvalidState(s.clone()),
            SessionError::StreamIdExhausted => SessionError::StreamIdExhausted,
            SessionError::Internal(s) => SessionError::Internal(s.clone()),
        }
    }
}

impl PartialEq for SessionError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SessionError::Io(e1), SessionError::Io(e2)) => e1.to_string() == e2.to_string(),
            (SessionError::InvalidUsage(s1), SessionError::InvalidUsage(s2)) => s1 == s2,
            (SessionError::InvalidHandle(h1), SessionError::InvalidHandle(h2)) => h1 == h2,
            (SessionError::InvalidConfiguration(s1), SessionError::InvalidConfiguration(s2)) => {
                s1 == s2
            }
            (
                SessionError::ChannelError {
                    channel: c1,
                    text: t1,
                },
                SessionError::ChannelError {
                    channel: c2,
                    text: t2,
                },
            ) => c1 == c2 && t1 == t2,
            (
                SessionError::SubmitFailed {
                    stream_id: i1,
                    text: t1,
                },
                SessionError::SubmitFailed {
                    stream_id: i2,
                    text: t2,
                },
            ) => i1 == i2 && t1 == t2,
            (SessionError::DictionaryLoad(s1), SessionError::DictionaryLoad(s2)) => s1 == s2,
            (SessionError::InvalidState(s1), SessionError::InvalidState(s2)) => s1 == s2,
            (SessionError::Internal(s1), SessionError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(Arc::new(e))
    }
}

impl From<String> for SessionError {
    fn from(s: String) -> Self {
        SessionError::Internal(s)
    }
}
