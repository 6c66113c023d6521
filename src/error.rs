//! Error taxonomy for the intake session core.
//!
//! Every error is `Clone` so the same value can be returned from
//! `SessionManager::connect` and emitted on the UI event stream.

use thiserror::Error;

/// Microphone or audio subsystem could not be acquired. Fatal to one
/// `connect()` attempt, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    #[error("audio output unavailable: {0}")]
    Output(String),

    #[error("audio thread failed to start: {0}")]
    Thread(String),
}

/// Malformed inbound audio payload. Recovered locally: the chunk is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    Encoding(String),

    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),

    #[error("{samples} samples do not divide into {channels} channels")]
    ChannelMismatch { samples: usize, channels: u16 },

    #[error("channel count must be at least 1")]
    NoChannels,
}

/// Transport-level failure of the duplex channel. Fatal to the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to open channel: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode outbound message: {0}")]
    Encode(String),

    #[error("no setup acknowledgment within {0} ms")]
    SetupTimeout(u64),

    #[error("channel closed")]
    Closed,
}

/// A ticket invocation whose arguments are unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolArgumentError {
    #[error("tool arguments are not an object")]
    NotAnObject,

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

/// Errors surfaced by the session manager to its caller and on the event
/// stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("a session is already active")]
    AlreadyActive,
}
