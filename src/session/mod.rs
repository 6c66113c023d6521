//! Session Manager: one live conversation with the inference service.
//!
//! `SessionManager` owns the lifecycle (`connect`/`disconnect`) and the
//! connection state. Each connected session runs as one tokio task
//! (`controller`) that exclusively owns the microphone stream, the output
//! device, the channel handle, the playback scheduler and the transcript.
//! Everything the UI layer needs arrives as `SessionEvent`s, in order.

mod controller;
mod manager;

use std::fmt;

use serde::Serialize;

use crate::error::SessionError;
use crate::protocol::Speaker;
use crate::tool_bridge::TicketRecord;
use crate::transcript::TranscriptTurn;

pub use manager::{SessionManager, session_setup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    /// A session is being set up or is running.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error(SessionError),
    /// Output level in [0, 1].
    VolumeChanged(f32),
    Transcription {
        /// The fragment that just arrived.
        text: String,
        speaker: Speaker,
        turn_complete: bool,
        /// The merged turn after this fragment.
        turn: TranscriptTurn,
    },
    TicketSubmitted(TicketRecord),
}
