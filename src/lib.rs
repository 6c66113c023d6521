//! Real-time session core for the SMC voice support-intake assistant.
//!
//! Streams microphone audio to a remote conversational model over a duplex
//! WebSocket, plays its spoken replies back gaplessly with barge-in, merges
//! streaming transcripts into turns and turns the model's `submitTicket`
//! call into a support ticket.

pub mod audio;
pub mod config;
pub mod error;
pub mod gui_bridge;
pub mod net_link;
pub mod protocol;
pub mod session;
pub mod tool_bridge;
pub mod transcript;
