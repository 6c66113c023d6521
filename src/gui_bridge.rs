use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::GuiConfig;
use crate::protocol::Speaker;
use crate::session::{ConnectionState, SessionEvent, SessionManager};
use crate::tool_bridge::TicketRecord;

/// Commands from the GUI process.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuiEvent {
    Connect,
    Disconnect,
    Toggle,
}

impl GuiEvent {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum GuiMessage<'a> {
    State {
        state: ConnectionState,
    },
    Error {
        message: String,
    },
    Volume {
        level: f32,
    },
    Transcript {
        role: Speaker,
        text: &'a str,
        turn_id: Uuid,
        turn_text: &'a str,
        #[serde(rename = "final")]
        is_final: bool,
    },
    Ticket {
        ticket: &'a TicketRecord,
    },
}

fn encode(msg: &GuiMessage<'_>) -> Option<String> {
    serde_json::to_string(msg)
        .map_err(|e| log::error!("Failed to encode GUI message: {}", e))
        .ok()
}

pub fn state_message(state: ConnectionState) -> Option<String> {
    encode(&GuiMessage::State { state })
}

/// JSON datagrams describing one session event, in send order.
pub fn event_messages(event: &SessionEvent) -> Vec<String> {
    let messages = match event {
        SessionEvent::Connected => vec![GuiMessage::State {
            state: ConnectionState::Connected,
        }],
        SessionEvent::Disconnected => vec![GuiMessage::State {
            state: ConnectionState::Disconnected,
        }],
        SessionEvent::Error(e) => vec![
            GuiMessage::State {
                state: ConnectionState::Error,
            },
            GuiMessage::Error {
                message: e.to_string(),
            },
        ],
        SessionEvent::VolumeChanged(level) => vec![GuiMessage::Volume { level: *level }],
        SessionEvent::Transcription {
            text,
            speaker,
            turn_complete,
            turn,
        } => vec![GuiMessage::Transcript {
            role: *speaker,
            text,
            turn_id: turn.id,
            turn_text: &turn.text,
            is_final: *turn_complete,
        }],
        SessionEvent::TicketSubmitted(ticket) => vec![GuiMessage::Ticket { ticket }],
    };
    messages.iter().filter_map(encode).collect()
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<GuiEvent>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &GuiConfig, tx: mpsc::Sender<GuiEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("0.0.0.0:{}", config.local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.buffer_size.max(64),
            tx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match GuiEvent::parse(msg) {
                Some(event) => {
                    if self.tx.send(event).await.is_err() {
                        log::warn!("GUI event receiver dropped, stopping bridge");
                        break;
                    }
                }
                None => log::debug!("Ignoring GUI message: {}", msg),
            }
        }
        Ok(())
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }

    pub async fn send_state(&self, state: ConnectionState) -> anyhow::Result<()> {
        if let Some(msg) = state_message(state) {
            self.send_message(&msg).await?;
        }
        Ok(())
    }

    pub async fn send_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        for msg in event_messages(event) {
            self.send_message(&msg).await?;
        }
        Ok(())
    }
}

/// Start a session and mirror `connecting` to the GUI. A running session is
/// left alone and nothing is sent.
pub async fn connect_session(session: &mut SessionManager, gui: Option<&GuiBridge>) {
    if session.state().is_active() {
        log::info!("Session already {}, ignoring connect", session.state());
        return;
    }
    if let Some(gui) = gui {
        if let Err(e) = gui.send_state(ConnectionState::Connecting).await {
            log::warn!("Failed to send to GUI: {}", e);
        }
    }
    // The error is also delivered as a SessionEvent.
    if let Err(e) = session.connect().await {
        log::debug!("connect() returned: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChannelError, SessionError};
    use crate::transcript::Transcript;
    use serde_json::{Value, json};

    fn values(event: &SessionEvent) -> Vec<Value> {
        event_messages(event)
            .iter()
            .map(|m| serde_json::from_str(m).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(GuiEvent::parse(r#"{"type":"connect"}"#), Some(GuiEvent::Connect));
        assert_eq!(GuiEvent::parse(r#"{"type":"toggle","extra":1}"#), Some(GuiEvent::Toggle));
        assert_eq!(GuiEvent::parse(r#"{"type":"reboot"}"#), None);
        assert_eq!(GuiEvent::parse("disconnect"), None);
    }

    #[test]
    fn test_error_event_sends_state_then_message() {
        let event = SessionEvent::Error(SessionError::Channel(ChannelError::Closed));
        assert_eq!(
            values(&event),
            vec![
                json!({"type": "state", "state": "error"}),
                json!({"type": "error", "message": "channel closed"}),
            ]
        );
    }

    #[test]
    fn test_transcript_message() {
        let mut transcript = Transcript::new();
        transcript.push("Hola", Speaker::User, false);
        let turn = transcript.push(" mundo", Speaker::User, true).unwrap().clone();
        let event = SessionEvent::Transcription {
            text: " mundo".into(),
            speaker: Speaker::User,
            turn_complete: true,
            turn: turn.clone(),
        };

        let msg = &values(&event)[0];
        assert_eq!(msg["type"], "transcript");
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["text"], " mundo");
        assert_eq!(msg["turn_text"], "Hola mundo");
        assert_eq!(msg["turn_id"], turn.id.to_string());
        assert_eq!(msg["final"], true);
    }

    #[test]
    fn test_ticket_message() {
        let ticket = TicketRecord {
            name: "Ana".into(),
            email: "a@x.cl".into(),
            municipality: "Maipú".into(),
            system: "Tesorería".into(),
            issue: "No carga el módulo".into(),
        };
        let msg = &values(&SessionEvent::TicketSubmitted(ticket))[0];
        assert_eq!(msg["ticket"]["municipality"], "Maipú");
        assert_eq!(msg["ticket"]["issue"], "No carga el módulo");
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let gui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = GuiConfig {
            enabled: true,
            local_port: 0,
            remote_port: gui.local_addr().unwrap().port(),
            buffer_size: 1024,
        };
        let (tx, mut rx) = mpsc::channel(4);
        let bridge = Arc::new(GuiBridge::new(&config, tx).await.unwrap());

        bridge.send_event(&SessionEvent::Connected).await.unwrap();
        let mut buf = [0u8; 256];
        let (len, _) = gui.recv_from(&mut buf).await.unwrap();
        let value: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value, json!({"type": "state", "state": "connected"}));

        let runner = bridge.clone();
        tokio::spawn(async move { runner.run().await });
        let port = bridge.local_addr().unwrap().port();
        gui.send_to(br#"{"type":"disconnect"}"#, ("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(GuiEvent::Disconnect));
    }
}
