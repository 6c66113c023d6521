use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use url::Url;

use crate::config::ServiceConfig;
use crate::error::ChannelError;
use crate::protocol::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum NetEvent {
    /// `setupComplete` arrived: the channel is usable.
    Ready,
    Message(ServerMessage),
    /// Remote closed the stream, with the close reason if one was given.
    Closed(Option<String>),
    Error(ChannelError),
}

#[derive(Debug)]
pub enum NetCommand {
    Send(ClientMessage),
    Close,
}

/// Both ends of an open duplex channel, as seen by the session.
pub struct ChannelHandle {
    pub commands: mpsc::Sender<NetCommand>,
    pub events: mpsc::UnboundedReceiver<NetEvent>,
}

/// Opens duplex channels to the inference service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel and send `setup` as its first message. Returns once the
    /// transport is up; readiness is reported later as `NetEvent::Ready`.
    async fn open(&self, setup: ClientMessage) -> Result<ChannelHandle, ChannelError>;
}

/// Gemini Live over WebSocket.
pub struct WsConnector {
    config: ServiceConfig,
    command_buffer: usize,
}

impl WsConnector {
    pub fn new(config: ServiceConfig, command_buffer: usize) -> Self {
        Self {
            config,
            command_buffer: command_buffer.max(1),
        }
    }

    fn endpoint(&self) -> Result<Url, ChannelError> {
        if self.config.api_key.is_empty() {
            return Err(ChannelError::Connect("no API key configured".into()));
        }
        Url::parse_with_params(&self.config.ws_url, &[("key", self.config.api_key.as_str())])
            .map_err(|e| ChannelError::Connect(format!("invalid ws_url: {}", e)))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, setup: ClientMessage) -> Result<ChannelHandle, ChannelError> {
        let url = self.endpoint()?;
        let setup_json = setup
            .to_json()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;

        // The key travels in the query string; log the host only.
        log::info!("Connecting to {}...", url.host_str().unwrap_or("?"));
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        log::info!("Connected!");

        let (mut write, read) = ws_stream.split();
        log::debug!("Sending setup: {} bytes", setup_json.len());
        write
            .send(Message::Text(setup_json.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_buffer);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let link = NetLink {
            write,
            read,
            tx: event_tx,
            rx_cmd: cmd_rx,
        };
        tokio::spawn(link.run());

        Ok(ChannelHandle {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

/// Pumps one WebSocket: inbound frames become `NetEvent`s, `NetCommand`s
/// become outbound frames. Ends on close, error, or when the session drops
/// its command sender. Never reconnects.
struct NetLink {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
}

enum LinkEnd {
    Local,
    Remote(Option<String>),
}

impl NetLink {
    async fn run(mut self) {
        let final_event = match self.pump().await {
            Ok(LinkEnd::Local) => None,
            Ok(LinkEnd::Remote(reason)) => {
                log::info!("Server closed connection: {:?}", reason);
                Some(NetEvent::Closed(reason))
            }
            Err(e) => {
                log::error!("Connection error: {}", e);
                Some(NetEvent::Error(e))
            }
        };
        if let Some(event) = final_event {
            let _ = self.tx.send(event);
        }
    }

    async fn pump(&mut self) -> Result<LinkEnd, ChannelError> {
        loop {
            tokio::select! {
                msg = self.read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.forward(text.as_str()),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.forward(text),
                            Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            return Ok(LinkEnd::Remote(frame.map(|f| f.reason.to_string())));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
                        None => return Ok(LinkEnd::Remote(None)),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::Send(msg)) => {
                            let text = msg.to_json().map_err(|e| ChannelError::Encode(e.to_string()))?;
                            self.write
                                .send(Message::Text(text.into()))
                                .await
                                .map_err(|e| ChannelError::Transport(e.to_string()))?;
                        }
                        Some(NetCommand::Close) | None => {
                            let _ = self.write.send(Message::Close(None)).await;
                            let _ = self.write.close().await;
                            return Ok(LinkEnd::Local);
                        }
                    }
                }
            }
        }
    }

    fn forward(&self, raw: &str) {
        match ServerMessage::parse(raw) {
            Ok(msg) if msg.is_setup_complete() => {
                log::info!("Setup complete");
                let _ = self.tx.send(NetEvent::Ready);
            }
            Ok(msg) => {
                if let Some(go_away) = &msg.go_away {
                    log::warn!("Server going away, time left: {:?}", go_away.time_left);
                }
                let _ = self.tx.send(NetEvent::Message(msg));
            }
            Err(e) => log::warn!("Dropping unparseable server message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_carries_key() {
        let connector = WsConnector::new(
            ServiceConfig {
                api_key: "k3y".into(),
                ..Default::default()
            },
            8,
        );
        let url = connector.endpoint().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("generativelanguage.googleapis.com"));
        assert!(url.query_pairs().any(|(k, v)| k == "key" && v == "k3y"));
    }

    #[test]
    fn test_endpoint_requires_key() {
        let connector = WsConnector::new(ServiceConfig::default(), 8);
        assert!(matches!(connector.endpoint(), Err(ChannelError::Connect(_))));
    }
}
