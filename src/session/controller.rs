use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::{ConnectionState, SessionEvent};
use crate::audio::{AudioChunk, CaptureStream, PlaybackEvent, PlaybackScheduler, pcm};
use crate::config::Config;
use crate::error::{AcquisitionError, ChannelError, SessionError};
use crate::net_link::{ChannelHandle, NetCommand, NetEvent};
use crate::protocol::{ClientMessage, FunctionCall, InboundEvent, ServerMessage, Speaker};
use crate::tool_bridge::{TicketRecord, ToolBridge};
use crate::transcript::Transcript;

/// Requests from the manager to a running session.
#[derive(Debug)]
pub(super) enum Control {
    Disconnect,
}

enum Ending {
    Local,
    Remote(Option<String>),
    Failed(SessionError),
}

/// Everything one session owns, handed over by the manager once every
/// resource has been acquired.
pub(super) struct SessionResources {
    pub chunks: mpsc::Receiver<AudioChunk>,
    pub capture: Box<dyn CaptureStream>,
    pub scheduler: PlaybackScheduler,
    pub playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    pub channel: ChannelHandle,
    pub bridge: ToolBridge,
}

/// The per-session event loop. Inbound channel events, microphone chunks,
/// playback notifications and metering ticks are all handled here, one at a
/// time, in arrival order.
pub(super) struct SessionController {
    config: Arc<Config>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    control: mpsc::Receiver<Control>,

    chunks: mpsc::Receiver<AudioChunk>,
    capture: Box<dyn CaptureStream>,
    scheduler: PlaybackScheduler,
    playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    net_tx: mpsc::Sender<NetCommand>,
    net_rx: mpsc::UnboundedReceiver<NetEvent>,

    bridge: ToolBridge,
    transcript: Transcript,
    ticket: Option<TicketRecord>,
    connected: bool,
    last_level: Option<f32>,
}

impl SessionController {
    pub(super) fn new(
        config: Arc<Config>,
        state: Arc<watch::Sender<ConnectionState>>,
        events: mpsc::UnboundedSender<SessionEvent>,
        control: mpsc::Receiver<Control>,
        resources: SessionResources,
    ) -> Self {
        Self {
            config,
            state,
            events,
            control,
            chunks: resources.chunks,
            capture: resources.capture,
            scheduler: resources.scheduler,
            playback: resources.playback,
            net_tx: resources.channel.commands,
            net_rx: resources.channel.events,
            bridge: resources.bridge,
            transcript: Transcript::new(),
            ticket: None,
            connected: false,
            last_level: None,
        }
    }

    pub(super) async fn run(mut self) {
        let ending = self.event_loop().await;
        self.finish(ending);
    }

    async fn event_loop(&mut self) -> Ending {
        let setup_timeout_ms = self.config.service.setup_timeout_ms;
        let setup_deadline = tokio::time::sleep(Duration::from_millis(setup_timeout_ms));
        tokio::pin!(setup_deadline);

        let mut meter = tokio::time::interval(Duration::from_millis(
            self.config.session.meter_interval_ms.max(1),
        ));
        meter.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                // A dropped manager counts as a disconnect.
                _ = self.control.recv() => return Ending::Local,

                event = self.net_rx.recv() => {
                    match event {
                        Some(NetEvent::Ready) => self.on_ready(),
                        Some(NetEvent::Message(msg)) => {
                            if let Err(e) = self.on_message(msg).await {
                                return Ending::Failed(e.into());
                            }
                        }
                        Some(NetEvent::Closed(reason)) => return Ending::Remote(reason),
                        Some(NetEvent::Error(e)) => return Ending::Failed(e.into()),
                        None => return Ending::Failed(ChannelError::Closed.into()),
                    }
                }

                _ = &mut setup_deadline, if !self.connected => {
                    return Ending::Failed(ChannelError::SetupTimeout(setup_timeout_ms).into());
                }

                // Device threads only drop their senders on the way out; the
                // session has not stopped them yet, so they died.
                event = self.playback.recv() => match event {
                    Some(PlaybackEvent::Ended(id)) => self.scheduler.on_ended(id),
                    None => {
                        let e = AcquisitionError::Output("playback stream ended".into());
                        return Ending::Failed(e.into());
                    }
                },

                chunk = self.chunks.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(e) = self.on_chunk(chunk).await {
                            return Ending::Failed(e.into());
                        }
                    }
                    None => {
                        let e = AcquisitionError::Microphone("capture stream ended".into());
                        return Ending::Failed(e.into());
                    }
                },

                _ = meter.tick(), if self.connected => self.on_meter_tick(),
            }
        }
    }

    fn on_ready(&mut self) {
        if self.connected {
            log::debug!("Duplicate setup acknowledgment ignored");
            return;
        }
        self.connected = true;
        self.state.send_replace(ConnectionState::Connected);
        log::info!("Session connected, streaming microphone");
        self.emit(SessionEvent::Connected);
    }

    async fn on_chunk(&mut self, chunk: AudioChunk) -> Result<(), ChannelError> {
        if !self.connected {
            log::trace!("Dropping {} samples captured before setup", chunk.len());
            return Ok(());
        }
        let data = pcm::encode_base64(chunk.samples());
        let mime = pcm::mime_type(self.config.audio.input_sample_rate);
        self.send(ClientMessage::media(mime, data)).await
    }

    async fn on_message(&mut self, msg: ServerMessage) -> Result<(), ChannelError> {
        if !self.connected {
            log::debug!("Ignoring server content received before setup");
            return Ok(());
        }

        for event in msg.into_events() {
            match event {
                InboundEvent::AudioFrame { data } => self.on_audio(&data),
                InboundEvent::Interruption => {
                    let stopped = self.scheduler.interrupt();
                    log::info!("Interrupted, stopped {} buffers", stopped);
                }
                InboundEvent::PartialTranscript {
                    speaker,
                    text,
                    turn_complete,
                } => self.on_transcript(text, speaker, turn_complete),
                InboundEvent::ToolInvocation(call) => self.on_tool_call(call).await?,
            }
        }
        Ok(())
    }

    fn on_audio(&mut self, data: &str) {
        let audio = &self.config.audio;
        match pcm::decode_base64(data, audio.output_sample_rate, audio.output_channels) {
            Ok(buffer) => {
                self.scheduler.schedule(buffer);
            }
            Err(e) => log::warn!("Dropping audio frame: {}", e),
        }
    }

    fn on_transcript(&mut self, text: String, speaker: Speaker, turn_complete: bool) {
        let Some(turn) = self.transcript.push(&text, speaker, turn_complete).cloned() else {
            return;
        };
        log::debug!("[{}] {}", speaker.as_str(), turn.text);
        self.emit(SessionEvent::Transcription {
            text,
            speaker,
            turn_complete,
            turn,
        });
    }

    async fn on_tool_call(&mut self, call: FunctionCall) -> Result<(), ChannelError> {
        log::info!("Tool call {} ({})", call.name, call.id);
        let dispatch = self.bridge.dispatch(&call);

        if let Some(ticket) = dispatch.ticket {
            if self.ticket.is_some() {
                log::info!("Replacing previously submitted ticket");
            }
            self.ticket = Some(ticket.clone());
            self.emit(SessionEvent::TicketSubmitted(ticket));
        }

        self.send(ClientMessage::tool_response(dispatch.response)).await
    }

    fn on_meter_tick(&mut self) {
        let level = self.scheduler.level().clamp(0.0, 1.0);
        if self.last_level == Some(level) {
            return;
        }
        self.last_level = Some(level);
        self.emit(SessionEvent::VolumeChanged(level));
    }

    async fn send(&mut self, msg: ClientMessage) -> Result<(), ChannelError> {
        self.net_tx
            .send(NetCommand::Send(msg))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Session event dropped, no listener");
        }
    }

    /// Release everything the session holds, publish the final state and
    /// report the ending exactly once.
    fn finish(mut self, ending: Ending) {
        // The capture thread may be parked on a full queue.
        self.chunks.close();
        self.capture.stop();
        self.scheduler.shutdown();

        if !matches!(ending, Ending::Remote(_)) {
            let _ = self.net_tx.try_send(NetCommand::Close);
        }

        match ending {
            Ending::Local => {
                log::info!("Session disconnected");
                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(SessionEvent::Disconnected);
            }
            Ending::Remote(reason) => {
                log::info!("Session closed by service: {}", reason.as_deref().unwrap_or("no reason"));
                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(SessionEvent::Disconnected);
            }
            Ending::Failed(e) => {
                log::error!("Session failed: {}", e);
                self.state.send_replace(ConnectionState::Error);
                self.emit(SessionEvent::Error(e));
            }
        }
    }
}
