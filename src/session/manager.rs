use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::controller::{Control, SessionController, SessionResources};
use super::{ConnectionState, SessionEvent};
use crate::audio::{AudioSystem, PlaybackScheduler};
use crate::config::{Config, ServiceConfig};
use crate::error::SessionError;
use crate::net_link::Connector;
use crate::protocol::{
    AudioTranscriptionConfig, ClientMessage, Content, GenerationConfig, Modality,
    PrebuiltVoiceConfig, Setup, SpeechConfig, TextPart, Tool, VoiceConfig,
};
use crate::tool_bridge::ToolBridge;

/// Microphone chunks buffered between the capture thread and the session.
const CHUNK_QUEUE: usize = 32;

/// The setup message sent once when the channel opens: audio responses in
/// the configured voice, the system prompt, the tool declarations and
/// transcription in both directions.
pub fn session_setup(service: &ServiceConfig, bridge: &ToolBridge) -> ClientMessage {
    let model = if service.model.starts_with("models/") {
        service.model.clone()
    } else {
        format!("models/{}", service.model)
    };

    ClientMessage::Setup(Setup {
        model,
        generation_config: GenerationConfig {
            response_modalities: vec![Modality::Audio],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: service.voice.clone(),
                    },
                },
            },
        },
        system_instruction: Content {
            parts: vec![TextPart {
                text: service.system_prompt.clone(),
            }],
        },
        tools: vec![Tool {
            function_declarations: bridge.declarations(),
        }],
        input_audio_transcription: AudioTranscriptionConfig::default(),
        output_audio_transcription: AudioTranscriptionConfig::default(),
    })
}

struct ActiveSession {
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

/// Starts and stops sessions. At most one session is active at a time.
pub struct SessionManager {
    config: Arc<Config>,
    audio: Arc<dyn AudioSystem>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    active: Option<ActiveSession>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        audio: Arc<dyn AudioSystem>,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config: Arc::new(config),
            audio,
            connector,
            events,
            state: Arc::new(state),
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Acquire the microphone, the output device and the channel, in that
    /// order, and start the session. Readiness is reported later as
    /// `SessionEvent::Connected`. A failure is both returned and emitted as
    /// `SessionEvent::Error`; nothing is retried.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.state().is_active() {
            return Err(SessionError::AlreadyActive);
        }

        // Reap a session that ended on its own.
        if let Some(old) = self.active.take() {
            if let Err(e) = old.task.await {
                log::error!("Previous session task failed: {}", e);
            }
        }

        log::info!("Connecting session...");
        self.state.send_replace(ConnectionState::Connecting);

        match self.start().await {
            Ok(active) => {
                self.active = Some(active);
                Ok(())
            }
            Err(e) => {
                log::error!("Connect failed: {}", e);
                self.state.send_replace(ConnectionState::Error);
                let _ = self.events.send(SessionEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Stop the running session and wait until its resources are released.
    /// A no-op when no session is running.
    pub async fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let _ = active.control.try_send(Control::Disconnect);
        if let Err(e) = active.task.await {
            log::error!("Session task failed: {}", e);
        }
    }

    async fn start(&self) -> Result<ActiveSession, SessionError> {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let mut capture = self.audio.open_capture(chunk_tx)?;

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let mut output = match self.audio.open_output(playback_tx) {
            Ok(output) => output,
            Err(e) => {
                drop(chunk_rx);
                capture.stop();
                return Err(e.into());
            }
        };

        let bridge = ToolBridge::default();
        let setup = session_setup(&self.config.service, &bridge);
        let channel = match self.connector.open(setup).await {
            Ok(channel) => channel,
            Err(e) => {
                drop(chunk_rx);
                capture.stop();
                output.close();
                return Err(e.into());
            }
        };

        let (control_tx, control_rx) = mpsc::channel(1);
        let controller = SessionController::new(
            self.config.clone(),
            self.state.clone(),
            self.events.clone(),
            control_rx,
            SessionResources {
                chunks: chunk_rx,
                capture,
                scheduler: PlaybackScheduler::new(output),
                playback: playback_rx,
                channel,
                bridge,
            },
        );
        let task = tokio::spawn(controller.run());

        Ok(ActiveSession {
            control: control_tx,
            task,
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.control.try_send(Control::Disconnect);
        }
    }
}
