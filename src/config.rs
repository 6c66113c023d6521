use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;

const DEFAULT_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SYSTEM_PROMPT: &str = "\
Eres el Asistente Virtual Oficial de SMC (Sistemas Modulares de Computación), empresa con más de 40 años \
entregando soluciones tecnológicas a municipalidades de Chile.

Perfil: tono profesional, corporativo, amable y eficiente. Tu misión es asistir a funcionarios municipales \
con problemas técnicos u operativos en los sistemas SMC.

Flujo de la conversación:
1. Saludo: \"Bienvenido al soporte de SMC. Soy su asistente virtual. Para comenzar, ¿podría indicarme su nombre y correo institucional?\"
2. Identificación: confirma los datos.
3. Contexto: \"¿De qué municipalidad nos llama?\"
4. Clasificación: \"¿Con qué sistema tiene inconvenientes? (Ej: Contabilidad, Tesorería, PCV, JPL, Remuneraciones, etc.)\"
5. Diagnóstico: \"Por favor, descríbame brevemente el problema.\"
6. Acción: si tienes una sugerencia rápida, dala. Luego di: \"Perfecto. He registrado los antecedentes. \
Generaré un ticket de soporte inmediato para derivarlo a un consultor especializado.\"
7. Ticket: ejecuta la herramienta 'submitTicket'.
8. Cierre: confirma la creación del ticket y despídete cordialmente.

Importante: respuestas breves y directas, pensadas para voz. No inventes soluciones técnicas complejas; \
tu rol principal es el triaje y la creación del ticket.";

/// Remote inference service settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub ws_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_prompt: String,
    /// How long to wait for `setupComplete` after the socket opens.
    pub setup_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_key: String::new(),
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Kore".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            setup_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the outbound queue to the channel task.
    pub command_buffer: usize,
    /// Output level sampling period, roughly one display frame.
    pub meter_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_buffer: 100,
            meter_interval_ms: 16,
        }
    }
}

// GUI进程配置，Core进程和GUI进程通过本地UDP通信
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GuiConfig {
    pub enabled: bool,
    pub local_port: u16,
    pub remote_port: u16,
    pub buffer_size: usize,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_port: 5675,
            remote_port: 5676,
            buffer_size: 4096,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub gui: GuiConfig,
}

impl Config {
    /// Load `config.toml` (optional) from the working directory, then apply
    /// `INTAKE__SECTION__FIELD` environment overrides.
    ///
    /// An empty `service.api_key` falls back to `GEMINI_API_KEY`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("INTAKE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut cfg: Config = settings.try_deserialize()?;
        if cfg.service.api_key.is_empty() {
            if let Ok(key) = std::env::var("GEMINI_API_KEY") {
                cfg.service.api_key = key;
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_rates() {
        let cfg = Config::default();
        assert_eq!(cfg.audio.input_sample_rate, 16_000);
        assert_eq!(cfg.audio.output_sample_rate, 24_000);
        assert_eq!(cfg.service.voice, "Kore");
        assert!(cfg.service.system_prompt.contains("submitTicket"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[service]\nvoice = \"Puck\"\n[audio]\nchunk_frames = 2048\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let cfg: Config = settings.try_deserialize().unwrap();

        assert_eq!(cfg.service.voice, "Puck");
        assert_eq!(cfg.service.setup_timeout_ms, 10_000);
        assert_eq!(cfg.audio.chunk_frames, 2048);
        assert_eq!(cfg.audio.capture_device, "default");
        assert_eq!(cfg.session.command_buffer, 100);
    }
}
