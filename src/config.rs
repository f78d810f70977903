//! # Configuration Management
//!
//! Loads the worker configuration from several layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables with the `APP_` prefix (`APP_SECTION__FIELD`)
//! - Deployment environment variables (`ROOM_BRIDGE_URL`, `ELEVENLABS_API_KEY`, `PORT`, ...)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment environment variables
//! 2. `APP_` environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Missing credentials are not defaulted. `validate()` rejects them so the process
//! never starts half-configured.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Deployment variables mapped onto configuration keys.
///
/// These keep the names the worker has always been deployed with, so an existing
/// `.env` file or compose file keeps working without the `APP_` prefix.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("ROOM_BRIDGE_URL", "room.url"),
    ("LIVEKIT_API_KEY", "room.api_key"),
    ("LIVEKIT_API_SECRET", "room.api_secret"),
    ("AGENT_IDENTITY", "room.agent_identity_prefix"),
    ("DEEPGRAM_API_KEY", "speech.api_key"),
    ("GCP_SPEECH_LANGUAGE", "speech.language_code"),
    ("SPEECH_LANGUAGE", "speech.language_code"),
    ("GEMINI_API_KEY", "llm.api_key"),
    ("ELEVENLABS_API_KEY", "synthesis.api_key"),
    ("PROBLEMS_API_URL", "problems.base_url"),
    ("PROBLEMS_FILE", "problems.file_path"),
];

/// Room service signalling URL. The worker speaks the agent bridge protocol, not the
/// room service's own signalling, so this is never read as `room.url`.
const ROOM_SIGNALLING_URL_VAR: &str = "LIVEKIT_URL";

/// Main worker configuration.
///
/// ## Sections:
/// - `server`: where the join endpoint listens
/// - `room`: the media room service and the agent's credentials for it
/// - `speech`: the streaming recognizer and its rotation policy
/// - `llm`: the language model that writes interviewer replies
/// - `synthesis`: the text-to-speech voice
/// - `problems`: where problem context is looked up
/// - `playback`: outbound audio framing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub room: RoomConfig,
    pub speech: SpeechConfig,
    pub llm: LlmConfig,
    pub synthesis: SynthesisConfig,
    pub problems: ProblemsConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Room service settings.
///
/// ## Fields:
/// - `url`: websocket URL of the agent media bridge (e.g. `wss://bridge.example.com`),
///   not the room service's own signalling endpoint
/// - `api_key` / `api_secret`: used to sign the agent's access token
/// - `agent_identity_prefix`: each session joins as `<prefix>-<random suffix>`
/// - `token_ttl_secs`: lifetime of the signed access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub agent_identity_prefix: String,
    pub token_ttl_secs: u64,
}

/// Streaming speech recognition settings.
///
/// ## Rotation:
/// Providers cap how long one streaming session may live (`stream_limit_secs`).
/// The adapter replaces its stream every `rotation_interval_secs`, which must stay
/// below the limit. The default rotates at roughly 80% of the limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub language_code: String,
    pub sample_rate: u32,
    pub interim_results: bool,
    pub automatic_punctuation: bool,
    pub stream_limit_secs: u64,
    pub rotation_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub base_url: String,
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
}

/// Which backend answers problem lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemSource {
    Http,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemsConfig {
    pub source: ProblemSource,
    pub base_url: String,
    pub file_path: String,
    pub default_problem_id: String,
}

/// Outbound audio framing.
///
/// `frame_samples` of 480 at 16 kHz gives 30 ms frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_samples: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            room: RoomConfig {
                url: String::new(),
                api_key: String::new(),
                api_secret: String::new(),
                agent_identity_prefix: "orbit-agent".to_string(),
                token_ttl_secs: 3600,
            },
            speech: SpeechConfig {
                endpoint: "wss://api.deepgram.com/v1/listen".to_string(),
                api_key: String::new(),
                model: "nova-2".to_string(),
                language_code: "en-US".to_string(),
                sample_rate: 16000,
                interim_results: true,
                automatic_punctuation: true,
                stream_limit_secs: 305,
                rotation_interval_secs: 240,
            },
            llm: LlmConfig {
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                api_key: String::new(),
                model: "gemini-1.5-flash".to_string(),
                temperature: 0.7,
                max_output_tokens: 256,
            },
            synthesis: SynthesisConfig {
                base_url: "https://api.elevenlabs.io".to_string(),
                api_key: String::new(),
                voice_id: "cjVigY5qzO86Huf0OWal".to_string(),
                model_id: "eleven_turbo_v2_5".to_string(),
                output_format: "pcm_16000".to_string(),
            },
            problems: ProblemsConfig {
                source: ProblemSource::Http,
                base_url: "http://web:3000".to_string(),
                file_path: "problems.json".to_string(),
                default_problem_id: "1".to_string(),
            },
            playback: PlaybackConfig {
                sample_rate: 16000,
                channels: 1,
                frame_samples: 480,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: override the server port
    /// - `APP_SPEECH__ROTATION_INTERVAL_SECS=120`: rotate recognition streams sooner
    /// - `LIVEKIT_API_SECRET=...`: deployment-style credential override
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }
        if env::var(ROOM_SIGNALLING_URL_VAR).is_ok() && env::var("ROOM_BRIDGE_URL").is_err() {
            warn!(
                "{} is set but ignored; point ROOM_BRIDGE_URL at the room service's agent bridge",
                ROOM_SIGNALLING_URL_VAR
            );
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the worker cannot run with.
    ///
    /// Every failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let required = [
            ("room.url", &self.room.url),
            ("room.api_key", &self.room.api_key),
            ("room.api_secret", &self.room.api_secret),
            ("speech.api_key", &self.speech.api_key),
            ("llm.api_key", &self.llm.api_key),
            ("synthesis.api_key", &self.synthesis.api_key),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(key, _)| *key)
            .collect();
        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "Missing required configuration: {}",
                missing.join(", ")
            ));
        }

        if self.speech.rotation_interval_secs == 0
            || self.speech.rotation_interval_secs >= self.speech.stream_limit_secs
        {
            return Err(anyhow::anyhow!(
                "Recognition rotation interval ({}s) must be non-zero and below the stream limit ({}s)",
                self.speech.rotation_interval_secs,
                self.speech.stream_limit_secs
            ));
        }

        if self.playback.frame_samples == 0 || self.playback.sample_rate == 0 {
            return Err(anyhow::anyhow!("Playback frame size and sample rate must be greater than 0"));
        }

        if self.playback.channels == 0 {
            return Err(anyhow::anyhow!("Playback channel count must be greater than 0"));
        }

        let location = match self.problems.source {
            ProblemSource::Http => &self.problems.base_url,
            ProblemSource::File => &self.problems.file_path,
        };
        if location.trim().is_empty() {
            return Err(anyhow::anyhow!("Problem source location is not configured"));
        }

        Ok(())
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.speech.rotation_interval_secs)
    }

    pub fn stream_limit(&self) -> Duration {
        Duration::from_secs(self.speech.stream_limit_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.room.url = "wss://rooms.test".to_string();
    config.room.api_key = "APIkey".to_string();
    config.room.api_secret = "secret".to_string();
    config.speech.api_key = "speech-key".to_string();
    config.llm.api_key = "llm-key".to_string();
    config.synthesis.api_key = "tts-key".to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults carry no credentials, so they must not pass validation on their own.
    #[test]
    fn test_default_config_requires_credentials() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.room.agent_identity_prefix, "orbit-agent");

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("room.api_secret"));
        assert!(err.contains("synthesis.api_key"));
    }

    #[test]
    fn test_complete_config_is_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_rotation_must_precede_limit() {
        let mut config = test_config();
        config.speech.rotation_interval_secs = config.speech.stream_limit_secs;
        assert!(config.validate().is_err());

        config.speech.rotation_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_rotation_is_below_limit() {
        let config = AppConfig::default();
        assert!(config.rotation_interval() < config.stream_limit());
        assert_eq!(config.rotation_interval(), Duration::from_secs(240));
    }

    #[test]
    fn test_bridge_url_comes_from_its_own_variable() {
        let room_url_vars: Vec<&str> = ENV_OVERRIDES
            .iter()
            .filter(|(_, key)| *key == "room.url")
            .map(|(var, _)| *var)
            .collect();
        assert_eq!(room_url_vars, vec!["ROOM_BRIDGE_URL"]);
        assert!(ENV_OVERRIDES.iter().all(|(var, _)| *var != ROOM_SIGNALLING_URL_VAR));
    }

    #[test]
    fn test_problem_source_location_checked() {
        let mut config = test_config();
        config.problems.source = ProblemSource::File;
        config.problems.file_path = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
