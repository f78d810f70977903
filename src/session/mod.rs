//! # Room Sessions
//!
//! One actor per interview room, plus the registry that keeps at most one per room name.

pub mod registry;
pub mod room_session;

use crate::config::{AppConfig, PlaybackConfig};
use crate::pipeline::InteractionPipeline;
use crate::problem::ProblemStore;
use crate::room::RoomConnector;
use crate::speech::recognition::{RecognitionConfig, SpeechRecognizer};
use std::sync::Arc;
use std::time::Duration;

/// Process-wide collaborators handed to every session.
///
/// Built once by the composition root; sessions never reach for globals.
pub struct SessionDeps {
    pub connector: Arc<dyn RoomConnector>,
    pub problems: Arc<dyn ProblemStore>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub recognition: RecognitionConfig,
    pub rotation_interval: Duration,
    pub pipeline: InteractionPipeline,
    pub playback: PlaybackConfig,
    pub identity_prefix: String,
}

impl SessionDeps {
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn RoomConnector>,
        problems: Arc<dyn ProblemStore>,
        recognizer: Arc<dyn SpeechRecognizer>,
        pipeline: InteractionPipeline,
    ) -> Self {
        Self {
            connector,
            problems,
            recognizer,
            recognition: RecognitionConfig::from(&config.speech),
            rotation_interval: config.rotation_interval(),
            pipeline,
            playback: config.playback.clone(),
            identity_prefix: config.room.agent_identity_prefix.clone(),
        }
    }
}
