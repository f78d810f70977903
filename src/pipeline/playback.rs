//! # Playback Scheduling
//!
//! Paces synthesized PCM into the session's outbound track at real-time rate.
//!
//! ## Key Behavior:
//! - Byte chunks are re-aligned to 16-bit samples; an odd trailing byte is carried
//!   into the next chunk instead of being played as half a sample
//! - Samples go out in frames of at most `frame_samples`, each followed by a sleep
//!   matching the frame's duration
//! - Before every frame the task's interaction id is compared with the session's
//!   current id; a mismatch abandons the rest of the sentence

use crate::config::PlaybackConfig;
use crate::pipeline::interaction::{InteractionClock, InteractionId};
use crate::room::{AudioFrame, AudioOutput};
use crate::speech::synthesis::AudioChunkStream;
use byteorder::{ByteOrder, LittleEndian};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Splits a PCM byte stream into sample-aligned frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    leftover: Option<u8>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            leftover: None,
        }
    }

    /// Consume one chunk and return the frames it completes.
    ///
    /// Every whole sample available is returned right away; the last frame may be
    /// shorter than `frame_samples`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<i16>> {
        let mut combined = Vec::with_capacity(chunk.len() + 1);
        combined.extend(self.leftover.take());
        combined.extend_from_slice(chunk);

        if combined.len() % 2 == 1 {
            self.leftover = combined.pop();
        }

        let mut samples = vec![0i16; combined.len() / 2];
        LittleEndian::read_i16_into(&combined, &mut samples);

        samples
            .chunks(self.frame_samples)
            .map(|frame| frame.to_vec())
            .collect()
    }

    pub fn leftover(&self) -> Option<u8> {
        self.leftover
    }
}

/// How one sentence's playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed { frames: usize },
    Superseded { frames: usize },
    Failed { frames: usize },
}

/// Plays sentence audio into one output track for one session.
#[derive(Clone)]
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    clock: InteractionClock,
    config: PlaybackConfig,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>, clock: InteractionClock, config: PlaybackConfig) -> Self {
        Self {
            output,
            clock,
            config,
        }
    }

    pub fn is_current(&self, id: InteractionId) -> bool {
        self.clock.is_current(id)
    }

    /// Play one sentence's audio for interaction `id`.
    ///
    /// Synthesis errors end the sentence early with `Failed`; the caller moves on to
    /// the next sentence. Only a newer interaction yields `Superseded`.
    pub async fn play(&self, id: InteractionId, mut audio: AudioChunkStream) -> PlaybackOutcome {
        let mut assembler = FrameAssembler::new(self.config.frame_samples);
        let mut frames = 0usize;

        while let Some(chunk) = audio.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(interaction_id = id, error = %err, "Synthesis failed, skipping sentence");
                    return PlaybackOutcome::Failed { frames };
                }
            };

            for samples in assembler.push(&chunk) {
                if !self.clock.is_current(id) {
                    debug!(interaction_id = id, frames, "Playback superseded");
                    return PlaybackOutcome::Superseded { frames };
                }

                let frame = AudioFrame::new(samples, self.config.sample_rate, self.config.channels);
                let pace = frame.duration();
                if let Err(err) = self.output.capture_frame(frame).await {
                    warn!(interaction_id = id, error = %err, "Output track rejected frame");
                    return PlaybackOutcome::Failed { frames };
                }
                frames += 1;
                tokio::time::sleep(pace).await;
            }
        }

        if assembler.leftover().is_some() {
            debug!(interaction_id = id, "Dropping unpaired trailing byte");
        }
        PlaybackOutcome::Completed { frames }
    }
}
