//! # Room Transport
//!
//! The seam between a session and the live audio room. A session only ever sees:
//! - `RoomConnector`: opens a connection for an agent identity
//! - `RoomLink`: the open connection (publish a track, disconnect)
//! - `AudioOutput`: the agent's outbound audio track
//! - `RoomEvent`: everything the room reports, delivered in order on one channel
//!
//! The concrete transport is `bridge::BridgeConnector`.

pub mod bridge;
pub mod token;

use crate::error::{ProviderError, RoomError};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Name of the track the agent speaks on.
pub const AGENT_TRACK_NAME: &str = "ai-voice";

/// A block of interleaved 16-bit PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Decode little-endian PCM. A trailing odd byte is ignored.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> Self {
        let mut samples = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(&bytes[..samples.len() * 2], &mut samples);
        Self::new(samples, sample_rate, channels)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.samples.len() * 2];
        LittleEndian::write_i16_into(&self.samples, &mut bytes);
        bytes
    }

    /// Wall-clock length of the frame.
    pub fn duration(&self) -> Duration {
        let per_channel = self.samples.len() as u64 / u64::from(self.channels.max(1));
        Duration::from_micros(per_channel * 1_000_000 / u64::from(self.sample_rate.max(1)))
    }
}

/// Inbound audio from one remote participant's track. Ends when the track goes away.
pub type AudioFrameStream = BoxStream<'static, AudioFrame>;

/// Something that happened in the room.
pub enum RoomEvent {
    ParticipantConnected {
        identity: String,
    },
    ParticipantDisconnected {
        identity: String,
    },
    DataReceived {
        participant: Option<String>,
        payload: Vec<u8>,
    },
    AudioTrackSubscribed {
        participant: String,
        track_sid: String,
        frames: AudioFrameStream,
    },
    AudioTrackUnsubscribed {
        participant: String,
        track_sid: String,
    },
    Disconnected {
        reason: String,
    },
}

impl fmt::Debug for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomEvent::ParticipantConnected { identity } => f
                .debug_struct("ParticipantConnected")
                .field("identity", identity)
                .finish(),
            RoomEvent::ParticipantDisconnected { identity } => f
                .debug_struct("ParticipantDisconnected")
                .field("identity", identity)
                .finish(),
            RoomEvent::DataReceived {
                participant,
                payload,
            } => f
                .debug_struct("DataReceived")
                .field("participant", participant)
                .field("bytes", &payload.len())
                .finish(),
            RoomEvent::AudioTrackSubscribed {
                participant,
                track_sid,
                ..
            } => f
                .debug_struct("AudioTrackSubscribed")
                .field("participant", participant)
                .field("track_sid", track_sid)
                .finish(),
            RoomEvent::AudioTrackUnsubscribed {
                participant,
                track_sid,
            } => f
                .debug_struct("AudioTrackUnsubscribed")
                .field("participant", participant)
                .field("track_sid", track_sid)
                .finish(),
            RoomEvent::Disconnected { reason } => f
                .debug_struct("Disconnected")
                .field("reason", reason)
                .finish(),
        }
    }
}

/// The agent's outbound audio track.
///
/// `capture_frame` resolves once the frame has been handed to the transport, which is
/// the one-frame-in-flight backpressure the playback scheduler relies on.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn capture_frame(&self, frame: AudioFrame) -> Result<(), ProviderError>;
}

/// An open room connection.
#[async_trait]
pub trait RoomLink: Send + Sync {
    /// Publish a new local audio track and return its frame sink.
    async fn publish_audio_track(
        &self,
        name: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<dyn AudioOutput>, RoomError>;

    /// Leave the room. Safe to call more than once.
    async fn disconnect(&self);
}

pub struct RoomConnection {
    pub link: Arc<dyn RoomLink>,
    pub events: mpsc::Receiver<RoomEvent>,
}

/// Opens room connections with auto-subscribe enabled.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(&self, room_name: &str, identity: &str) -> Result<RoomConnection, RoomError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0; 480], 16000, 1);
        assert_eq!(frame.duration(), Duration::from_millis(30));

        let stereo = AudioFrame::new(vec![0; 960], 16000, 2);
        assert_eq!(stereo.duration(), Duration::from_millis(30));
    }

    #[test]
    fn test_from_le_bytes_drops_odd_tail() {
        let frame = AudioFrame::from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x7f], 16000, 1);
        assert_eq!(frame.samples, vec![1, -1]);
        assert_eq!(frame.to_le_bytes(), vec![0x01, 0x00, 0xff, 0xff]);
    }
}
