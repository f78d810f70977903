//! # Media Bridge Connector
//!
//! Connects to the room service's agent bridge over a websocket. The bridge terminates
//! the media transport and exchanges plain PCM with the worker:
//!
//! ## Wire Format:
//! - Text frames: JSON events and commands tagged by `type`
//! - Binary frames: `[u16 LE track id length][track id][16-bit LE PCM]`
//!
//! Inbound audio is 16 kHz mono. Each subscribed track gets its own frame channel;
//! the channel closes when the track is unsubscribed or the connection drops.

use crate::config::RoomConfig;
use crate::error::{ProviderError, RoomError};
use crate::room::token::AccessToken;
use crate::room::{AudioFrame, AudioOutput, RoomConnection, RoomConnector, RoomEvent, RoomLink};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound sample rate the bridge delivers.
const INBOUND_SAMPLE_RATE: u32 = 16000;
const OUTBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;
const TRACK_CAPACITY: usize = 256;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    ParticipantConnected {
        identity: String,
    },
    ParticipantDisconnected {
        identity: String,
    },
    DataReceived {
        #[serde(default)]
        participant: Option<String>,
        payload: String,
    },
    TrackSubscribed {
        participant: String,
        track_sid: String,
        kind: String,
    },
    TrackUnsubscribed {
        participant: String,
        track_sid: String,
    },
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    PublishTrack {
        name: &'a str,
        sample_rate: u32,
        channels: u16,
    },
    Leave,
}

impl BridgeCommand<'_> {
    fn to_message(&self) -> Result<Message, RoomError> {
        serde_json::to_string(self)
            .map(Message::Text)
            .map_err(|e| RoomError::Connect(e.to_string()))
    }
}

fn encode_audio_packet(track: &str, samples: &[i16]) -> Vec<u8> {
    let id = &track.as_bytes()[..track.len().min(u16::MAX as usize)];
    let mut packet = vec![0u8; 2 + id.len() + samples.len() * 2];
    LittleEndian::write_u16(&mut packet[..2], id.len() as u16);
    packet[2..2 + id.len()].copy_from_slice(id);
    LittleEndian::write_i16_into(samples, &mut packet[2 + id.len()..]);
    packet
}

fn decode_audio_packet(data: &[u8]) -> Option<(String, AudioFrame)> {
    if data.len() < 2 {
        return None;
    }
    let id_len = LittleEndian::read_u16(&data[..2]) as usize;
    let id = data.get(2..2 + id_len)?;
    let track = std::str::from_utf8(id).ok()?.to_string();
    let frame = AudioFrame::from_le_bytes(&data[2 + id_len..], INBOUND_SAMPLE_RATE, 1);
    Some((track, frame))
}

/// Per-connection routing of inbound audio to subscribed tracks.
#[derive(Default)]
struct TrackRouter {
    tracks: HashMap<String, mpsc::Sender<AudioFrame>>,
}

impl TrackRouter {
    /// Translate a bridge event, opening or closing frame channels as needed.
    fn translate(&mut self, event: BridgeEvent) -> Option<RoomEvent> {
        match event {
            BridgeEvent::ParticipantConnected { identity } => {
                Some(RoomEvent::ParticipantConnected { identity })
            }
            BridgeEvent::ParticipantDisconnected { identity } => {
                Some(RoomEvent::ParticipantDisconnected { identity })
            }
            BridgeEvent::DataReceived {
                participant,
                payload,
            } => match STANDARD.decode(payload.as_bytes()) {
                Ok(payload) => Some(RoomEvent::DataReceived {
                    participant,
                    payload,
                }),
                Err(err) => {
                    debug!(error = %err, "Ignoring undecodable data packet");
                    None
                }
            },
            BridgeEvent::TrackSubscribed {
                participant,
                track_sid,
                kind,
            } => {
                if kind != "audio" {
                    return None;
                }
                let (tx, rx) = mpsc::channel(TRACK_CAPACITY);
                self.tracks.insert(track_sid.clone(), tx);
                Some(RoomEvent::AudioTrackSubscribed {
                    participant,
                    track_sid,
                    frames: ReceiverStream::new(rx).boxed(),
                })
            }
            BridgeEvent::TrackUnsubscribed {
                participant,
                track_sid,
            } => {
                self.tracks.remove(&track_sid)?;
                Some(RoomEvent::AudioTrackUnsubscribed {
                    participant,
                    track_sid,
                })
            }
            BridgeEvent::Disconnected { reason } => Some(RoomEvent::Disconnected {
                reason: reason.unwrap_or_else(|| "server closed the room".to_string()),
            }),
        }
    }

    async fn route(&mut self, data: &[u8]) {
        let Some((track, frame)) = decode_audio_packet(data) else {
            debug!(bytes = data.len(), "Ignoring malformed audio packet");
            return;
        };
        let Some(tx) = self.tracks.get(&track) else {
            return;
        };
        if tx.send(frame).await.is_err() {
            // Nobody listens to this track any more.
            self.tracks.remove(&track);
        }
    }
}

pub struct BridgeConnector {
    config: RoomConfig,
}

impl BridgeConnector {
    pub fn new(config: RoomConfig) -> Self {
        Self { config }
    }

    fn join_url(&self, token: &str) -> Result<reqwest::Url, RoomError> {
        let base = reqwest::Url::parse(&self.config.url)
            .map_err(|e| RoomError::InvalidUrl(format!("{}: {}", self.config.url, e)))?;
        let mut url = base
            .join("rtc")
            .map_err(|e| RoomError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("access_token", token)
            .append_pair("auto_subscribe", "1")
            .append_pair("adaptive_stream", "0")
            .append_pair("dynacast", "1");
        Ok(url)
    }
}

#[async_trait]
impl RoomConnector for BridgeConnector {
    async fn connect(&self, room_name: &str, identity: &str) -> Result<RoomConnection, RoomError> {
        let token = AccessToken::new(&self.config.api_key, &self.config.api_secret, identity)
            .with_ttl(Duration::from_secs(self.config.token_ttl_secs))
            .to_jwt(room_name)?;
        let url = self.join_url(&token)?;

        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RoomError::Connect(e.to_string()))?;
        info!(room = %room_name, identity = %identity, "Connected to room");

        let (sink, source) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        tokio::spawn(outbound_loop(sink, outbound_rx));
        tokio::spawn(inbound_loop(source, events_tx, room_name.to_string()));

        Ok(RoomConnection {
            link: Arc::new(BridgeLink {
                outbound: outbound_tx,
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }
}

async fn outbound_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "Room socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn inbound_loop(mut source: SplitStream<WsStream>, events: mpsc::Sender<RoomEvent>, room: String) {
    let mut router = TrackRouter::default();

    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<BridgeEvent>(&text) {
                Ok(event) => {
                    let Some(event) = router.translate(event) else {
                        continue;
                    };
                    if let RoomEvent::Disconnected { reason } = event {
                        break reason;
                    }
                    if events.send(event).await.is_err() {
                        break "session closed".to_string();
                    }
                }
                Err(err) => debug!(room = %room, error = %err, "Ignoring unknown bridge message"),
            },
            Some(Ok(Message::Binary(data))) => router.route(&data).await,
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "connection closed".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(room = %room, error = %err, "Room socket failed");
                break err.to_string();
            }
            None => break "connection closed".to_string(),
        }
    };

    // Dropping the router closes every inbound track.
    drop(router);
    let _ = events.send(RoomEvent::Disconnected { reason }).await;
}

struct BridgeLink {
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
}

#[async_trait]
impl RoomLink for BridgeLink {
    async fn publish_audio_track(
        &self,
        name: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<dyn AudioOutput>, RoomError> {
        let command = BridgeCommand::PublishTrack {
            name,
            sample_rate,
            channels,
        }
        .to_message()?;
        self.outbound
            .send(command)
            .await
            .map_err(|_| RoomError::Closed)?;
        info!(track = %name, sample_rate, "Published audio track");

        Ok(Arc::new(BridgeAudioOutput {
            track: name.to_string(),
            outbound: self.outbound.clone(),
        }))
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(leave) = BridgeCommand::Leave.to_message() {
            let _ = self.outbound.send(leave).await;
        }
        let _ = self.outbound.send(Message::Close(None)).await;
    }
}

struct BridgeAudioOutput {
    track: String,
    outbound: mpsc::Sender<Message>,
}

#[async_trait]
impl AudioOutput for BridgeAudioOutput {
    async fn capture_frame(&self, frame: AudioFrame) -> Result<(), ProviderError> {
        let packet = encode_audio_packet(&self.track, &frame.samples);
        self.outbound
            .send(Message::Binary(packet))
            .await
            .map_err(|_| ProviderError::Closed)
    }
}
