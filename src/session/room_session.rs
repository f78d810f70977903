//! # Room Session
//!
//! A single-owner actor for one interview room. Room events and internal messages are
//! processed one at a time by the session's own task, so the conversation state
//! (latest code, chat history, recognition adapters, output track) needs no locking.
//!
//! ## Event Handling:
//! - Participant joined/left: logged
//! - Data `{type: "code_update", code}`: replaces the latest code (last write wins)
//! - Audio track subscribed: starts a recognition adapter for that participant
//! - Audio track unsubscribed: ends that participant's adapter
//! - Room disconnected or stop requested: every adapter ends, the link closes and the
//!   registry's teardown hook runs
//!
//! Each final transcript mints an interaction id and spawns the reply chain for it.
//! Replies join the history only if their interaction is still current when they finish.

use crate::error::SessionStartError;
use crate::llm::ChatMessage;
use crate::pipeline::interaction::{InteractionClock, InteractionId};
use crate::pipeline::playback::PlaybackScheduler;
use crate::pipeline::{InteractionOutcome, InteractionRequest};
use crate::problem::{load_problem_context, ProblemContext};
use crate::room::{RoomConnection, RoomEvent, RoomLink, AGENT_TRACK_NAME};
use crate::session::SessionDeps;
use crate::speech::recognition::{RecognitionAdapter, RecognitionError, TranscriptHandler};
use futures_util::future::join_all;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Called once, after the session has released everything.
pub type TeardownHook = Box<dyn FnOnce(&str, Uuid) + Send>;

pub(crate) enum SessionMessage {
    Utterance {
        participant: String,
        text: String,
    },
    InteractionFinished {
        id: InteractionId,
        outcome: InteractionOutcome,
    },
    Stop(oneshot::Sender<()>),
}

/// Data channel payloads the agent understands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DataMessage {
    CodeUpdate { code: String },
}

fn parse_code_update(payload: &[u8]) -> Option<String> {
    match serde_json::from_slice::<DataMessage>(payload) {
        Ok(DataMessage::CodeUpdate { code }) => Some(code),
        Err(_) => None,
    }
}

/// Forwards one participant's transcripts into the session mailbox.
struct SessionTranscripts {
    participant: String,
    mailbox: mpsc::UnboundedSender<SessionMessage>,
}

impl TranscriptHandler for SessionTranscripts {
    fn on_partial(&self, text: &str) {
        trace!(participant = %self.participant, text, "Partial transcript");
    }

    fn on_final(&self, text: String) {
        let _ = self.mailbox.send(SessionMessage::Utterance {
            participant: self.participant.clone(),
            text,
        });
    }

    fn on_error(&self, error: RecognitionError) {
        warn!(participant = %self.participant, error = %error, "Speech recognition error");
    }
}

/// Cheap, cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub room_name: String,
    pub identity: String,
    pub session_id: Uuid,
    mailbox: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    /// Ask the session to shut down and wait until it has.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.mailbox.send(SessionMessage::Stop(ack)).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// The session task has exited.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

struct ActiveAdapter {
    track_sid: String,
    adapter: RecognitionAdapter,
}

struct RoomSession {
    room_name: String,
    identity: String,
    session_id: Uuid,
    deps: Arc<SessionDeps>,
    link: Arc<dyn RoomLink>,
    context: Option<Arc<ProblemContext>>,
    latest_code: String,
    history: Vec<ChatMessage>,
    clock: InteractionClock,
    adapters: HashMap<String, ActiveAdapter>,
    playback: Option<PlaybackScheduler>,
    mailbox: mpsc::UnboundedSender<SessionMessage>,
}

/// Load the problem, connect to the room and spawn the session actor.
pub async fn start(
    room_name: &str,
    problem_id: &str,
    identity: String,
    deps: Arc<SessionDeps>,
    on_closed: TeardownHook,
) -> Result<SessionHandle, SessionStartError> {
    let context = load_problem_context(deps.problems.as_ref(), problem_id)
        .await
        .map(Arc::new);

    let RoomConnection { link, events } = deps
        .connector
        .connect(room_name, &identity)
        .await
        .map_err(|source| SessionStartError::Connect {
            room_name: room_name.to_string(),
            source,
        })?;

    let session_id = Uuid::new_v4();
    let (mailbox, inbox) = mpsc::unbounded_channel();
    let session = RoomSession {
        room_name: room_name.to_string(),
        identity: identity.clone(),
        session_id,
        deps,
        link,
        context,
        latest_code: String::new(),
        history: Vec::new(),
        clock: InteractionClock::new(),
        adapters: HashMap::new(),
        playback: None,
        mailbox: mailbox.clone(),
    };
    tokio::spawn(session.run(events, inbox, on_closed));

    Ok(SessionHandle {
        room_name: room_name.to_string(),
        identity,
        session_id,
        mailbox,
    })
}

impl RoomSession {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<RoomEvent>,
        mut inbox: mpsc::UnboundedReceiver<SessionMessage>,
        on_closed: TeardownHook,
    ) {
        info!(
            room = %self.room_name,
            identity = %self.identity,
            has_problem = self.context.is_some(),
            "Session started"
        );

        let stop_ack = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RoomEvent::Disconnected { reason }) => {
                        info!(room = %self.room_name, reason = %reason, "Room disconnected");
                        break None;
                    }
                    Some(event) => self.handle_event(event),
                    None => break None,
                },
                message = inbox.recv() => match message {
                    Some(SessionMessage::Stop(ack)) => break Some(ack),
                    Some(message) => self.handle_message(message).await,
                    None => break None,
                },
            }
        };

        self.close().await;
        on_closed(&self.room_name, self.session_id);
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::ParticipantConnected { identity } => {
                info!(room = %self.room_name, participant = %identity, "Participant joined");
            }
            RoomEvent::ParticipantDisconnected { identity } => {
                info!(room = %self.room_name, participant = %identity, "Participant left");
            }
            RoomEvent::DataReceived {
                participant,
                payload,
            } => {
                if let Some(code) = parse_code_update(&payload) {
                    debug!(room = %self.room_name, participant = ?participant, bytes = code.len(), "Code updated");
                    self.latest_code = code;
                }
            }
            RoomEvent::AudioTrackSubscribed {
                participant,
                track_sid,
                frames,
            } => {
                info!(room = %self.room_name, participant = %participant, track_sid = %track_sid, "Transcribing audio track");
                let handler = Arc::new(SessionTranscripts {
                    participant: participant.clone(),
                    mailbox: self.mailbox.clone(),
                });
                let adapter = RecognitionAdapter::spawn(
                    participant.clone(),
                    Arc::clone(&self.deps.recognizer),
                    self.deps.recognition.clone(),
                    self.deps.rotation_interval,
                    frames,
                    handler,
                );
                if let Some(previous) = self
                    .adapters
                    .insert(participant, ActiveAdapter { track_sid, adapter })
                {
                    debug!(
                        room = %self.room_name,
                        participant = previous.adapter.participant(),
                        state = ?previous.adapter.state(),
                        "Replacing recognition adapter"
                    );
                    previous.adapter.end();
                }
            }
            RoomEvent::AudioTrackUnsubscribed {
                participant,
                track_sid,
            } => {
                let same_track = self
                    .adapters
                    .get(&participant)
                    .is_some_and(|active| active.track_sid == track_sid);
                if same_track {
                    if let Some(active) = self.adapters.remove(&participant) {
                        info!(room = %self.room_name, participant = %participant, "Audio track ended");
                        active.adapter.end();
                    }
                }
            }
            RoomEvent::Disconnected { .. } => {}
        }
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Utterance { participant, text } => self.on_utterance(participant, text).await,
            SessionMessage::InteractionFinished { id, outcome } => self.on_finished(id, outcome),
            SessionMessage::Stop(_) => {}
        }
    }

    async fn on_utterance(&mut self, participant: String, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.history.push(ChatMessage::candidate(text));
        let id = self.clock.mint();
        info!(room = %self.room_name, participant = %participant, interaction_id = id, text, "Candidate finished speaking");

        let Some(playback) = self.ensure_output().await else {
            return;
        };
        let request = InteractionRequest {
            id,
            history: self.history.clone(),
            latest_code: self.latest_code.clone(),
            context: self.context.clone(),
        };
        let pipeline = self.deps.pipeline.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let outcome = pipeline.run(request, &playback).await;
            let _ = mailbox.send(SessionMessage::InteractionFinished { id, outcome });
        });
    }

    fn on_finished(&mut self, id: InteractionId, outcome: InteractionOutcome) {
        match outcome {
            InteractionOutcome::Completed { reply, .. } if self.clock.is_current(id) && !reply.is_empty() => {
                self.history.push(ChatMessage::interviewer(reply));
            }
            _ => debug!(room = %self.room_name, interaction_id = id, "Discarding reply"),
        }
    }

    /// Publish the agent track on first use; later interactions reuse it.
    async fn ensure_output(&mut self) -> Option<PlaybackScheduler> {
        if self.playback.is_none() {
            let config = &self.deps.playback;
            match self
                .link
                .publish_audio_track(AGENT_TRACK_NAME, config.sample_rate, config.channels)
                .await
            {
                Ok(output) => {
                    self.playback = Some(PlaybackScheduler::new(output, self.clock.clone(), config.clone()));
                }
                Err(err) => {
                    warn!(room = %self.room_name, error = %err, "Could not publish agent track");
                    return None;
                }
            }
        }
        self.playback.clone()
    }

    async fn close(&mut self) {
        // Any reply still in flight goes stale at its next checkpoint.
        self.clock.mint();

        let adapters: Vec<_> = self
            .adapters
            .drain()
            .map(|(_, active)| active.adapter.shutdown())
            .collect();
        join_all(adapters).await;

        self.link.disconnect().await;
        info!(room = %self.room_name, identity = %self.identity, "Session closed");
    }
}
