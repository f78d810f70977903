//! # Speech Recognition Adapter
//!
//! Wraps one participant's audio track in a continuous transcription session.
//!
//! ## State Machine:
//! `Streaming → Rotating → Streaming → … → Ended`
//!
//! Providers cap how long a single streaming request may live, so the adapter replaces
//! its stream on a timer set below that cap. A rotation always opens the new stream
//! first and only then drops the old one, which detaches its result channel. No audio
//! frame is lost in between and the old stream cannot deliver a late duplicate final.
//!
//! ## Rotation Triggers:
//! - The rotation timer expires (scheduled)
//! - The provider reports its maximum-duration error (expected, never surfaced)
//! - Writing a frame fails because the stream is already closed (the frame is then
//!   written to the replacement stream)
//!
//! Any other provider error goes to `TranscriptHandler::on_error` and the adapter keeps
//! running. That includes a stream that cannot be opened at all: the adapter stays in
//! `Rotating`, drops incoming frames, and retries the open every `ROTATION_RETRY`.

use crate::config::SpeechConfig;
use crate::room::AudioFrameStream;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Provider code for "maximum stream duration reached".
pub const DURATION_LIMIT_CODE: i32 = 11;

/// Delay before retrying an open that failed.
const ROTATION_RETRY: Duration = Duration::from_secs(1);

/// Audio format and options for one streaming request.
///
/// Audio is always 16-bit linear PCM, mono.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    pub sample_rate: u32,
    pub language_code: String,
    pub model: String,
    pub interim_results: bool,
    pub automatic_punctuation: bool,
}

impl From<&SpeechConfig> for RecognitionConfig {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            language_code: config.language_code.clone(),
            model: config.model.clone(),
            interim_results: config.interim_results,
            automatic_punctuation: config.automatic_punctuation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionError {
    pub code: Option<i32>,
    pub message: String,
}

impl RecognitionError {
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_duration_limit(&self) -> bool {
        self.code == Some(DURATION_LIMIT_CODE)
    }
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "recognition error {}: {}", code, self.message),
            None => write!(f, "recognition error: {}", self.message),
        }
    }
}

impl std::error::Error for RecognitionError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// One open provider stream.
///
/// Dropping `audio` ends the request; dropping `results` detaches its listeners.
pub struct ProviderStream {
    pub audio: mpsc::Sender<Vec<u8>>,
    pub results: mpsc::Receiver<Result<Transcript, RecognitionError>>,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a new streaming request. Returns once the provider has accepted it.
    async fn open_stream(&self, config: &RecognitionConfig) -> Result<ProviderStream, RecognitionError>;
}

/// Receives what the adapter hears.
pub trait TranscriptHandler: Send + Sync + 'static {
    fn on_partial(&self, _text: &str) {}

    /// One complete candidate utterance.
    fn on_final(&self, text: String);

    fn on_error(&self, error: RecognitionError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Streaming,
    Rotating,
    Ended,
}

/// Handle to a running adapter.
pub struct RecognitionAdapter {
    participant: String,
    shutdown: watch::Sender<bool>,
    state: Arc<Mutex<AdapterState>>,
    task: JoinHandle<()>,
}

impl RecognitionAdapter {
    /// Start transcribing `frames` until the track ends or `end()` is called.
    pub fn spawn(
        participant: impl Into<String>,
        recognizer: Arc<dyn SpeechRecognizer>,
        config: RecognitionConfig,
        rotation_interval: Duration,
        frames: AudioFrameStream,
        handler: Arc<dyn TranscriptHandler>,
    ) -> Self {
        let participant = participant.into();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(AdapterState::Streaming));

        let worker = Worker {
            participant: participant.clone(),
            recognizer,
            config,
            rotation_interval,
            handler,
            state: Arc::clone(&state),
            stream_seq: 0,
            deadline: Instant::now() + rotation_interval,
            results_open: true,
            dropped_frames: 0,
        };
        let task = tokio::spawn(worker.run(frames, shutdown_rx));

        Self {
            participant,
            shutdown,
            state,
            task,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Stop the timer and close whichever stream is active. Idempotent.
    pub fn end(&self) {
        self.shutdown.send_replace(true);
    }

    /// End the adapter and wait until its stream has been released.
    pub async fn shutdown(self) {
        self.end();
        if let Err(err) = self.task.await {
            warn!(participant = %self.participant, error = %err, "Recognition task failed");
        }
    }
}

struct Worker {
    participant: String,
    recognizer: Arc<dyn SpeechRecognizer>,
    config: RecognitionConfig,
    rotation_interval: Duration,
    handler: Arc<dyn TranscriptHandler>,
    state: Arc<Mutex<AdapterState>>,
    stream_seq: u64,
    deadline: Instant,
    results_open: bool,
    /// Frames discarded while no stream was open.
    dropped_frames: u64,
}

/// Next result of the active stream; never resolves while there is none.
async fn next_result(active: &mut Option<ProviderStream>) -> Option<Result<Transcript, RecognitionError>> {
    match active {
        Some(stream) => stream.results.recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
    }

    async fn open(&mut self) -> Result<ProviderStream, RecognitionError> {
        let stream = self.recognizer.open_stream(&self.config).await?;
        self.stream_seq += 1;
        self.deadline = Instant::now() + self.rotation_interval;
        self.results_open = true;
        debug!(participant = %self.participant, stream = self.stream_seq, "Recognition stream opened");
        Ok(stream)
    }

    /// Replace `active` with a freshly opened stream, or fill it if there is none. The
    /// old stream is released only after the new one is open.
    async fn rotate(&mut self, active: &mut Option<ProviderStream>, reason: &'static str) -> bool {
        self.set_state(AdapterState::Rotating);
        let rotated = match self.open().await {
            Ok(next) => {
                if let Some(previous) = active.replace(next) {
                    drop(previous);
                    debug!(participant = %self.participant, stream = self.stream_seq, reason, "Recognition stream rotated");
                } else {
                    info!(
                        participant = %self.participant,
                        stream = self.stream_seq,
                        dropped_frames = self.dropped_frames,
                        "Recognition stream recovered"
                    );
                    self.dropped_frames = 0;
                }
                true
            }
            Err(err) => {
                warn!(participant = %self.participant, reason, error = %err, "Could not open replacement recognition stream");
                self.deadline = Instant::now() + ROTATION_RETRY;
                false
            }
        };
        if active.is_some() {
            self.set_state(AdapterState::Streaming);
        }
        rotated
    }

    async fn write(&mut self, active: &mut Option<ProviderStream>, bytes: Vec<u8>) {
        let Some(stream) = active.as_mut() else {
            self.dropped_frames += 1;
            return;
        };
        let Err(mpsc::error::SendError(bytes)) = stream.audio.send(bytes).await else {
            return;
        };
        if !self.rotate(active, "write failed").await {
            // The stream refused input, so it is finished either way.
            *active = None;
            self.set_state(AdapterState::Rotating);
            self.dropped_frames += 1;
            warn!(participant = %self.participant, "Dropped audio frame, no recognition stream is open");
            return;
        }
        if let Some(stream) = active.as_mut() {
            if stream.audio.send(bytes).await.is_err() {
                warn!(participant = %self.participant, "Dropped audio frame after rotation");
            }
        }
    }

    fn deliver(&self, transcript: Transcript) {
        if transcript.text.trim().is_empty() {
            return;
        }
        if transcript.is_final {
            info!(participant = %self.participant, text = %transcript.text, "Final transcript");
            self.handler.on_final(transcript.text);
        } else {
            self.handler.on_partial(&transcript.text);
        }
    }

    async fn run(mut self, mut frames: AudioFrameStream, mut shutdown: watch::Receiver<bool>) {
        let mut active = match self.open().await {
            Ok(stream) => {
                info!(participant = %self.participant, "Recognition started");
                Some(stream)
            }
            Err(err) => {
                warn!(participant = %self.participant, error = %err, "Could not open recognition stream, will retry");
                self.handler.on_error(err);
                self.deadline = Instant::now() + ROTATION_RETRY;
                self.set_state(AdapterState::Rotating);
                None
            }
        };

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                result = next_result(&mut active), if self.results_open => match result {
                    Some(Ok(transcript)) => self.deliver(transcript),
                    Some(Err(err)) if err.is_duration_limit() => {
                        self.rotate(&mut active, "duration limit").await;
                    }
                    Some(Err(err)) => {
                        warn!(participant = %self.participant, error = %err, "Recognition provider error");
                        self.handler.on_error(err);
                    }
                    None => {
                        debug!(participant = %self.participant, stream = self.stream_seq, "Recognition results closed");
                        self.results_open = false;
                    }
                },

                _ = tokio::time::sleep_until(self.deadline) => {
                    let reason = if active.is_some() { "scheduled" } else { "retry" };
                    self.rotate(&mut active, reason).await;
                }

                frame = frames.next() => match frame {
                    Some(frame) => self.write(&mut active, frame.to_le_bytes()).await,
                    None => {
                        debug!(participant = %self.participant, "Audio track ended");
                        break;
                    }
                },
            }
        }

        drop(active);
        self.set_state(AdapterState::Ended);
        info!(
            participant = %self.participant,
            streams = self.stream_seq,
            dropped_frames = self.dropped_frames,
            "Recognition ended"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::room::AudioFrame;
    use std::collections::{HashMap, HashSet};
    use tokio_stream::wrappers::ReceiverStream;

    type ResultSender = mpsc::Sender<Result<Transcript, RecognitionError>>;

    /// Recognizer whose streams are inspected and driven by the test.
    #[derive(Default, Clone)]
    pub(crate) struct FakeRecognizer {
        pub log: Arc<Mutex<Vec<String>>>,
        pub results: Arc<Mutex<Vec<ResultSender>>>,
        pub received: Arc<Mutex<HashMap<usize, Vec<Vec<u8>>>>>,
        pub reject_input: Arc<Mutex<HashSet<usize>>>,
        /// Open attempts (1-based, counting failures) that are refused.
        pub refuse_attempts: Arc<Mutex<HashSet<usize>>>,
        attempts: Arc<Mutex<usize>>,
    }

    impl FakeRecognizer {
        pub(crate) fn opened(&self) -> usize {
            self.results.lock().len()
        }

        pub(crate) fn sender(&self, stream: usize) -> ResultSender {
            self.results.lock()[stream - 1].clone()
        }

        fn position(&self, entry: &str) -> Option<usize> {
            self.log.lock().iter().position(|e| e == entry)
        }
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn open_stream(&self, _config: &RecognitionConfig) -> Result<ProviderStream, RecognitionError> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                *attempts += 1;
                *attempts
            };
            if self.refuse_attempts.lock().contains(&attempt) {
                return Err(RecognitionError::new(Some(14), "service unavailable"));
            }

            let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(16);
            let (results_tx, results_rx) = mpsc::channel(16);

            let n = {
                let mut results = self.results.lock();
                results.push(results_tx);
                results.len()
            };
            self.log.lock().push(format!("open {}", n));

            if self.reject_input.lock().contains(&n) {
                drop(audio_rx);
            } else {
                let log = Arc::clone(&self.log);
                let received = Arc::clone(&self.received);
                tokio::spawn(async move {
                    while let Some(bytes) = audio_rx.recv().await {
                        received.lock().entry(n).or_default().push(bytes);
                    }
                    log.lock().push(format!("end {}", n));
                });
            }

            Ok(ProviderStream {
                audio: audio_tx,
                results: results_rx,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub partials: Mutex<Vec<String>>,
        pub finals: Mutex<Vec<String>>,
        pub errors: Mutex<Vec<RecognitionError>>,
    }

    impl TranscriptHandler for RecordingHandler {
        fn on_partial(&self, text: &str) {
            self.partials.lock().push(text.to_string());
        }

        fn on_final(&self, text: String) {
            self.finals.lock().push(text);
        }

        fn on_error(&self, error: RecognitionError) {
            self.errors.lock().push(error);
        }
    }

    fn config() -> RecognitionConfig {
        RecognitionConfig::from(&crate::config::AppConfig::default().speech)
    }

    fn start(
        recognizer: &FakeRecognizer,
        handler: &Arc<RecordingHandler>,
        interval: Duration,
    ) -> (RecognitionAdapter, mpsc::Sender<AudioFrame>) {
        let (frames_tx, frames_rx) = mpsc::channel(16);
        let adapter = RecognitionAdapter::spawn(
            "candidate",
            Arc::new(recognizer.clone()),
            config(),
            interval,
            ReceiverStream::new(frames_rx).boxed(),
            handler.clone(),
        );
        (adapter, frames_tx)
    }

    fn final_text(text: &str) -> Result<Transcript, RecognitionError> {
        Ok(Transcript {
            text: text.to_string(),
            is_final: true,
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_stream_opens_before_old_ends() {
        let recognizer = FakeRecognizer::default();
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, _frames) = start(&recognizer, &handler, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(recognizer.opened(), 4);

        for n in 2..=4 {
            let opened = recognizer.position(&format!("open {}", n)).unwrap();
            let ended = recognizer.position(&format!("end {}", n - 1)).unwrap();
            assert!(opened < ended, "stream {} must open before stream {} ends", n, n - 1);
        }

        adapter.shutdown().await;
        settle().await;
        assert!(recognizer.position("end 4").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotated_stream_cannot_emit_duplicate_final() {
        let recognizer = FakeRecognizer::default();
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, _frames) = start(&recognizer, &handler, Duration::from_millis(100));
        settle().await;

        let first = recognizer.sender(1);
        first.send(final_text("I would sort first.")).await.unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(recognizer.opened(), 2);
        assert!(first.send(final_text("I would sort first.")).await.is_err());

        recognizer.sender(2).send(final_text("Then scan.")).await.unwrap();
        settle().await;

        assert_eq!(*handler.finals.lock(), vec!["I would sort first.", "Then scan."]);
        adapter.end();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_limit_rotates_silently() {
        let recognizer = FakeRecognizer::default();
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, _frames) = start(&recognizer, &handler, Duration::from_secs(240));
        settle().await;

        recognizer
            .sender(1)
            .send(Err(RecognitionError::new(Some(DURATION_LIMIT_CODE), "Exceeded maximum allowed stream duration")))
            .await
            .unwrap();
        settle().await;

        assert_eq!(recognizer.opened(), 2);
        assert!(handler.errors.lock().is_empty());

        recognizer
            .sender(2)
            .send(Err(RecognitionError::new(Some(3), "bad audio")))
            .await
            .unwrap();
        settle().await;

        assert_eq!(recognizer.opened(), 2);
        assert_eq!(handler.errors.lock().len(), 1);
        assert_eq!(adapter.state(), AdapterState::Streaming);
        adapter.end();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_rotates_without_losing_frame() {
        let recognizer = FakeRecognizer::default();
        recognizer.reject_input.lock().insert(1);
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, frames) = start(&recognizer, &handler, Duration::from_secs(240));
        settle().await;

        let frame = AudioFrame::new(vec![1, -1, 300], 16000, 1);
        frames.send(frame.clone()).await.unwrap();
        settle().await;

        assert_eq!(recognizer.opened(), 2);
        let received = recognizer.received.lock();
        assert_eq!(received.get(&2), Some(&vec![frame.to_le_bytes()]));
        drop(received);
        adapter.end();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_open_is_retried() {
        let recognizer = FakeRecognizer::default();
        recognizer.refuse_attempts.lock().insert(1);
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, frames) = start(&recognizer, &handler, Duration::from_secs(240));
        settle().await;

        assert_eq!(recognizer.opened(), 0);
        assert_eq!(handler.errors.lock()[0].code, Some(14));
        assert_eq!(adapter.state(), AdapterState::Rotating);

        // Heard while no stream is open.
        frames.send(AudioFrame::new(vec![9, 9], 16000, 1)).await.unwrap();
        tokio::time::sleep(ROTATION_RETRY).await;
        assert_eq!(recognizer.opened(), 1);
        assert_eq!(adapter.state(), AdapterState::Streaming);

        let frame = AudioFrame::new(vec![1, 2, 3], 16000, 1);
        frames.send(frame.clone()).await.unwrap();
        recognizer.sender(1).send(final_text("Use a hash map.")).await.unwrap();
        settle().await;

        assert_eq!(recognizer.received.lock().get(&1), Some(&vec![frame.to_le_bytes()]));
        assert_eq!(*handler.finals.lock(), vec!["Use a hash map."]);
        assert_eq!(handler.errors.lock().len(), 1);
        adapter.end();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_rotation_drops_frame_and_retries() {
        let recognizer = FakeRecognizer::default();
        recognizer.reject_input.lock().insert(1);
        recognizer.refuse_attempts.lock().insert(2);
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, frames) = start(&recognizer, &handler, Duration::from_secs(240));
        settle().await;

        frames.send(AudioFrame::new(vec![4, 4], 16000, 1)).await.unwrap();
        settle().await;
        assert_eq!(recognizer.opened(), 1);
        assert_eq!(adapter.state(), AdapterState::Rotating);

        tokio::time::sleep(ROTATION_RETRY).await;
        assert_eq!(recognizer.opened(), 2);
        assert_eq!(adapter.state(), AdapterState::Streaming);

        let frame = AudioFrame::new(vec![7, 8], 16000, 1);
        frames.send(frame.clone()).await.unwrap();
        settle().await;
        assert_eq!(recognizer.received.lock().get(&2), Some(&vec![frame.to_le_bytes()]));
        adapter.end();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_is_idempotent_and_track_end_stops() {
        let recognizer = FakeRecognizer::default();
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, frames) = start(&recognizer, &handler, Duration::from_secs(240));
        settle().await;

        drop(frames);
        settle().await;
        assert_eq!(adapter.state(), AdapterState::Ended);

        adapter.end();
        adapter.end();
        adapter.shutdown().await;
        assert_eq!(recognizer.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partials_and_blank_results() {
        let recognizer = FakeRecognizer::default();
        let handler = Arc::new(RecordingHandler::default());
        let (adapter, _frames) = start(&recognizer, &handler, Duration::from_secs(240));
        settle().await;

        let results = recognizer.sender(1);
        results
            .send(Ok(Transcript { text: "I think".to_string(), is_final: false }))
            .await
            .unwrap();
        results.send(final_text("  ")).await.unwrap();
        settle().await;

        assert_eq!(*handler.partials.lock(), vec!["I think"]);
        assert!(handler.finals.lock().is_empty());
        adapter.end();
    }
}
