//! # Interaction Pipeline
//!
//! One candidate utterance in, one spoken reply out:
//! generator → segmenter → synthesis → playback, all tagged with the same interaction id.
//!
//! Generation runs ahead in its own task so the next sentence is usually ready by the
//! time the current one has finished playing. Sentences are synthesized and played
//! strictly in the order they were segmented. Staleness is checked before each
//! sentence's synthesis and before every frame.

pub mod interaction;
pub mod playback;
pub mod segmenter;

use crate::llm::generator::ResponseGenerator;
use crate::llm::ChatMessage;
use crate::pipeline::interaction::InteractionId;
use crate::pipeline::playback::{PlaybackOutcome, PlaybackScheduler};
use crate::pipeline::segmenter::sentences;
use crate::problem::ProblemContext;
use crate::speech::synthesis::SpeechSynthesizer;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Conversation state captured when the interaction was minted.
#[derive(Debug, Clone)]
pub struct InteractionRequest {
    pub id: InteractionId,
    pub history: Vec<ChatMessage>,
    pub latest_code: String,
    pub context: Option<Arc<ProblemContext>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionOutcome {
    /// Every sentence was handled. `reply` is the full text the model produced.
    Completed { reply: String, sentences: usize },
    /// A newer interaction took over.
    Superseded,
}

/// Shared, stateless chain runner. The per-session parts live in the scheduler.
#[derive(Clone)]
pub struct InteractionPipeline {
    generator: Arc<ResponseGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl InteractionPipeline {
    pub fn new(generator: Arc<ResponseGenerator>, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            generator,
            synthesizer,
        }
    }

    pub async fn run(&self, request: InteractionRequest, playback: &PlaybackScheduler) -> InteractionOutcome {
        let id = request.id;
        let fragments = self.generator.generate(
            &request.history,
            &request.latest_code,
            request.context.as_deref(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let producer_playback = playback.clone();
        let producer = tokio::spawn(async move {
            let mut sentences = sentences(fragments);
            while let Some(sentence) = sentences.next().await {
                if !producer_playback.is_current(id) {
                    break;
                }
                if tx.send(sentence).is_err() {
                    break;
                }
            }
        });

        let mut reply: Vec<String> = Vec::new();
        let outcome = loop {
            let Some(sentence) = rx.recv().await else {
                if !playback.is_current(id) {
                    break InteractionOutcome::Superseded;
                }
                break InteractionOutcome::Completed {
                    sentences: reply.len(),
                    reply: reply.join(" "),
                };
            };

            if !playback.is_current(id) {
                break InteractionOutcome::Superseded;
            }

            debug!(interaction_id = id, sentence = %sentence, "Speaking sentence");
            let audio = self.synthesizer.synthesize(&sentence);
            reply.push(sentence);

            match playback.play(id, audio).await {
                PlaybackOutcome::Completed { .. } | PlaybackOutcome::Failed { .. } => {}
                PlaybackOutcome::Superseded { .. } => break InteractionOutcome::Superseded,
            }
        };

        producer.abort();
        match &outcome {
            InteractionOutcome::Completed { sentences, .. } => {
                info!(interaction_id = id, sentences, "Reply finished")
            }
            InteractionOutcome::Superseded => info!(interaction_id = id, "Reply abandoned for newer utterance"),
        }
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::ProviderError;
    use crate::llm::generator::tests::ScriptedModel;
    use crate::llm::generator::MISSING_CONTEXT_REPLY;
    use crate::llm::prompt::tests::two_sum;
    use crate::pipeline::interaction::InteractionClock;
    use crate::pipeline::playback::tests::RecordingOutput;
    use crate::room::AudioFrame;
    use crate::speech::synthesis::AudioChunkStream;
    use futures_util::stream;
    use parking_lot::Mutex;

    /// Synthesizer that renders the n-th requested sentence as two frames of sample `n`.
    pub(crate) struct ToneSynthesizer {
        pub requested: Mutex<Vec<String>>,
        pub fail_on: Option<String>,
        pub barge_in: Option<(String, InteractionClock)>,
    }

    impl ToneSynthesizer {
        pub(crate) fn new() -> Self {
            Self {
                requested: Mutex::new(Vec::new()),
                fail_on: None,
                barge_in: None,
            }
        }
    }

    impl SpeechSynthesizer for ToneSynthesizer {
        fn synthesize(&self, sentence: &str) -> AudioChunkStream {
            let index = {
                let mut requested = self.requested.lock();
                requested.push(sentence.to_string());
                requested.len() as i16
            };
            if let Some((trigger, clock)) = &self.barge_in {
                if trigger == sentence {
                    clock.mint();
                }
            }
            if self.fail_on.as_deref() == Some(sentence) {
                return stream::iter(vec![Err(ProviderError::Status {
                    status: 500,
                    body: "boom".to_string(),
                })])
                .boxed();
            }
            let frame = AudioFrame::new(vec![index; 480], 16000, 1).to_le_bytes();
            stream::iter(vec![Ok(frame.clone()), Ok(frame)]).boxed()
        }
    }

    fn setup(
        model: ScriptedModel,
        synthesizer: ToneSynthesizer,
    ) -> (InteractionPipeline, Arc<ToneSynthesizer>) {
        let synthesizer = Arc::new(synthesizer);
        let pipeline = InteractionPipeline::new(
            Arc::new(ResponseGenerator::new(Arc::new(model))),
            synthesizer.clone(),
        );
        (pipeline, synthesizer)
    }

    fn request(id: InteractionId, context: Option<ProblemContext>) -> InteractionRequest {
        InteractionRequest {
            id,
            history: vec![ChatMessage::candidate("I would sort first")],
            latest_code: String::new(),
            context: context.map(Arc::new),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentences_play_in_order() {
        let (pipeline, synthesizer) = setup(
            ScriptedModel::replying(&["Why sort? ", "What does it cost", "?"]),
            ToneSynthesizer::new(),
        );
        let output = Arc::new(RecordingOutput::default());
        let clock = InteractionClock::new();
        let id = clock.mint();
        let playback = PlaybackScheduler::new(output.clone(), clock, AppConfig::default().playback);

        let outcome = pipeline.run(request(id, Some(two_sum())), &playback).await;

        assert_eq!(
            outcome,
            InteractionOutcome::Completed {
                reply: "Why sort? What does it cost?".to_string(),
                sentences: 2
            }
        );
        assert_eq!(
            *synthesizer.requested.lock(),
            vec!["Why sort?".to_string(), "What does it cost?".to_string()]
        );
        let markers: Vec<i16> = output.frames.lock().iter().map(|f| f.samples[0]).collect();
        assert_eq!(markers, vec![1, 1, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sentence_is_skipped() {
        let mut synthesizer = ToneSynthesizer::new();
        synthesizer.fail_on = Some("First.".to_string());
        let (pipeline, _) = setup(ScriptedModel::replying(&["First. Second."]), synthesizer);
        let output = Arc::new(RecordingOutput::default());
        let clock = InteractionClock::new();
        let id = clock.mint();
        let playback = PlaybackScheduler::new(output.clone(), clock, AppConfig::default().playback);

        let outcome = pipeline.run(request(id, Some(two_sum())), &playback).await;

        assert!(matches!(outcome, InteractionOutcome::Completed { sentences: 2, .. }));
        let markers: Vec<i16> = output.frames.lock().iter().map(|f| f.samples[0]).collect();
        assert_eq!(markers, vec![2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_context_speaks_apology() {
        let (pipeline, synthesizer) = setup(ScriptedModel::replying(&["unused"]), ToneSynthesizer::new());
        let output = Arc::new(RecordingOutput::default());
        let clock = InteractionClock::new();
        let id = clock.mint();
        let playback = PlaybackScheduler::new(output, clock, AppConfig::default().playback);

        pipeline.run(request(id, None), &playback).await;
        assert_eq!(*synthesizer.requested.lock(), vec![MISSING_CONTEXT_REPLY.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_interaction_never_synthesizes() {
        let (pipeline, synthesizer) = setup(ScriptedModel::replying(&["Hello."]), ToneSynthesizer::new());
        let output = Arc::new(RecordingOutput::default());
        let clock = InteractionClock::new();
        let stale = clock.mint();
        clock.mint();
        let playback = PlaybackScheduler::new(output.clone(), clock, AppConfig::default().playback);

        let outcome = pipeline.run(request(stale, Some(two_sum())), &playback).await;

        assert_eq!(outcome, InteractionOutcome::Superseded);
        assert!(synthesizer.requested.lock().is_empty());
        assert!(output.frames.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_abandons_remaining_sentences() {
        let clock = InteractionClock::new();
        let mut synthesizer = ToneSynthesizer::new();
        synthesizer.barge_in = Some(("Second.".to_string(), clock.clone()));
        let (pipeline, synthesizer) =
            setup(ScriptedModel::replying(&["First. Second. Third."]), synthesizer);
        let output = Arc::new(RecordingOutput::default());
        let id = clock.mint();
        let playback = PlaybackScheduler::new(output.clone(), clock, AppConfig::default().playback);

        let outcome = pipeline.run(request(id, Some(two_sum())), &playback).await;

        assert_eq!(outcome, InteractionOutcome::Superseded);
        // The first sentence played in full; the second was cut before its first frame.
        let markers: Vec<i16> = output.frames.lock().iter().map(|f| f.samples[0]).collect();
        assert_eq!(markers, vec![1, 1]);
        assert!(!synthesizer.requested.lock().contains(&"Third.".to_string()));
    }
}
