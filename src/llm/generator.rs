//! # Response Generation
//!
//! Produces the interviewer's reply as a lazy, finite stream of text fragments.
//!
//! ## Failure Behavior:
//! The stream never carries errors. Missing problem context yields one fixed apology;
//! a provider failure (before or during streaming) yields one fallback sentence and
//! ends the stream.

use crate::llm::prompt::build_request;
use crate::llm::{ChatMessage, ChatRequest, LanguageModel, TextStream};
use crate::problem::ProblemContext;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tracing::warn;

pub const MISSING_CONTEXT_REPLY: &str =
    "I'm ready to start, but I couldn't load the problem details.";
pub const PROVIDER_FAILURE_REPLY: &str = "I'm having trouble connecting to my brain right now.";

enum GenerationState {
    Pending(ChatRequest),
    Streaming(TextStream),
    Done,
}

pub struct ResponseGenerator {
    model: Arc<dyn LanguageModel>,
}

impl ResponseGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Start a reply for the given conversation state.
    ///
    /// Nothing is sent to the provider until the returned stream is polled.
    pub fn generate(
        &self,
        history: &[ChatMessage],
        latest_code: &str,
        context: Option<&ProblemContext>,
    ) -> BoxStream<'static, String> {
        let Some(context) = context else {
            return stream::iter([MISSING_CONTEXT_REPLY.to_string()]).boxed();
        };

        let request = build_request(history, latest_code, context);
        let model = Arc::clone(&self.model);

        stream::unfold(GenerationState::Pending(request), move |state| {
            let model = Arc::clone(&model);
            async move {
                let mut state = state;
                loop {
                    match state {
                        GenerationState::Pending(request) => {
                            match model.stream_chat(request).await {
                                Ok(fragments) => state = GenerationState::Streaming(fragments),
                                Err(err) => {
                                    warn!(error = %err, "Reply generation failed to start");
                                    return Some((PROVIDER_FAILURE_REPLY.to_string(), GenerationState::Done));
                                }
                            }
                        }
                        GenerationState::Streaming(mut fragments) => match fragments.next().await {
                            Some(Ok(text)) if text.is_empty() => {
                                state = GenerationState::Streaming(fragments);
                            }
                            Some(Ok(text)) => {
                                return Some((text, GenerationState::Streaming(fragments)));
                            }
                            Some(Err(err)) => {
                                warn!(error = %err, "Reply generation failed mid-stream");
                                return Some((PROVIDER_FAILURE_REPLY.to_string(), GenerationState::Done));
                            }
                            None => return None,
                        },
                        GenerationState::Done => return None,
                    }
                }
            }
        })
        .boxed()
    }
}
