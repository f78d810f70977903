//! # Speech Synthesis
//!
//! One sentence in, a lazy stream of raw 16 kHz mono 16-bit PCM chunks out. Nothing is
//! sent to the provider until the stream is first polled, and any failure (request,
//! status, or mid-body) arrives as an `Err` item on the stream.

use crate::config::SynthesisConfig;
use crate::error::ProviderError;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::debug;

pub type AudioChunkStream = BoxStream<'static, Result<Vec<u8>, ProviderError>>;

pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize(&self, sentence: &str) -> AudioChunkStream;
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

/// ElevenLabs streaming text-to-speech.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: SynthesisConfig,
}

impl ElevenLabsSynthesizer {
    pub fn new(client: reqwest::Client, config: SynthesisConfig) -> Self {
        Self { client, config }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.voice_id,
            self.config.output_format
        )
    }
}

impl SpeechSynthesizer for ElevenLabsSynthesizer {
    fn synthesize(&self, sentence: &str) -> AudioChunkStream {
        let request = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", &self.config.api_key)
            .json(&SynthesisRequest {
                text: sentence,
                model_id: &self.config.model_id,
            });
        let chars = sentence.chars().count();

        stream::once(async move {
            debug!(chars, "Requesting speech synthesis");
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ProviderError::from)))
        })
        .map(|opened| match opened {
            Ok(chunks) => chunks.boxed(),
            Err(err) => stream::iter(vec![Err(err)]).boxed(),
        })
        .flatten()
        .boxed()
    }
}
