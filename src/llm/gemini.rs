//! Streaming chat against the Gemini `streamGenerateContent` endpoint (server-sent events).

use crate::config::LlmConfig;
use crate::error::ProviderError;
use crate::llm::{ChatMessage, ChatRequest, LanguageModel, Role, TextStream};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

impl Content {
    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part { text: text.into() }],
        }
    }
}

fn provider_role(role: Role) -> &'static str {
    match role {
        Role::Candidate => "user",
        Role::Interviewer => "model",
    }
}

fn to_contents(history: &[ChatMessage], message: &str) -> Vec<Content> {
    history
        .iter()
        .map(|turn| Content::text(provider_role(turn.role), turn.text.clone()))
        .chain(std::iter::once(Content::text("user", message)))
        .collect()
}

/// Extract the text of one SSE `data:` payload.
fn parse_chunk(data: &str) -> Result<Option<String>, ProviderError> {
    let chunk: GenerateChunk =
        serde_json::from_str(data).map_err(|e| ProviderError::Protocol(e.to_string()))?;
    let text: String = chunk
        .candidates
        .into_iter()
        .flat_map(|c| c.content.parts)
        .map(|p| p.text)
        .collect();
    Ok((!text.is_empty()).then_some(text))
}

/// Incremental server-sent-events decoder returning `data:` payloads.
///
/// Bytes are buffered until a full line is available, so multi-byte characters split
/// across network chunks survive.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: String,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(std::mem::take(&mut self.data));
                }
            } else if let Some(payload) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(payload.trim_start());
            }
        }
        events
    }

    /// Drain whatever the body ended with, terminated or not.
    fn finish(&mut self) -> Vec<String> {
        let mut rest = std::mem::take(&mut self.buffer);
        rest.push(b'\n');
        let mut events = self.push(&rest);
        if !self.data.is_empty() {
            events.push(std::mem::take(&mut self.data));
        }
        events
    }
}

pub struct GeminiModel {
    client: reqwest::Client,
    config: LlmConfig,
}

impl GeminiModel {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn request_body(&self, request: &ChatRequest) -> GenerateRequest {
        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: request.system_instruction.clone(),
                }],
            },
            contents: to_contents(&request.history, &request.message),
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TextStream, ProviderError> {
        debug!(model = %self.config.model, turns = request.history.len(), "Starting reply stream");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&self.request_body(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut decoder = SseDecoder::default();
        let body = response
            .bytes_stream()
            .map(Some)
            .chain(stream::once(async { None }))
            .map(move |chunk| -> Vec<Result<String, ProviderError>> {
                let payloads = match chunk {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(err)) => return vec![Err(err.into())],
                    None => decoder.finish(),
                };
                payloads
                    .iter()
                    .filter_map(|data| parse_chunk(data).transpose())
                    .collect()
            })
            .flat_map(stream::iter);

        Ok(body.boxed())
    }
}
