//! # Language Model
//!
//! Chat types shared by the prompt builder, the response generator and the provider.

pub mod gemini;
pub mod generator;
pub mod prompt;

use crate::error::ProviderError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Who said a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Interviewer,
}

/// One turn of the interview. Never modified after it is appended to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn candidate(text: impl Into<String>) -> Self {
        Self {
            role: Role::Candidate,
            text: text.into(),
        }
    }

    pub fn interviewer(text: impl Into<String>) -> Self {
        Self {
            role: Role::Interviewer,
            text: text.into(),
        }
    }
}

/// A single provider call: prior turns plus the message that triggers the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system_instruction: String,
    pub history: Vec<ChatMessage>,
    pub message: String,
}

pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// A streaming chat model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TextStream, ProviderError>;
}
