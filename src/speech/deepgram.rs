//! Deepgram live transcription over a websocket.
//!
//! Each `open_stream` call is one websocket. Binary frames carry raw PCM; the server
//! answers with JSON `Results` messages. The server's idle/expiry close (`NET-0001`)
//! is reported with the maximum-duration code so the adapter rotates silently.

use crate::config::SpeechConfig;
use crate::speech::recognition::{
    ProviderStream, RecognitionConfig, RecognitionError, SpeechRecognizer, Transcript,
    DURATION_LIMIT_CODE,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;
const EXPIRY_CLOSE_REASON: &str = "NET-0001";

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

fn parse_message(text: &str) -> Result<Option<Transcript>, RecognitionError> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| RecognitionError::new(None, format!("unreadable provider message: {}", e)))?;
    if message.kind != "Results" {
        return Ok(None);
    }
    let transcript = message
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
        .unwrap_or_default();
    if transcript.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Transcript {
        text: transcript,
        is_final: message.is_final,
    }))
}

/// Map a server close frame to the error the adapter should see, if any.
fn close_error(frame: Option<&CloseFrame<'_>>) -> Option<RecognitionError> {
    let frame = frame?;
    if frame.reason.contains(EXPIRY_CLOSE_REASON) {
        return Some(RecognitionError::new(Some(DURATION_LIMIT_CODE), frame.reason.to_string()));
    }
    if frame.code == CloseCode::Normal {
        return None;
    }
    Some(RecognitionError::new(
        Some(i32::from(u16::from(frame.code))),
        frame.reason.to_string(),
    ))
}

pub struct DeepgramRecognizer {
    config: SpeechConfig,
}

impl DeepgramRecognizer {
    pub fn new(config: SpeechConfig) -> Self {
        Self { config }
    }

    fn listen_url(&self, options: &RecognitionConfig) -> Result<reqwest::Url, RecognitionError> {
        let mut url = reqwest::Url::parse(&self.config.endpoint)
            .map_err(|e| RecognitionError::new(None, format!("invalid recognizer endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &options.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair("model", &options.model)
            .append_pair("language", &options.language_code)
            .append_pair("punctuate", &options.automatic_punctuation.to_string())
            .append_pair("interim_results", &options.interim_results.to_string());
        Ok(url)
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    async fn open_stream(&self, options: &RecognitionConfig) -> Result<ProviderStream, RecognitionError> {
        let url = self.listen_url(options)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RecognitionError::new(None, e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| RecognitionError::new(None, e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RecognitionError::new(None, format!("recognizer connection failed: {}", e)))?;
        let (mut sink, mut source) = ws.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (results_tx, results_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(bytes) = audio_rx.recv().await {
                if let Err(err) = sink.send(Message::Binary(bytes)).await {
                    debug!(error = %err, "Recognizer socket rejected audio");
                    return;
                }
            }
            // Input ended: ask the server to flush and close.
            let _ = sink.send(Message::Text(CLOSE_STREAM.to_string())).await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let forwarded = match message {
                    Ok(Message::Text(text)) => match parse_message(&text) {
                        Ok(Some(transcript)) => results_tx.send(Ok(transcript)).await,
                        Ok(None) => Ok(()),
                        Err(err) => results_tx.send(Err(err)).await,
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(err) = close_error(frame.as_ref()) {
                            let _ = results_tx.send(Err(err)).await;
                        }
                        break;
                    }
                    Ok(_) => Ok(()),
                    Err(err) => {
                        warn!(error = %err, "Recognizer socket failed");
                        let _ = results_tx.send(Err(RecognitionError::new(None, err.to_string()))).await;
                        break;
                    }
                };
                // The adapter dropped this stream's results; stop listening.
                if forwarded.is_err() {
                    break;
                }
            }
        });

        Ok(ProviderStream {
            audio: audio_tx,
            results: results_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::borrow::Cow;

    #[test]
    fn test_parse_results() {
        let text = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"use a heap","confidence":0.9}]}}"#;
        assert_eq!(
            parse_message(text).unwrap(),
            Some(Transcript {
                text: "use a heap".to_string(),
                is_final: true
            })
        );

        let silence = r#"{"type":"Results","is_final":false,"channel":{"alternatives":[{"transcript":""}]}}"#;
        assert_eq!(parse_message(silence).unwrap(), None);

        let metadata = r#"{"type":"Metadata","request_id":"abc"}"#;
        assert_eq!(parse_message(metadata).unwrap(), None);
    }

    #[test]
    fn test_close_frames() {
        let expiry = CloseFrame {
            code: CloseCode::Error,
            reason: Cow::Borrowed("NET-0001: no audio received"),
        };
        assert!(close_error(Some(&expiry)).unwrap().is_duration_limit());

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        assert!(close_error(Some(&normal)).is_none());

        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed("DATA-0000"),
        };
        let err = close_error(Some(&policy)).unwrap();
        assert_eq!(err.code, Some(1008));
        assert!(!err.is_duration_limit());
    }

    #[test]
    fn test_listen_url_encodes_audio_format() {
        let speech = AppConfig::default().speech;
        let recognizer = DeepgramRecognizer::new(speech.clone());
        let url = recognizer.listen_url(&RecognitionConfig::from(&speech)).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("encoding=linear16"));
        assert!(query.contains("sample_rate=16000"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("language=en-US"));
    }
}
