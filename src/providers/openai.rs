//! OpenAI-backed cascade stage providers.
//!
//! - Speech-to-text: `POST /v1/audio/transcriptions` (Whisper, batch)
//! - Language model: `POST /v1/chat/completions` with SSE streaming
//! - Text-to-speech: `POST /v1/audio/speech` with raw PCM streaming
//!
//! All three share one `reqwest` client and surface failures as
//! [`ProviderError`] with HTTP status mapped onto the taxonomy.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    AudioStream, ChatTurn, LanguageModel, ProviderError, SecretString, SpeechToText, TextToSpeech,
    TokenStream, Transcription,
};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

const DEFAULT_STT_MODEL: &str = "whisper-1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TTS_MODEL: &str = "gpt-4o-mini-tts";
const DEFAULT_TTS_VOICE: &str = "alloy";

/// Sample rate of the PCM produced by the TTS endpoint.
const OPENAI_TTS_SAMPLE_RATE: u32 = 24_000;

/// Client-side capture format fed into transcription.
const INPUT_SAMPLE_RATE: u32 = 16_000;

fn status_error(status: reqwest::StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(body),
        429 => ProviderError::Quota(body),
        _ => ProviderError::Request(format!("status {status}: {body}")),
    }
}

async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(status, body)
}

/// Wrap a raw PCM16 mono utterance in a WAV container for upload.
fn pcm_to_wav(audio: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: INPUT_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(audio.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ProviderError::Request(format!("wav header: {e}")))?;
        for sample in audio.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            writer
                .write_sample(value)
                .map_err(|e| ProviderError::Request(format!("wav body: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ProviderError::Request(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

// =============================================================================
// Speech-to-Text
// =============================================================================

/// Whisper batch transcription.
pub struct OpenAiStt {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl OpenAiStt {
    pub fn new(http: reqwest::Client, api_key: SecretString, model: Option<String>) -> Self {
        Self {
            http,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_STT_MODEL.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    async fn transcribe(&self, audio: Bytes) -> Result<Transcription, ProviderError> {
        let wav = pcm_to_wav(&audio)?;
        debug!(bytes = wav.len(), model = %self.model, "submitting utterance for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .http
            .post(format!("{OPENAI_API_BASE}/audio/transcriptions"))
            .bearer_auth(self.api_key.expose())
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(Transcription {
            text: body.text,
            confidence: None,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// =============================================================================
// Language Model
// =============================================================================

/// Streaming chat completion.
pub struct OpenAiLlm {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl OpenAiLlm {
    pub fn new(http: reqwest::Client, api_key: SecretString, model: Option<String>) -> Self {
        Self {
            http,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    delta: ChatDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the token from one SSE `data:` payload. `None` for `[DONE]` and
/// contentless chunks (role preludes, finish markers).
fn parse_sse_data(data: &str) -> Option<String> {
    if data.trim() == "[DONE]" {
        return None;
    }
    let chunk: ChatChunk = serde_json::from_str(data).ok()?;
    chunk.choices.into_iter().next()?.delta.content
}

#[async_trait]
impl LanguageModel for OpenAiLlm {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<TokenStream, ProviderError> {
        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        for turn in history {
            messages.push(json!({"role": turn.role.as_str(), "content": turn.content}));
        }

        let response = self
            .http
            .post(format!("{OPENAI_API_BASE}/chat/completions"))
            .bearer_auth(self.api_key.expose())
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut body = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::Connection(e.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data:")
                        && let Some(token) = parse_sse_data(data)
                    {
                        yield Ok(token);
                    }
                }
            }
        }))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// =============================================================================
// Text-to-Speech
// =============================================================================

/// Streaming PCM synthesis.
pub struct OpenAiTts {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
    voice: String,
}

impl OpenAiTts {
    pub fn new(http: reqwest::Client, api_key: SecretString, voice: Option<String>) -> Self {
        Self {
            http,
            api_key,
            model: DEFAULT_TTS_MODEL.to_string(),
            voice: voice.unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string()),
        }
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        let response = self
            .http
            .post(format!("{OPENAI_API_BASE}/audio/speech"))
            .bearer_auth(self.api_key.expose())
            .json(&json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "pcm",
            }))
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut body = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => {
                        yield Err(ProviderError::Connection(e.to_string()));
                        return;
                    }
                }
            }
        }))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn sample_rate(&self) -> u32 {
        OPENAI_TTS_SAMPLE_RATE
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_header() {
        let pcm = crate::providers::simulated::tone_pcm16(10);
        let wav = pcm_to_wav(&pcm).expect("wav");
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > pcm.len());
    }

    #[test]
    fn test_parse_sse_data() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_data(data), Some("Hel".to_string()));

        // role prelude carries no content
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_data(data), None);

        assert_eq!(parse_sse_data(" [DONE]"), None);
        assert_eq!(parse_sse_data("not json"), None);
    }

    #[test]
    fn test_status_mapping() {
        let auth = status_error(reqwest::StatusCode::UNAUTHORIZED, "bad key".to_string());
        assert!(matches!(auth, ProviderError::Auth(_)));

        let quota = status_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down".to_string(),
        );
        assert!(matches!(quota, ProviderError::Quota(_)));

        let server = status_error(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "oops".to_string(),
        );
        assert!(matches!(server, ProviderError::Request(_)));
    }
}
