use crate::api::{SpeechBackend, SynthesizedAudio};
use crate::error::{PipelineError, StageResult};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

const API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const MODEL_ID: &str = "eleven_multilingual_v2";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// ElevenLabs TTS client. Uses the with-timestamps endpoint so each segment
/// comes back with an authoritative duration.
pub struct ElevenLabsClient {
    client: Client,
    api_key: String,
}

impl ElevenLabsClient {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TimestampedSpeech {
    audio_base64: String,
    alignment: Option<CharAlignment>,
}

#[derive(Debug, Deserialize)]
struct CharAlignment {
    character_end_times_seconds: Vec<f64>,
}

#[async_trait]
impl SpeechBackend for ElevenLabsClient {
    async fn synthesize(&self, sentence: &str, voice: &str) -> StageResult<SynthesizedAudio> {
        let url = format!("{API_BASE}/{voice}/with-timestamps?output_format=mp3_44100_128");

        let body = serde_json::json!({
            "text": sentence,
            "model_id": MODEL_ID,
        });

        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(PipelineError::VoiceNotFound(voice.to_string()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::AuthFailure(format!(
                "ElevenLabs HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            if raw.contains("voice_not_found") {
                return Err(PipelineError::VoiceNotFound(voice.to_string()));
            }
            if !raw.is_empty() {
                let snippet = raw.chars().take(300).collect::<String>();
                warn!("ElevenLabs raw body: {}", snippet);
            }
            return Err(PipelineError::UpstreamUnavailable(format!(
                "ElevenLabs HTTP {}",
                status.as_u16()
            )));
        }

        let speech: TimestampedSpeech = resp.json().await?;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(&speech.audio_base64)
            .map_err(|e| PipelineError::MalformedResponse(format!("bad audio payload: {e}")))?;

        let duration = speech
            .alignment
            .as_ref()
            .and_then(|a| a.character_end_times_seconds.last().copied())
            .unwrap_or(0.0);
        if duration <= 0.0 {
            return Err(PipelineError::MalformedResponse(
                "ElevenLabs response carried no usable duration".into(),
            ));
        }

        Ok(SynthesizedAudio { audio, duration })
    }
}
