use crate::api::{AlignmentBackend, WordStamp};
use crate::error::{PipelineError, StageResult};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const MODEL: &str = "whisper-1";
const REQUEST_TIMEOUT_SECS: u64 = 600;

/// Word-level alignment via the OpenAI transcription endpoint.
pub struct WhisperClient {
    client: Client,
    api_key: String,
}

impl WhisperClient {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    words: Vec<TranscribedWord>,
}

#[derive(Debug, Deserialize)]
struct TranscribedWord {
    word: String,
    start: f64,
    end: f64,
}

#[async_trait]
impl AlignmentBackend for WhisperClient {
    async fn align(&self, audio: &Path) -> StageResult<Vec<WordStamp>> {
        let bytes = fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "narration.mp3".to_string());

        let form = multipart::Form::new()
            .part(
                "file",
                multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("audio/mpeg")
                    .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?,
            )
            .text("model", MODEL)
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");

        let resp = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::AuthFailure(format!(
                "transcription HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "transcription HTTP {}",
                status.as_u16()
            )));
        }

        let body: TranscriptionResponse = resp.json().await?;
        if body.words.is_empty() {
            return Err(PipelineError::MalformedResponse(
                "transcription carried no word timestamps".into(),
            ));
        }

        Ok(body
            .words
            .into_iter()
            .map(|w| WordStamp {
                word: w.word,
                start: w.start,
                end: w.end,
            })
            .collect())
    }
}
