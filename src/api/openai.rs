use crate::api::TextGenerator;
use crate::config::AiModel;
use crate::error::{PipelineError, StageResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::warn;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// OpenAI-compatible chat-completions client. The job request selects the
/// concrete model per call.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

fn extract_message_content(raw: &str) -> Option<String> {
    let root: serde_json::Value = serde_json::from_str(raw).ok()?;

    if let Some(err) = root.get("error") {
        if let Some(msg) = err.get("message").and_then(|v| v.as_str()) {
            warn!("OpenAI error message: {}", msg);
        }
        if let Some(typ) = err.get("type").and_then(|v| v.as_str()) {
            warn!("OpenAI error type: {}", typ);
        }
        return None;
    }

    root.get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn complete(&self, model: AiModel, prompt: &str) -> StageResult<String> {
        let body = json!({
            "model": model.model_name(),
            "messages": [
                {"role": "user", "content": prompt},
            ],
        });

        let resp = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::AuthFailure(format!(
                "OpenAI HTTP {}",
                status.as_u16()
            )));
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "OpenAI HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            if !raw.is_empty() {
                let snippet = raw.chars().take(400).collect::<String>();
                warn!("OpenAI raw body: {}", snippet);
            }
            return Err(PipelineError::MalformedResponse(format!(
                "OpenAI HTTP {}",
                status.as_u16()
            )));
        }

        extract_message_content(&raw).ok_or_else(|| {
            if !raw.is_empty() {
                let snippet = raw.chars().take(400).collect::<String>();
                warn!("OpenAI raw body: {}", snippet);
            }
            PipelineError::MalformedResponse("OpenAI response had no message content".into())
        })
    }
}
