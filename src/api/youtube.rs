use crate::api::VideoHost;
use crate::error::{PipelineError, StageResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use tokio::fs;
use tracing::info;

const UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status";
const CATEGORY_EDUCATION: &str = "27";
const INIT_TIMEOUT_SECS: u64 = 60;
const UPLOAD_TIMEOUT_SECS: u64 = 900;

pub const VALID_PRIVACY_STATUSES: &[&str] = &["public", "private", "unlisted"];

/// YouTube Data API upload client. The OAuth consent flow lives outside the
/// pipeline; this client only consumes a ready access token.
pub struct YouTubeClient {
    client: Client,
    access_token: String,
}

impl YouTubeClient {
    pub fn new(client: Client, access_token: impl Into<String>) -> Self {
        Self {
            client,
            access_token: access_token.into(),
        }
    }
}

fn classify_status(status: reqwest::StatusCode, context: &str) -> PipelineError {
    match status.as_u16() {
        401 | 403 => PipelineError::AuthFailure(format!("{context}: HTTP {}", status.as_u16())),
        500 | 502 | 503 | 504 | 429 => {
            PipelineError::UpstreamUnavailable(format!("{context}: HTTP {}", status.as_u16()))
        }
        code => PipelineError::MalformedResponse(format!("{context}: HTTP {code}")),
    }
}

#[async_trait]
impl VideoHost for YouTubeClient {
    async fn upload(
        &self,
        file: &Path,
        title: &str,
        description: &str,
        visibility: &str,
    ) -> StageResult<String> {
        if !VALID_PRIVACY_STATUSES.contains(&visibility) {
            return Err(PipelineError::InvalidRequest(format!(
                "unsupported privacy status: {visibility}"
            )));
        }

        let body = json!({
            "snippet": {
                "title": title.trim_matches('"'),
                "description": description,
                "categoryId": CATEGORY_EDUCATION,
            },
            "status": {
                "privacyStatus": visibility,
                "madeForKids": false,
                "selfDeclaredMadeForKids": false,
            },
        });

        // Resumable upload, step 1: open an upload session.
        let init = self
            .client
            .post(UPLOAD_URL)
            .bearer_auth(&self.access_token)
            .json(&body)
            .timeout(std::time::Duration::from_secs(INIT_TIMEOUT_SECS))
            .send()
            .await?;

        let status = init.status();
        if !status.is_success() {
            return Err(classify_status(status, "upload session init"));
        }

        let session_url = init
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                PipelineError::MalformedResponse("upload init returned no session URL".into())
            })?;

        // Step 2: send the file body.
        let bytes = fs::read(file).await?;
        info!(size = bytes.len(), "uploading rendered video");
        let resp = self
            .client
            .put(&session_url)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "video/mp4")
            .body(bytes)
            .timeout(std::time::Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, "upload"));
        }

        let value: serde_json::Value = resp.json().await?;
        value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                PipelineError::MalformedResponse("upload response carried no video id".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_transient_statuses_are_distinguished() {
        let auth = classify_status(reqwest::StatusCode::UNAUTHORIZED, "upload");
        assert!(matches!(auth, PipelineError::AuthFailure(_)));

        let transient = classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "upload");
        assert!(matches!(transient, PipelineError::UpstreamUnavailable(_)));

        let other = classify_status(reqwest::StatusCode::BAD_REQUEST, "upload");
        assert!(matches!(other, PipelineError::MalformedResponse(_)));
    }
}
