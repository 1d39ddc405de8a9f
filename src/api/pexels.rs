use crate::api::{ClipCandidate, ClipProvider};
use crate::error::{PipelineError, StageResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

const SEARCH_URL: &str = "https://api.pexels.com/videos/search";
const RESULTS_PER_TERM: u32 = 10;
const SEARCH_TIMEOUT_SECS: u64 = 30;
const DOWNLOAD_TIMEOUT_SECS: u64 = 180;

/// Pexels stock-video search client.
pub struct PexelsClient {
    client: Client,
    api_key: String,
}

impl PexelsClient {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    videos: Vec<PexelsVideo>,
}

#[derive(Debug, Deserialize)]
struct PexelsVideo {
    id: u64,
    duration: f64,
    #[serde(default)]
    video_files: Vec<PexelsVideoFile>,
}

#[derive(Debug, Deserialize)]
struct PexelsVideoFile {
    width: Option<u32>,
    height: Option<u32>,
    link: String,
    #[serde(default)]
    file_type: String,
}

/// Pick the highest-resolution mp4 rendition of a search hit.
fn best_file(video: &PexelsVideo) -> Option<(&PexelsVideoFile, u32, u32)> {
    video
        .video_files
        .iter()
        .filter(|f| f.file_type == "video/mp4")
        .filter_map(|f| Some((f, f.width?, f.height?)))
        .max_by_key(|(_, w, h)| u64::from(*w) * u64::from(*h))
}

#[async_trait]
impl ClipProvider for PexelsClient {
    async fn search_clips(&self, term: &str) -> StageResult<Vec<ClipCandidate>> {
        let per_page = RESULTS_PER_TERM.to_string();
        let resp = self
            .client
            .get(SEARCH_URL)
            .header("Authorization", &self.api_key)
            .query(&[
                ("query", term),
                ("per_page", per_page.as_str()),
                ("orientation", "portrait"),
            ])
            .timeout(std::time::Duration::from_secs(SEARCH_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::AuthFailure(format!(
                "Pexels HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "Pexels HTTP {}",
                status.as_u16()
            )));
        }

        let body: SearchResponse = resp.json().await?;
        let candidates = body
            .videos
            .iter()
            .filter_map(|video| {
                let (file, width, height) = best_file(video)?;
                Some(ClipCandidate {
                    id: video.id.to_string(),
                    url: file.link.clone(),
                    duration: video.duration,
                    width,
                    height,
                })
            })
            .collect();

        Ok(candidates)
    }

    async fn fetch(&self, candidate: &ClipCandidate, dest: &Path) -> StageResult<()> {
        let resp = self
            .client
            .get(&candidate.url)
            .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "clip download HTTP {} for {}",
                status.as_u16(),
                candidate.url
            )));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(PipelineError::MalformedResponse(format!(
                "empty clip body for {}",
                candidate.url
            )));
        }
        fs::write(dest, &bytes).await?;
        Ok(())
    }
}
