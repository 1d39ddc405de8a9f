use crate::error::{PipelineError, StageResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Process-level configuration loaded once from config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "openai_api_key")]
    pub openai_key: String,
    #[serde(rename = "pexels_api_key")]
    pub pexels_key: String,
    #[serde(rename = "elevenlabs_api_key")]
    pub elevenlabs_key: String,
    #[serde(rename = "youtube_access_token")]
    #[serde(default)]
    pub youtube_token: String,

    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_songs_dir")]
    pub songs_dir: String,
    #[serde(default)]
    pub songs_zip_url: Option<String>,

    /// Leave the per-job workspace on disk at terminal states for debugging.
    #[serde(default)]
    pub keep_workspace: bool,
    /// Use the transcription service for subtitle timing instead of the
    /// local character-weighted heuristic.
    #[serde(default)]
    pub use_alignment_service: bool,
    #[serde(default = "default_words_per_cue")]
    pub words_per_cue: usize,
    /// Speaking-rate estimate (characters per second) used to size the
    /// footage target while narration synthesis is still in flight.
    #[serde(default = "default_speaking_rate")]
    pub speaking_rate_cps: f64,
}

fn default_work_dir() -> String {
    "temp".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_songs_dir() -> String {
    "songs".to_string()
}

fn default_words_per_cue() -> usize {
    4
}

fn default_speaking_rate() -> f64 {
    15.0
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: Config = serde_json::from_str(&content)?;

        if config.openai_key.is_empty() {
            anyhow::bail!("config.json: openai_api_key missing");
        }
        if config.pexels_key.is_empty() {
            anyhow::bail!("config.json: pexels_api_key missing");
        }
        if config.elevenlabs_key.is_empty() {
            anyhow::bail!("config.json: elevenlabs_api_key missing");
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_key: String::new(),
            pexels_key: String::new(),
            elevenlabs_key: String::new(),
            youtube_token: String::new(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            songs_dir: default_songs_dir(),
            songs_zip_url: None,
            keep_workspace: false,
            use_alignment_service: false,
            words_per_cue: default_words_per_cue(),
            speaking_rate_cps: default_speaking_rate(),
        }
    }
}

/// Text-generation backend selector carried by the job request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AiModel {
    #[default]
    #[serde(rename = "gpt3.5-turbo")]
    Gpt35Turbo,
    #[serde(rename = "gpt4")]
    Gpt4,
    #[serde(rename = "gpt4o")]
    Gpt4o,
}

impl AiModel {
    pub fn model_name(self) -> &'static str {
        match self {
            AiModel::Gpt35Turbo => "gpt-3.5-turbo",
            AiModel::Gpt4 => "gpt-4-1106-preview",
            AiModel::Gpt4o => "gpt-4o",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitlePosition {
    Top,
    #[default]
    Center,
    Bottom,
}

impl SubtitlePosition {
    /// ASS numpad alignment used by the subtitle burn-in filter.
    pub fn ass_alignment(self) -> u8 {
        match self {
            SubtitlePosition::Top => 8,
            SubtitlePosition::Center => 5,
            SubtitlePosition::Bottom => 2,
        }
    }
}

/// One video-generation request, as accepted by the inbound "start
/// generation" operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub topic: String,
    #[serde(default)]
    pub model: AiModel,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_paragraph_count")]
    pub paragraph_count: u32,
    #[serde(default)]
    pub use_music: bool,
    #[serde(default)]
    pub music_source: Option<String>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub subtitles_position: SubtitlePosition,
    #[serde(default = "default_subtitles_color")]
    pub subtitles_color: String,
    #[serde(default)]
    pub upload_to_video_host: bool,
    #[serde(default)]
    pub extra_prompt: Option<String>,
}

fn default_voice() -> String {
    "JBFqnCBsd6RMkjVDRZzb".to_string()
}

fn default_paragraph_count() -> u32 {
    1
}

fn default_threads() -> usize {
    4
}

fn default_subtitles_color() -> String {
    "#FFFF00".to_string()
}

impl JobRequest {
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            model: AiModel::default(),
            voice: default_voice(),
            paragraph_count: default_paragraph_count(),
            use_music: false,
            music_source: None,
            threads: default_threads(),
            subtitles_position: SubtitlePosition::default(),
            subtitles_color: default_subtitles_color(),
            upload_to_video_host: false,
            extra_prompt: None,
        }
    }

    pub fn validate(&self) -> StageResult<()> {
        if self.topic.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("topic must be non-empty".into()));
        }
        if self.paragraph_count == 0 {
            return Err(PipelineError::InvalidRequest(
                "paragraphCount must be at least 1".into(),
            ));
        }
        if self.threads == 0 {
            return Err(PipelineError::InvalidRequest("threads must be at least 1".into()));
        }
        if self.voice.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("voice must be non-empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_from_minimal_json() {
        let req: JobRequest = serde_json::from_str(r#"{"topic": "the history of chess"}"#)
            .expect("minimal request parses");
        assert_eq!(req.topic, "the history of chess");
        assert_eq!(req.model, AiModel::Gpt35Turbo);
        assert_eq!(req.threads, 4);
        assert_eq!(req.subtitles_position, SubtitlePosition::Center);
        assert!(!req.use_music);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn request_accepts_camel_case_options() {
        let req: JobRequest = serde_json::from_str(
            r##"{
                "topic": "volcanoes",
                "model": "gpt4",
                "paragraphCount": 3,
                "useMusic": true,
                "threads": 8,
                "subtitlesPosition": "bottom",
                "subtitlesColor": "#FF0000",
                "uploadToVideoHost": true,
                "extraPrompt": "keep it upbeat"
            }"##,
        )
        .expect("full request parses");
        assert_eq!(req.model, AiModel::Gpt4);
        assert_eq!(req.paragraph_count, 3);
        assert_eq!(req.subtitles_position, SubtitlePosition::Bottom);
        assert!(req.upload_to_video_host);
        assert_eq!(req.extra_prompt.as_deref(), Some("keep it upbeat"));
    }

    #[test]
    fn empty_topic_is_rejected() {
        let mut req = JobRequest::for_topic("  ");
        assert!(req.validate().is_err());
        req.topic = "chess".into();
        req.threads = 0;
        assert!(req.validate().is_err());
    }
}
