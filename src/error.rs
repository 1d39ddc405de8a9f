use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stages in execution order. Acquiring and Synthesizing run as two
/// concurrent branches that join before Aligning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Pending,
    Scripting,
    Acquiring,
    Synthesizing,
    Aligning,
    Composing,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "Pending",
            Stage::Scripting => "Scripting",
            Stage::Acquiring => "Acquiring",
            Stage::Synthesizing => "Synthesizing",
            Stage::Aligning => "Aligning",
            Stage::Composing => "Composing",
            Stage::Publishing => "Publishing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("voice not found: {0}")]
    VoiceNotFound(String),

    #[error("asset unreadable: {0}")]
    AssetUnreadable(String),

    #[error("encoding failure: {0}")]
    EncodingFailure(String),

    #[error("footage shortfall: have {have:.2}s of {need:.2}s")]
    DurationShortfall { have: f64, need: f64 },

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Only transient errors are eligible for retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::UpstreamUnavailable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "invalidRequest",
            PipelineError::UpstreamUnavailable(_) => "upstreamUnavailable",
            PipelineError::MalformedResponse(_) => "malformedResponse",
            PipelineError::VoiceNotFound(_) => "voiceNotFound",
            PipelineError::AssetUnreadable(_) => "assetUnreadable",
            PipelineError::EncodingFailure(_) => "encodingFailure",
            PipelineError::DurationShortfall { .. } => "durationShortfall",
            PipelineError::AuthFailure(_) => "authFailure",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PipelineError::MalformedResponse(err.to_string())
        } else {
            // Timeouts, connect failures and mid-body aborts all count as the
            // upstream being unavailable for retry accounting.
            PipelineError::UpstreamUnavailable(err.to_string())
        }
    }
}

/// A pipeline error tagged with the stage it originated in, retained on the
/// terminal `Failed` state for diagnostics.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl StageFailure {
    pub fn new(stage: Stage, source: PipelineError) -> Self {
        Self { stage, source }
    }
}

pub type StageResult<T> = Result<T, PipelineError>;
