use crate::config::AiModel;
use crate::error::StageResult;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub mod elevenlabs;
pub mod openai;
pub mod pexels;
pub mod whisper;
pub mod youtube;

/// Candidate clip metadata returned by a stock-footage search backend.
#[derive(Debug, Clone)]
pub struct ClipCandidate {
    pub id: String,
    pub url: String,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

/// One synthesized audio segment as returned by a speech backend.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub duration: f64,
}

/// A word-level timestamp from a transcription/alignment backend, in seconds
/// relative to the submitted audio.
#[derive(Debug, Clone)]
pub struct WordStamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, model: AiModel, prompt: &str) -> StageResult<String>;
}

#[async_trait]
pub trait ClipProvider: Send + Sync {
    async fn search_clips(&self, term: &str) -> StageResult<Vec<ClipCandidate>>;
    async fn fetch(&self, candidate: &ClipCandidate, dest: &Path) -> StageResult<()>;
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    async fn synthesize(&self, sentence: &str, voice: &str) -> StageResult<SynthesizedAudio>;
}

#[async_trait]
pub trait AlignmentBackend: Send + Sync {
    async fn align(&self, audio: &Path) -> StageResult<Vec<WordStamp>>;
}

#[async_trait]
pub trait VideoHost: Send + Sync {
    async fn upload(
        &self,
        file: &Path,
        title: &str,
        description: &str,
        visibility: &str,
    ) -> StageResult<String>;
}

const INITIAL_BACKOFF_MS: u64 = 500;

/// Retry an operation a bounded number of times, with exponential backoff and
/// jitter, as long as the failure is transient. Non-transient errors surface
/// immediately.
pub async fn with_retries<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> StageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StageResult<T>>,
{
    let mut delay = Duration::from_millis(INITIAL_BACKOFF_MS);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                let wait = delay + Duration::from_millis(jitter);
                warn!(
                    "{what}: attempt {attempt}/{attempts} failed ({err}); retrying in {:.1}s",
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_up_to_bound() {
        let calls = AtomicU32::new(0);
        let result: StageResult<()> = with_retries("test op", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::UpstreamUnavailable("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(PipelineError::UpstreamUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: StageResult<()> = with_retries("test op", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::VoiceNotFound("nope".into())) }
        })
        .await;

        assert!(matches!(result, Err(PipelineError::VoiceNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let result = with_retries("test op", 3, || async { Ok(7) }).await;
        assert_eq!(result.expect("ok"), 7);
    }
}
