use crate::api::{with_retries, SpeechBackend};
use crate::error::{PipelineError, StageResult};
use crate::pipeline::CancelFlag;
use crate::workspace::TempWorkspace;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

const TTS_ATTEMPTS: u32 = 3;

/// One sentence's synthesized audio, the atomic unit for timing bookkeeping.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub text: String,
    pub path: PathBuf,
    pub duration: f64,
}

/// The full narration: per-sentence segments in script order. The backend's
/// per-segment durations are authoritative for cue boundaries; the physical
/// concatenation happens in the composer alongside the other media work.
#[derive(Debug, Clone)]
pub struct NarrationTrack {
    pub segments: Vec<AudioSegment>,
    pub total_duration: f64,
}

impl NarrationTrack {
    pub fn new(segments: Vec<AudioSegment>) -> Self {
        let total_duration = segments.iter().map(|s| s.duration).sum();
        Self {
            segments,
            total_duration,
        }
    }

    /// Start offset of each segment within the concatenated track.
    pub fn segment_offsets(&self) -> Vec<f64> {
        let mut offsets = Vec::with_capacity(self.segments.len());
        let mut t = 0.0;
        for segment in &self.segments {
            offsets.push(t);
            t += segment.duration;
        }
        offsets
    }
}

/// Synthesize one audio segment per sentence, in script order. Per-sentence
/// calls keep segment boundaries exact, which is what makes heuristic
/// subtitle alignment possible without a transcription pass.
pub async fn synthesize(
    backend: &dyn SpeechBackend,
    workspace: &TempWorkspace,
    sentences: &[String],
    voice: &str,
    cancel: &CancelFlag,
) -> StageResult<NarrationTrack> {
    let mut segments = Vec::with_capacity(sentences.len());

    for (idx, sentence) in sentences.iter().enumerate() {
        cancel.checkpoint()?;

        let audio = with_retries("speech synthesis", TTS_ATTEMPTS, || {
            backend.synthesize(sentence, voice)
        })
        .await?;

        if audio.duration <= 0.0 {
            return Err(PipelineError::MalformedResponse(format!(
                "segment {idx} came back with non-positive duration"
            )));
        }

        let path = workspace.file(&format!("narration_{idx:03}.mp3"));
        fs::write(&path, &audio.audio).await?;
        info!(
            segment = idx,
            duration = audio.duration,
            "synthesized narration segment"
        );

        segments.push(AudioSegment {
            text: sentence.clone(),
            path,
            duration: audio.duration,
        });
    }

    let track = NarrationTrack::new(segments);
    info!(
        segments = track.segments.len(),
        duration = track.total_duration,
        "narration track ready"
    );
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SpeechBackend, SynthesizedAudio};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn segment(text: &str, duration: f64) -> AudioSegment {
        AudioSegment {
            text: text.to_string(),
            path: PathBuf::new(),
            duration,
        }
    }

    #[test]
    fn track_totals_and_offsets_follow_script_order() {
        let track = NarrationTrack::new(vec![
            segment("one", 2.0),
            segment("two", 3.5),
            segment("three", 1.5),
        ]);
        assert!((track.total_duration - 7.0).abs() < 1e-9);
        assert_eq!(track.segment_offsets(), vec![0.0, 2.0, 5.5]);
    }

    struct OkBackend;

    #[async_trait]
    impl SpeechBackend for OkBackend {
        async fn synthesize(&self, sentence: &str, _v: &str) -> StageResult<SynthesizedAudio> {
            Ok(SynthesizedAudio {
                audio: sentence.as_bytes().to_vec(),
                duration: 0.1 * sentence.len() as f64,
            })
        }
    }

    #[tokio::test]
    async fn segments_are_written_in_script_order() {
        let root = tempfile::tempdir().expect("root");
        let ws = TempWorkspace::create(root.path()).await.expect("workspace");
        let sentences = vec!["First sentence.".to_string(), "Second one.".to_string()];

        let track = synthesize(&OkBackend, &ws, &sentences, "voice-1", &CancelFlag::new())
            .await
            .expect("track");

        assert_eq!(track.segments.len(), 2);
        assert_eq!(track.segments[0].text, "First sentence.");
        for segment in &track.segments {
            assert!(segment.path.exists());
        }
        let expected: f64 = sentences.iter().map(|s| 0.1 * s.len() as f64).sum();
        assert!((track.total_duration - expected).abs() < 1e-9);
    }

    struct FailingBackend {
        calls: AtomicU32,
        error: fn() -> PipelineError,
    }

    #[async_trait]
    impl SpeechBackend for FailingBackend {
        async fn synthesize(&self, _s: &str, _v: &str) -> StageResult<SynthesizedAudio> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_timeouts_fail_after_bounded_retries() {
        let backend = FailingBackend {
            calls: AtomicU32::new(0),
            error: || PipelineError::UpstreamUnavailable("timeout".into()),
        };
        let root = tempfile::tempdir().expect("root");
        let ws = TempWorkspace::create(root.path()).await.expect("workspace");

        let result = synthesize(
            &backend,
            &ws,
            &["One sentence.".to_string()],
            "voice-1",
            &CancelFlag::new(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::UpstreamUnavailable(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), TTS_ATTEMPTS);
    }

    #[tokio::test]
    async fn unknown_voice_fails_immediately_without_retry() {
        let backend = FailingBackend {
            calls: AtomicU32::new(0),
            error: || PipelineError::VoiceNotFound("ghost".into()),
        };
        let root = tempfile::tempdir().expect("root");
        let ws = TempWorkspace::create(root.path()).await.expect("workspace");

        let result = synthesize(
            &backend,
            &ws,
            &["One sentence.".to_string()],
            "ghost",
            &CancelFlag::new(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::VoiceNotFound(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
