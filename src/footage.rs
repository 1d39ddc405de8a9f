use crate::api::{ClipCandidate, ClipProvider};
use crate::error::{PipelineError, StageResult};
use crate::pipeline::CancelFlag;
use crate::workspace::TempWorkspace;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const MIN_CLIP_HEIGHT: u32 = 1080;
pub const MIN_CLIP_SECS: f64 = 3.0;
pub const MAX_CLIP_SECS: f64 = 60.0;

/// A downloaded stock clip, accepted into the job's footage pool.
#[derive(Debug, Clone)]
pub struct FootageAsset {
    pub source_id: String,
    pub path: PathBuf,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

/// Acquisition outcome. A shortfall is a soft failure: the partial set is
/// returned and the orchestrator decides whether looping the available
/// footage is acceptable.
#[derive(Debug)]
pub struct Acquisition {
    pub assets: Vec<FootageAsset>,
    pub shortfall: Option<f64>,
}

impl Acquisition {
    pub fn total_duration(&self) -> f64 {
        self.assets.iter().map(|a| a.duration).sum()
    }
}

/// Keep only portrait candidates that meet the resolution and clip-length
/// constraints.
pub fn filter_candidates(candidates: Vec<ClipCandidate>) -> Vec<ClipCandidate> {
    candidates
        .into_iter()
        .filter(|c| c.height > c.width)
        .filter(|c| c.height >= MIN_CLIP_HEIGHT)
        .filter(|c| (MIN_CLIP_SECS..=MAX_CLIP_SECS).contains(&c.duration))
        .collect()
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

async fn collect_candidates(
    provider: &Arc<dyn ClipProvider>,
    terms: &[String],
    seen: &mut HashSet<String>,
    last_error: &mut Option<PipelineError>,
) -> VecDeque<ClipCandidate> {
    let mut queue = VecDeque::new();
    for term in terms {
        match provider.search_clips(term).await {
            Ok(found) => {
                let usable = filter_candidates(found);
                info!(term = %term, candidates = usable.len(), "footage search");
                for candidate in usable {
                    if seen.insert(candidate.id.clone()) {
                        queue.push_back(candidate);
                    }
                }
            }
            Err(err) => {
                warn!(term = %term, "footage search failed: {err}");
                *last_error = Some(err);
            }
        }
    }
    queue
}

/// Search and download stock clips until the accepted total duration reaches
/// `min_total` or all candidates (including one fallback expansion round) are
/// exhausted. Downloads run in a bounded pool of `max_concurrency` workers;
/// clips are accepted in completion order. A single failed download never
/// aborts the acquisition.
pub async fn acquire(
    provider: &Arc<dyn ClipProvider>,
    workspace: &TempWorkspace,
    terms: &[String],
    fallback_terms: &[String],
    min_total: f64,
    max_concurrency: usize,
    cancel: &CancelFlag,
) -> StageResult<Acquisition> {
    let mut accepted: Vec<FootageAsset> = Vec::new();
    let mut accepted_total = 0.0;
    let mut seen = HashSet::new();
    let mut last_search_error = None;
    let width = max_concurrency.max(1);

    for (round, term_set) in [terms, fallback_terms].into_iter().enumerate() {
        if accepted_total >= min_total {
            break;
        }
        cancel.checkpoint()?;
        if round == 1 {
            warn!(
                have = accepted_total,
                need = min_total,
                "footage below target; expanding search with fallback terms"
            );
        }

        let mut queue =
            collect_candidates(provider, term_set, &mut seen, &mut last_search_error).await;
        let mut pool: JoinSet<Result<FootageAsset, (String, PipelineError)>> = JoinSet::new();

        let mut spawn_next =
            |pool: &mut JoinSet<Result<FootageAsset, (String, PipelineError)>>,
             queue: &mut VecDeque<ClipCandidate>| {
                if let Some(candidate) = queue.pop_front() {
                    let provider = Arc::clone(provider);
                    let cancel = cancel.clone();
                    let dest = workspace.file(&format!("clip_{}.mp4", sanitize_id(&candidate.id)));
                    pool.spawn(async move {
                        if cancel.is_cancelled() {
                            return Err((candidate.id.clone(), PipelineError::Cancelled));
                        }
                        match provider.fetch(&candidate, &dest).await {
                            Ok(()) => Ok(FootageAsset {
                                source_id: candidate.id,
                                path: dest,
                                duration: candidate.duration,
                                width: candidate.width,
                                height: candidate.height,
                            }),
                            Err(err) => Err((candidate.id, err)),
                        }
                    });
                }
            };

        while pool.len() < width && !queue.is_empty() {
            spawn_next(&mut pool, &mut queue);
        }

        while let Some(joined) = pool.join_next().await {
            if cancel.is_cancelled() {
                pool.abort_all();
                return Err(PipelineError::Cancelled);
            }

            match joined {
                Ok(Ok(asset)) => {
                    info!(
                        source = %asset.source_id,
                        duration = asset.duration,
                        "accepted footage clip"
                    );
                    accepted_total += asset.duration;
                    accepted.push(asset);
                }
                Ok(Err((id, PipelineError::Cancelled))) => {
                    warn!(source = %id, "download skipped by cancellation");
                }
                Ok(Err((id, err))) => {
                    warn!(source = %id, "clip download failed, skipping: {err}");
                }
                Err(join_err) => {
                    warn!("download worker panicked: {join_err}");
                }
            }

            if accepted_total >= min_total {
                // Target met; stop the remaining in-flight downloads.
                pool.abort_all();
                break;
            }
            spawn_next(&mut pool, &mut queue);
        }
    }

    if accepted.is_empty() {
        if let Some(err) = last_search_error {
            return Err(err);
        }
    }

    let shortfall = if accepted_total + 1e-6 < min_total {
        Some(min_total - accepted_total)
    } else {
        None
    };

    info!(
        clips = accepted.len(),
        total = accepted_total,
        target = min_total,
        shortfall = ?shortfall,
        "footage acquisition finished"
    );
    Ok(Acquisition {
        assets: accepted,
        shortfall,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClipProvider;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    fn candidate(id: &str, duration: f64) -> ClipCandidate {
        ClipCandidate {
            id: id.to_string(),
            url: format!("https://clips.test/{id}"),
            duration,
            width: 1080,
            height: 1920,
        }
    }

    struct MockProvider {
        by_term: Mutex<std::collections::HashMap<String, Vec<ClipCandidate>>>,
        fail_ids: HashSet<String>,
        block_fetch: Option<Arc<tokio::sync::Semaphore>>,
    }

    impl MockProvider {
        fn new(by_term: Vec<(&str, Vec<ClipCandidate>)>) -> Self {
            Self {
                by_term: Mutex::new(
                    by_term
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                ),
                fail_ids: HashSet::new(),
                block_fetch: None,
            }
        }
    }

    #[async_trait]
    impl ClipProvider for MockProvider {
        async fn search_clips(&self, term: &str) -> StageResult<Vec<ClipCandidate>> {
            Ok(self
                .by_term
                .lock()
                .expect("lock")
                .get(term)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch(&self, cand: &ClipCandidate, dest: &Path) -> StageResult<()> {
            if let Some(gate) = &self.block_fetch {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::UpstreamUnavailable("gate closed".into()))?;
                permit.forget();
            }
            if self.fail_ids.contains(&cand.id) {
                return Err(PipelineError::UpstreamUnavailable("404".into()));
            }
            tokio::fs::write(dest, b"clip-bytes").await?;
            Ok(())
        }
    }

    async fn workspace() -> (tempfile::TempDir, TempWorkspace) {
        let root = tempfile::tempdir().expect("root");
        let ws = TempWorkspace::create(root.path()).await.expect("workspace");
        (root, ws)
    }

    #[test]
    fn filtering_enforces_orientation_resolution_and_length() {
        let kept = filter_candidates(vec![
            candidate("ok", 10.0),
            ClipCandidate {
                width: 1920,
                height: 1080,
                ..candidate("landscape", 10.0)
            },
            ClipCandidate {
                height: 960,
                width: 540,
                ..candidate("lowres", 10.0)
            },
            candidate("too-short", 1.0),
            candidate("too-long", 300.0),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "ok");
    }

    #[tokio::test]
    async fn acquisition_meets_duration_target_and_dedupes() {
        let shared = vec![candidate("a", 10.0), candidate("b", 10.0)];
        let provider: Arc<dyn ClipProvider> = Arc::new(MockProvider::new(vec![
            ("chess", shared.clone()),
            ("chess board", vec![candidate("a", 10.0), candidate("c", 10.0)]),
        ]));
        let (_root, ws) = workspace().await;

        let acq = acquire(
            &provider,
            &ws,
            &["chess".into(), "chess board".into()],
            &[],
            25.0,
            4,
            &CancelFlag::new(),
        )
        .await
        .expect("acquisition");

        assert!(acq.total_duration() >= 25.0);
        assert!(acq.shortfall.is_none());
        let ids: HashSet<_> = acq.assets.iter().map(|a| a.source_id.clone()).collect();
        assert_eq!(ids.len(), acq.assets.len(), "no duplicate source ids");
        for asset in &acq.assets {
            assert!(asset.path.exists());
        }
    }

    #[tokio::test]
    async fn failed_downloads_are_skipped_not_fatal() {
        let mut provider = MockProvider::new(vec![(
            "sea",
            vec![candidate("bad", 10.0), candidate("good", 10.0)],
        )]);
        provider.fail_ids.insert("bad".to_string());
        let provider: Arc<dyn ClipProvider> = Arc::new(provider);
        let (_root, ws) = workspace().await;

        let acq = acquire(
            &provider,
            &ws,
            &["sea".into()],
            &[],
            10.0,
            2,
            &CancelFlag::new(),
        )
        .await
        .expect("acquisition");

        assert_eq!(acq.assets.len(), 1);
        assert_eq!(acq.assets[0].source_id, "good");
    }

    #[tokio::test]
    async fn exhausted_candidates_report_shortfall_with_partial_set() {
        let provider: Arc<dyn ClipProvider> =
            Arc::new(MockProvider::new(vec![("rain", vec![candidate("only", 8.0)])]));
        let (_root, ws) = workspace().await;

        let acq = acquire(
            &provider,
            &ws,
            &["rain".into()],
            &["storm".into()],
            30.0,
            2,
            &CancelFlag::new(),
        )
        .await
        .expect("acquisition");

        assert_eq!(acq.assets.len(), 1);
        let missing = acq.shortfall.expect("shortfall reported");
        assert!((missing - 22.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn fallback_round_runs_when_primary_terms_fall_short() {
        let provider: Arc<dyn ClipProvider> = Arc::new(MockProvider::new(vec![
            ("rain", vec![candidate("one", 5.0)]),
            ("rain background", vec![candidate("two", 10.0)]),
        ]));
        let (_root, ws) = workspace().await;

        let acq = acquire(
            &provider,
            &ws,
            &["rain".into()],
            &["rain background".into()],
            12.0,
            2,
            &CancelFlag::new(),
        )
        .await
        .expect("acquisition");

        assert_eq!(acq.assets.len(), 2);
        assert!(acq.shortfall.is_none());
    }

    #[tokio::test]
    async fn cancellation_halts_scheduling_promptly() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut provider = MockProvider::new(vec![(
            "sky",
            (0..8).map(|i| candidate(&format!("c{i}"), 10.0)).collect(),
        )]);
        provider.block_fetch = Some(Arc::clone(&gate));
        let provider: Arc<dyn ClipProvider> = Arc::new(provider);
        let (_root, ws) = workspace().await;
        let cancel = CancelFlag::new();

        let cancel2 = cancel.clone();
        let gate2 = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel2.cancel();
            // Release the blocked workers so the pool ticks.
            gate2.add_permits(8);
        });

        let result = acquire(&provider, &ws, &["sky".into()], &[], 100.0, 2, &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
