use crate::api::{AlignmentBackend, ClipProvider, SpeechBackend, TextGenerator, VideoHost};
use crate::compose::{self, RenderedVideo};
use crate::config::{Config, JobRequest};
use crate::error::{PipelineError, Stage, StageFailure, StageResult};
use crate::footage;
use crate::music;
use crate::publish;
use crate::script;
use crate::speech;
use crate::subtitle;
use crate::workspace::TempWorkspace;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Minimum footage target. The real narration duration is unknown while the
/// Acquiring and Synthesizing branches run concurrently, so the target is an
/// estimate from script length; the composer's loop plan absorbs any
/// underestimate.
const MIN_FOOTAGE_TARGET_SECS: f64 = 10.0;

/// Cooperative cancellation signal, checked between stages and at coarse
/// intervals inside the long-running ones.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> StageResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Externally visible job state, served by the status query.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobStatus {
    Running {
        stage: Stage,
    },
    Completed {
        output: PathBuf,
        duration: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
    },
    Failed {
        stage: Stage,
        kind: String,
        message: String,
    },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running { .. })
    }
}

/// The outbound collaborators a job consumes, each behind a narrow interface.
pub struct Backends {
    pub text: Arc<dyn TextGenerator>,
    pub clips: Arc<dyn ClipProvider>,
    pub speech: Arc<dyn SpeechBackend>,
    pub aligner: Option<Arc<dyn AlignmentBackend>>,
    pub host: Option<Arc<dyn VideoHost>>,
    pub http: reqwest::Client,
}

struct JobShared {
    status: Mutex<JobStatus>,
    cancel: CancelFlag,
    /// Rendering is the resource-heavy stage; at most one render per job.
    render_lock: tokio::sync::Mutex<()>,
}

impl JobShared {
    fn set_status(&self, status: JobStatus) {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        *guard = status;
    }

    fn set_stage(&self, stage: Stage) {
        self.set_status(JobStatus::Running { stage });
    }

    fn snapshot(&self) -> JobStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct JobEntry {
    shared: Arc<JobShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keyed store of generation jobs: one record per job id, one writer (the
/// job's own task) per record.
pub struct JobManager {
    config: Arc<Config>,
    backends: Arc<Backends>,
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
}

fn new_job_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

impl JobManager {
    pub fn new(config: Arc<Config>, backends: Arc<Backends>) -> Self {
        Self {
            config,
            backends,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Validate and launch a generation job; returns its id immediately.
    pub fn start(&self, request: JobRequest) -> StageResult<String> {
        request.validate()?;

        let job_id = new_job_id();
        let shared = Arc::new(JobShared {
            status: Mutex::new(JobStatus::Running {
                stage: Stage::Pending,
            }),
            cancel: CancelFlag::new(),
            render_lock: tokio::sync::Mutex::new(()),
        });

        let task = tokio::spawn(run_job(
            Arc::clone(&self.config),
            Arc::clone(&self.backends),
            request,
            Arc::clone(&shared),
            job_id.clone(),
        ));

        let entry = Arc::new(JobEntry {
            shared,
            task: Mutex::new(Some(task)),
        });
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), entry);

        Ok(job_id)
    }

    /// Signal cooperative cancellation. Returns false for unknown jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.entry(job_id) {
            Some(entry) => {
                entry.shared.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.entry(job_id).map(|entry| entry.shared.snapshot())
    }

    /// Block until the job reaches a terminal state and return it.
    pub async fn wait(&self, job_id: &str) -> Option<JobStatus> {
        let entry = self.entry(job_id)?;

        let task = entry
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(job = job_id, "job task aborted: {err}");
            }
        } else {
            while !entry.shared.snapshot().is_terminal() {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        }

        Some(entry.shared.snapshot())
    }
}

async fn run_job(
    config: Arc<Config>,
    backends: Arc<Backends>,
    request: JobRequest,
    shared: Arc<JobShared>,
    job_id: String,
) {
    info!(job = %job_id, topic = %request.topic, "generation job started");

    let outcome = run_pipeline(&config, &backends, &request, &shared, &job_id).await;
    match outcome {
        Ok((video, remote_id)) => {
            info!(job = %job_id, output = %video.path.display(), "generation job completed");
            shared.set_status(JobStatus::Completed {
                output: video.path,
                duration: video.duration,
                remote_id,
            });
        }
        Err(failure) if matches!(failure.source, PipelineError::Cancelled) => {
            info!(job = %job_id, stage = %failure.stage, "generation job cancelled");
            shared.set_status(JobStatus::Cancelled);
        }
        Err(failure) => {
            error!(job = %job_id, stage = %failure.stage, "generation job failed: {}", failure.source);
            shared.set_status(JobStatus::Failed {
                stage: failure.stage,
                kind: failure.source.kind().to_string(),
                message: failure.source.to_string(),
            });
        }
    }
}

async fn run_pipeline(
    config: &Config,
    backends: &Backends,
    request: &JobRequest,
    shared: &JobShared,
    job_id: &str,
) -> Result<(RenderedVideo, Option<String>), StageFailure> {
    let workspace = TempWorkspace::create(Path::new(&config.work_dir))
        .await
        .map_err(|e| StageFailure::new(Stage::Pending, e.into()))?;

    let result = drive(config, backends, request, shared, &workspace, job_id).await;

    // Cleanup runs at every terminal state: success, failure or cancellation.
    workspace.cleanup(config.keep_workspace);

    result
}

async fn drive(
    config: &Config,
    backends: &Backends,
    request: &JobRequest,
    shared: &JobShared,
    workspace: &TempWorkspace,
    job_id: &str,
) -> Result<(RenderedVideo, Option<String>), StageFailure> {
    let cancel = &shared.cancel;
    let fail = StageFailure::new;

    // Scripting
    shared.set_stage(Stage::Scripting);
    cancel.checkpoint().map_err(|e| fail(Stage::Scripting, e))?;
    let script = script::generate(backends.text.as_ref(), request)
        .await
        .map_err(|e| fail(Stage::Scripting, e))?;

    let footage_target = script
        .estimated_duration(config.speaking_rate_cps)
        .max(MIN_FOOTAGE_TARGET_SECS);
    info!(
        job = %job_id,
        sentences = script.sentences.len(),
        target = footage_target,
        "script ready; acquiring footage and synthesizing narration"
    );

    // Acquiring and Synthesizing progress independently and join here.
    shared.set_stage(Stage::Acquiring);
    cancel.checkpoint().map_err(|e| fail(Stage::Acquiring, e))?;
    let fallback = script::fallback_terms(&request.topic);
    let (acquired, narrated) = tokio::join!(
        footage::acquire(
            &backends.clips,
            workspace,
            &script.search_terms,
            &fallback,
            footage_target,
            request.threads,
            cancel,
        ),
        speech::synthesize(
            backends.speech.as_ref(),
            workspace,
            &script.sentences,
            &request.voice,
            cancel,
        ),
    );
    let acquisition = acquired.map_err(|e| fail(Stage::Acquiring, e))?;
    let track = narrated.map_err(|e| fail(Stage::Synthesizing, e))?;

    // Shortfall policy: loop what we have; nothing at all is fatal.
    if acquisition.assets.is_empty() {
        return Err(fail(
            Stage::Acquiring,
            PipelineError::DurationShortfall {
                have: 0.0,
                need: footage_target,
            },
        ));
    }
    if let Some(missing) = acquisition.shortfall {
        warn!(
            job = %job_id,
            missing,
            "footage shortfall; looping available clips to cover narration"
        );
    }

    // Aligning
    shared.set_stage(Stage::Aligning);
    cancel.checkpoint().map_err(|e| fail(Stage::Aligning, e))?;
    let aligner = if config.use_alignment_service {
        backends.aligner.as_deref()
    } else {
        None
    };
    let cues = subtitle::align(aligner, &track, config.words_per_cue).await;

    // Composing
    shared.set_stage(Stage::Composing);
    cancel.checkpoint().map_err(|e| fail(Stage::Composing, e))?;
    let video = {
        let _render = shared.render_lock.lock().await;
        let bed = music::resolve(&backends.http, workspace, request, config).await;
        compose::compose(
            workspace,
            &acquisition.assets,
            &track,
            &cues,
            request,
            config,
            bed,
            cancel,
        )
        .await
        .map_err(|e| fail(Stage::Composing, e))?
    };

    // Publishing (optional)
    let remote_id = if request.upload_to_video_host {
        shared.set_stage(Stage::Publishing);
        cancel.checkpoint().map_err(|e| fail(Stage::Publishing, e))?;
        match &backends.host {
            Some(host) => Some(
                publish::publish(
                    host.as_ref(),
                    backends.text.as_ref(),
                    request,
                    &script,
                    &video,
                )
                .await
                .map_err(|e| fail(Stage::Publishing, e))?,
            ),
            None => {
                warn!(job = %job_id, "upload requested but no video host configured");
                None
            }
        }
    } else {
        None
    };

    Ok((video, remote_id))
}
