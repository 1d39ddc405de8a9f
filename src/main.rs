use anyhow::{Context, Result};
use std::sync::Arc;
use topic_shorts::api::elevenlabs::ElevenLabsClient;
use topic_shorts::api::openai::OpenAiClient;
use topic_shorts::api::pexels::PexelsClient;
use topic_shorts::api::whisper::WhisperClient;
use topic_shorts::api::youtube::YouTubeClient;
use topic_shorts::api::{AlignmentBackend, VideoHost};
use topic_shorts::config::{Config, JobRequest};
use topic_shorts::init;
use topic_shorts::music;
use topic_shorts::pipeline::{Backends, JobManager, JobStatus};

fn parse_request(args: &[String]) -> Result<JobRequest> {
    if args.is_empty() {
        anyhow::bail!("usage: topic-shorts <topic words...> | topic-shorts <request.json>");
    }

    if args.len() == 1 && args[0].ends_with(".json") {
        let raw = std::fs::read_to_string(&args[0])
            .with_context(|| format!("Failed to read request file: {}", args[0]))?;
        let request: JobRequest =
            serde_json::from_str(&raw).context("Failed to parse request file")?;
        return Ok(request);
    }

    Ok(JobRequest::for_topic(args.join(" ")))
}

fn build_backends(config: &Config) -> Arc<Backends> {
    let http = reqwest::Client::new();

    let aligner: Option<Arc<dyn AlignmentBackend>> = if config.use_alignment_service {
        Some(Arc::new(WhisperClient::new(
            http.clone(),
            config.openai_key.clone(),
        )))
    } else {
        None
    };

    let host: Option<Arc<dyn VideoHost>> = if config.youtube_token.is_empty() {
        None
    } else {
        Some(Arc::new(YouTubeClient::new(
            http.clone(),
            config.youtube_token.clone(),
        )))
    };

    Arc::new(Backends {
        text: Arc::new(OpenAiClient::new(http.clone(), config.openai_key.clone())),
        clips: Arc::new(PexelsClient::new(http.clone(), config.pexels_key.clone())),
        speech: Arc::new(ElevenLabsClient::new(
            http.clone(),
            config.elevenlabs_key.clone(),
        )),
        aligner,
        host,
        http,
    })
}

fn report(status: &JobStatus) -> i32 {
    match status {
        JobStatus::Completed {
            output,
            duration,
            remote_id,
        } => {
            println!("Completed: {} ({duration:.2}s)", output.display());
            if let Some(remote) = remote_id {
                println!("Uploaded as: {remote}");
            }
            0
        }
        JobStatus::Failed {
            stage,
            kind,
            message,
        } => {
            eprintln!("Failed during {stage} ({kind}): {message}");
            1
        }
        JobStatus::Cancelled => {
            println!("Cancelled.");
            2
        }
        JobStatus::Running { stage } => {
            eprintln!("Job still running in {stage}?");
            1
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::load("config.json").await?);
    init::ensure_directories(&config).await?;

    if !init::check_ffmpeg().await {
        eprintln!("[WARNING] ffmpeg/ffprobe not found in PATH. Please install FFmpeg.");
    }

    let backends = build_backends(&config);

    if let Some(zip_url) = &config.songs_zip_url {
        if let Err(err) =
            music::fetch_songs(&backends.http, zip_url, std::path::Path::new(&config.songs_dir))
                .await
        {
            eprintln!("[WARNING] songs pack fetch failed: {err}");
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = parse_request(&args)?;

    let manager = JobManager::new(Arc::clone(&config), backends);
    let job_id = manager.start(request)?;
    println!("Started job {job_id}");

    let status = tokio::select! {
        status = manager.wait(&job_id) => status,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancellation requested; waiting for the job to stop...");
            manager.cancel(&job_id);
            manager.wait(&job_id).await
        }
    };

    let code = match status {
        Some(status) => report(&status),
        None => 1,
    };
    std::process::exit(code);
}
