use crate::config::{Config, JobRequest};
use crate::error::{PipelineError, StageResult};
use crate::ffmpeg;
use crate::footage::FootageAsset;
use crate::pipeline::CancelFlag;
use crate::speech::NarrationTrack;
use crate::subtitle::{self, SubtitleCue};
use crate::workspace::TempWorkspace;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const OUTPUT_WIDTH: u32 = 1080;
pub const OUTPUT_HEIGHT: u32 = 1920;
pub const FRAME_RATE: u32 = 30;
const MAX_LOOP_ENTRIES: usize = 500;

/// The pipeline's terminal artifact.
#[derive(Debug, Clone)]
pub struct RenderedVideo {
    pub path: PathBuf,
    pub duration: f64,
}

/// Cycle clip indices until the covered duration reaches `need`. Bounded so a
/// pathological duration set cannot grow the concat list without limit.
pub fn build_loop_plan(durations: &[f64], need: f64) -> Vec<usize> {
    let usable: Vec<(usize, f64)> = durations
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, d)| *d > 0.0)
        .collect();
    if usable.is_empty() {
        return Vec::new();
    }

    let mut plan = Vec::new();
    let mut covered = 0.0;
    let mut i = 0;
    while covered + 1e-3 < need && plan.len() < MAX_LOOP_ENTRIES {
        let (idx, d) = usable[i % usable.len()];
        plan.push(idx);
        covered += d;
        i += 1;
    }
    if plan.is_empty() {
        plan.push(usable[0].0);
    }
    plan
}

fn output_file_name(topic: &str) -> String {
    let slug: String = topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|p| !p.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-");
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    if slug.is_empty() {
        format!("short-{stamp}.mp4")
    } else {
        format!("{slug}-{stamp}.mp4")
    }
}

async fn move_into_output(rendered: &Path, output_dir: &Path, name: &str) -> StageResult<PathBuf> {
    fs::create_dir_all(output_dir).await?;
    let dest = output_dir.join(name);
    if fs::rename(rendered, &dest).await.is_err() {
        // Workspace and output dir can sit on different filesystems.
        fs::copy(rendered, &dest).await?;
        let _ = fs::remove_file(rendered).await;
    }
    Ok(dest)
}

/// Assemble the final video: loop/trim footage to the narration duration,
/// center-crop to the portrait frame, burn subtitle cues, mix the optional
/// music bed, and mux one output file. The heaviest stage of the pipeline;
/// runs exactly once per job under the orchestrator's render lock.
pub async fn compose(
    workspace: &TempWorkspace,
    assets: &[FootageAsset],
    track: &NarrationTrack,
    cues: &[SubtitleCue],
    request: &JobRequest,
    config: &Config,
    music: Option<PathBuf>,
    cancel: &CancelFlag,
) -> StageResult<RenderedVideo> {
    cancel.checkpoint()?;

    // Normalize each clip to the target frame; unreadable assets are skipped
    // and substituted by the rest of the pool.
    let mut normalized: Vec<(PathBuf, f64)> = Vec::new();
    for (i, asset) in assets.iter().enumerate() {
        cancel.checkpoint()?;
        let out = workspace.file(&format!("norm_{i:02}.mp4"));
        match ffmpeg::normalize_clip(&asset.path, OUTPUT_WIDTH, OUTPUT_HEIGHT, FRAME_RATE, &out).await
        {
            Ok(()) => normalized.push((out, asset.duration)),
            Err(err) => warn!(source = %asset.source_id, "skipping unreadable asset: {err}"),
        }
    }
    if normalized.is_empty() {
        return Err(PipelineError::AssetUnreadable(
            "no footage asset could be decoded".into(),
        ));
    }

    // Visual track: cycle the normalized clips to cover the narration, then
    // trim to its exact duration.
    let durations: Vec<f64> = normalized.iter().map(|(_, d)| *d).collect();
    let plan = build_loop_plan(&durations, track.total_duration);
    info!(
        clips = normalized.len(),
        entries = plan.len(),
        "visual loop plan built"
    );

    let list = workspace.file("visual_list.txt");
    let entries: Vec<&Path> = plan.iter().map(|&i| normalized[i].0.as_path()).collect();
    ffmpeg::write_concat_list(&list, &entries).await?;

    cancel.checkpoint()?;
    let visual = workspace.file("visual.mp4");
    ffmpeg::concat_videos(&list, track.total_duration, &visual).await?;

    // Burned-in subtitles.
    cancel.checkpoint()?;
    let srt = workspace.file("subtitles.srt");
    fs::write(&srt, subtitle::render_srt(cues)).await?;
    let style = subtitle::force_style(request.subtitles_position, &request.subtitles_color);
    let burned = workspace.file("visual_subbed.mp4");
    ffmpeg::burn_subtitles(&visual, &srt, &style, &burned).await?;

    // Narration concat, in segment order. The segment bookkeeping stays
    // authoritative for timing; this only materializes the audio.
    cancel.checkpoint()?;
    let audio_list = workspace.file("narration_list.txt");
    let audio_entries: Vec<&Path> = track.segments.iter().map(|s| s.path.as_path()).collect();
    ffmpeg::write_concat_list(&audio_list, &audio_entries).await?;
    let narration = workspace.file("narration.mp3");
    ffmpeg::concat_audio(&audio_list, &narration).await?;

    // Final audio: plain narration, or narration over a looped music bed.
    let final_audio = match music {
        Some(bed) => {
            let looped = workspace.file("music_loop.m4a");
            let mixed = workspace.file("audio_mixed.m4a");
            let result = async {
                ffmpeg::loop_audio(&bed, track.total_duration, &looped).await?;
                ffmpeg::mix_music(&narration, &looped, &mixed).await
            }
            .await;
            match result {
                Ok(()) => mixed,
                Err(err) => {
                    warn!("music mix failed ({err}); rendering narration-only");
                    narration.clone()
                }
            }
        }
        None => narration.clone(),
    };

    cancel.checkpoint()?;
    let rendered = workspace.file("render.mp4");
    ffmpeg::mux_audio_video(&burned, &final_audio, track.total_duration, &rendered).await?;

    let duration = ffmpeg::ffprobe_duration_seconds(&rendered)
        .await
        .map_err(|err| PipelineError::EncodingFailure(format!("render not probeable: {err}")))?;
    let frame = 1.0 / f64::from(FRAME_RATE);
    if (duration - track.total_duration).abs() > frame * 2.0 {
        warn!(
            rendered = duration,
            narration = track.total_duration,
            "output duration drifted from narration"
        );
    }

    // The move out of the workspace is the last step, so a cancelled or
    // failed job never leaves a partial file in the output directory.
    cancel.checkpoint()?;
    let dest = move_into_output(
        &rendered,
        Path::new(&config.output_dir),
        &output_file_name(&request.topic),
    )
    .await?;

    info!(path = %dest.display(), duration, "render complete");
    Ok(RenderedVideo {
        path: dest,
        duration,
    })
}
