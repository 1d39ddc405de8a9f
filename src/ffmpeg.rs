use crate::error::{PipelineError, StageResult};
use std::path::Path;
use tokio::fs;
use tokio::process::Command;

async fn run_cmd(args: &[String]) -> StageResult<()> {
    if args.is_empty() {
        return Ok(());
    }

    let mut cmd = Command::new(&args[0]);
    if args.len() > 1 {
        cmd.args(&args[1..]);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| PipelineError::EncodingFailure(format!("{} spawn failed: {e}", args[0])))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .chars()
            .rev()
            .take(400)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        return Err(PipelineError::EncodingFailure(format!(
            "{} exited with {}: {}",
            args[0],
            output.status,
            tail.trim()
        )));
    }

    Ok(())
}

fn base_args() -> Vec<String> {
    vec![
        "ffmpeg".to_string(),
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ]
}

pub async fn ffprobe_duration_seconds(path: &Path) -> StageResult<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| PipelineError::EncodingFailure(format!("ffprobe spawn failed: {e}")))?;

    if !output.status.success() {
        return Err(PipelineError::AssetUnreadable(path.display().to_string()));
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let duration = text.parse::<f64>().unwrap_or(-1.0);
    if duration <= 0.0 {
        return Err(PipelineError::AssetUnreadable(path.display().to_string()));
    }
    Ok(duration)
}

/// Write a concat-demuxer list file. Entries are absolute paths with single
/// quotes escaped for the demuxer's quoting rules.
pub async fn write_concat_list(list_path: &Path, entries: &[&Path]) -> StageResult<()> {
    let mut body = String::new();
    for entry in entries {
        let escaped = entry.display().to_string().replace('\'', r"'\''");
        body.push_str(&format!("file '{escaped}'\n"));
    }
    fs::write(list_path, body).await?;
    Ok(())
}

/// Re-encode a clip to the target portrait frame: scale to cover, then
/// center-crop. Never stretches; audio is stripped.
pub async fn normalize_clip(
    input: &Path,
    width: u32,
    height: u32,
    fps: u32,
    out: &Path,
) -> StageResult<()> {
    let filter = format!(
        "scale={width}:{height}:force_original_aspect_ratio=increase,crop={width}:{height},setsar=1,fps={fps}"
    );

    let mut args = base_args();
    args.extend([
        "-i".to_string(),
        input.display().to_string(),
        "-vf".to_string(),
        filter,
        "-an".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "22".to_string(),
        out.display().to_string(),
    ]);

    run_cmd(&args).await?;
    if !out.exists() {
        return Err(PipelineError::EncodingFailure(format!(
            "normalize produced no output: {}",
            out.display()
        )));
    }
    Ok(())
}

/// Concatenate pre-normalized clips and trim the result to exactly `dur`
/// seconds.
pub async fn concat_videos(list_txt: &Path, dur: f64, out: &Path) -> StageResult<()> {
    let mut args = base_args();
    args.extend([
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_txt.display().to_string(),
        "-t".to_string(),
        format!("{dur:.3}"),
        "-an".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "22".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args).await
}

/// Concatenate same-codec audio segments without re-encoding.
pub async fn concat_audio(list_txt: &Path, out: &Path) -> StageResult<()> {
    let mut args = base_args();
    args.extend([
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_txt.display().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args).await
}

fn escape_filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Burn subtitle cues into the visual track from an SRT file, styled via
/// libass force_style.
pub async fn burn_subtitles(
    video_in: &Path,
    srt: &Path,
    force_style: &str,
    out: &Path,
) -> StageResult<()> {
    let filter = format!(
        "subtitles={}:force_style='{}'",
        escape_filter_path(srt),
        force_style
    );

    let mut args = base_args();
    args.extend([
        "-i".to_string(),
        video_in.display().to_string(),
        "-vf".to_string(),
        filter,
        "-an".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "22".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args).await
}

/// Loop an audio bed until it covers `dur` seconds.
pub async fn loop_audio(input: &Path, dur: f64, out: &Path) -> StageResult<()> {
    let mut args = base_args();
    args.extend([
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-t".to_string(),
        format!("{dur:.3}"),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args).await
}

/// Mix a music bed under the narration at a fixed attenuation. The limiter
/// keeps the summed signal from clipping.
pub async fn mix_music(narration: &Path, music: &Path, out: &Path) -> StageResult<()> {
    let mut args = base_args();
    args.extend([
        "-i".to_string(),
        narration.display().to_string(),
        "-i".to_string(),
        music.display().to_string(),
        "-filter_complex".to_string(),
        "[0:a]volume=1.0[a0];[1:a]volume=0.15[a1];[a0][a1]amix=inputs=2:duration=first:dropout_transition=2,alimiter=limit=0.95[a]"
            .to_string(),
        "-map".to_string(),
        "[a]".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args).await
}

/// Mux the burned visual track with the final audio, trimmed to `dur`.
pub async fn mux_audio_video(
    video_in: &Path,
    audio_in: &Path,
    dur: f64,
    out: &Path,
) -> StageResult<()> {
    let mut args = base_args();
    args.extend([
        "-i".to_string(),
        video_in.display().to_string(),
        "-i".to_string(),
        audio_in.display().to_string(),
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        "1:a".to_string(),
        "-t".to_string(),
        format!("{dur:.3}"),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn filter_paths_are_escaped() {
        let path = PathBuf::from("/tmp/a:b's.srt");
        let escaped = escape_filter_path(&path);
        assert_eq!(escaped, "/tmp/a\\:b\\'s.srt");
    }

    #[tokio::test]
    async fn concat_list_quotes_entries() {
        let dir = tempfile::tempdir().expect("dir");
        let list = dir.path().join("list.txt");
        let a = PathBuf::from("/tmp/norm_00.mp4");
        let b = PathBuf::from("/tmp/it's.mp4");
        write_concat_list(&list, &[&a, &b]).await.expect("write");

        let body = tokio::fs::read_to_string(&list).await.expect("read");
        assert!(body.contains("file '/tmp/norm_00.mp4'"));
        assert!(body.contains(r"file '/tmp/it'\''s.mp4'"));
    }
}
