use crate::config::{Config, JobRequest};
use crate::error::StageResult;
use crate::workspace::TempWorkspace;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "ogg"];
const FETCH_TIMEOUT_SECS: u64 = 300;

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Download and unpack a zip of songs into the library directory. Skipped
/// when the library already has content.
pub async fn fetch_songs(client: &reqwest::Client, zip_url: &str, songs_dir: &Path) -> StageResult<()> {
    if pick_random_song(songs_dir).is_some() {
        return Ok(());
    }
    fs::create_dir_all(songs_dir).await?;

    info!(url = %zip_url, "fetching songs pack");
    let bytes = client
        .get(zip_url)
        .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
        .send()
        .await?
        .error_for_status()
        .map_err(crate::error::PipelineError::from)?
        .bytes()
        .await?;

    let zip_path = songs_dir.join("songs.zip");
    fs::write(&zip_path, &bytes).await?;

    let extract_dir = songs_dir.to_path_buf();
    let zip_for_task = zip_path.clone();
    tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
        let file = std::fs::File::open(&zip_for_task)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| std::io::Error::other(e.to_string()))?;
        let mut extracted = 0;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let name = PathBuf::from(entry.name());
            if !is_audio_file(&name) {
                continue;
            }
            let Some(file_name) = name.file_name() else {
                continue;
            };
            let mut out = std::fs::File::create(extract_dir.join(file_name))?;
            std::io::copy(&mut entry, &mut out)?;
            extracted += 1;
        }
        Ok(extracted)
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
    .map(|count| info!(count, "extracted songs"))?;

    let _ = fs::remove_file(&zip_path).await;
    Ok(())
}

/// Random pick from the songs library.
pub fn pick_random_song(songs_dir: &Path) -> Option<PathBuf> {
    let songs: Vec<PathBuf> = WalkDir::new(songs_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_audio_file(path))
        .collect();
    songs.choose(&mut rand::thread_rng()).cloned()
}

/// Resolve the music bed for a job: an explicit path or URL from the request
/// wins, otherwise a random library song. Music is an enhancement; any
/// resolution failure logs a warning and the job continues without a bed.
pub async fn resolve(
    client: &reqwest::Client,
    workspace: &TempWorkspace,
    request: &JobRequest,
    config: &Config,
) -> Option<PathBuf> {
    if !request.use_music {
        return None;
    }

    match &request.music_source {
        Some(source) if source.starts_with("http://") || source.starts_with("https://") => {
            let dest = workspace.file("music_bed");
            match download_music(client, source, &dest).await {
                Ok(()) => return Some(dest),
                Err(err) => warn!(source = %source, "music download failed ({err}); trying library"),
            }
        }
        Some(source) => {
            let path = PathBuf::from(source);
            if path.is_file() {
                return Some(path);
            }
            warn!(source = %source, "music source not found; trying library");
        }
        None => {}
    }

    let pick = pick_random_song(Path::new(&config.songs_dir));
    if pick.is_none() {
        warn!("music requested but no song available; rendering without music");
    }
    pick
}

async fn download_music(client: &reqwest::Client, url: &str, dest: &Path) -> StageResult<()> {
    let bytes = client
        .get(url)
        .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
        .send()
        .await?
        .error_for_status()
        .map_err(crate::error::PipelineError::from)?
        .bytes()
        .await?;
    fs::write(dest, &bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_extension_detection() {
        assert!(is_audio_file(Path::new("beat.mp3")));
        assert!(is_audio_file(Path::new("dir/beat.M4A")));
        assert!(!is_audio_file(Path::new("beat.txt")));
        assert!(!is_audio_file(Path::new("noext")));
    }

    #[tokio::test]
    async fn random_pick_finds_nested_songs() {
        let dir = tempfile::tempdir().expect("dir");
        assert!(pick_random_song(dir.path()).is_none());

        let nested = dir.path().join("pack");
        tokio::fs::create_dir_all(&nested).await.expect("nested");
        tokio::fs::write(nested.join("song.mp3"), b"audio")
            .await
            .expect("song");
        tokio::fs::write(dir.path().join("readme.txt"), b"text")
            .await
            .expect("readme");

        let pick = pick_random_song(dir.path()).expect("a song");
        assert!(pick.ends_with("song.mp3"));
    }
}
