use crate::api::{with_retries, TextGenerator, VideoHost};
use crate::compose::RenderedVideo;
use crate::config::JobRequest;
use crate::error::StageResult;
use crate::script::{self, Script};
use tracing::{info, warn};

const UPLOAD_ATTEMPTS: u32 = 3;
pub const DEFAULT_VISIBILITY: &str = "private";

/// Hand the rendered file to the hosting platform with metadata derived from
/// the script. Transient upload failures retry a bounded number of times;
/// authentication failures surface immediately so the caller can
/// re-authenticate out of band.
pub async fn publish(
    host: &dyn VideoHost,
    text_gen: &dyn TextGenerator,
    request: &JobRequest,
    script: &Script,
    video: &RenderedVideo,
) -> StageResult<String> {
    let (title, description) = match script::generate_metadata(text_gen, request, script).await {
        Ok(meta) => meta,
        Err(err) => {
            // Metadata is cosmetic; fall back to the topic rather than
            // failing an otherwise finished video.
            warn!("metadata generation failed ({err}); using topic as title");
            (request.topic.clone(), script.full_text())
        }
    };

    let remote_id = with_retries("video upload", UPLOAD_ATTEMPTS, || {
        host.upload(&video.path, &title, &description, DEFAULT_VISIBILITY)
    })
    .await?;

    info!(remote_id = %remote_id, "video published");
    Ok(remote_id)
}
