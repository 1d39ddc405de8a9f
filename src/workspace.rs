use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::info;

/// Job-scoped scratch directory holding all intermediate downloads and audio
/// files. Every intermediate artifact of a job lives inside it; it is removed
/// when the job reaches a terminal state unless the keep flag is set.
pub struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    pub async fn create(work_root: &Path) -> io::Result<Self> {
        fs::create_dir_all(work_root).await?;
        let dir = tempfile::Builder::new().prefix("job-").tempdir_in(work_root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Tear the workspace down, or persist it for inspection when `keep` is
    /// set. Returns the kept path in the latter case.
    pub fn cleanup(self, keep: bool) -> Option<PathBuf> {
        if keep {
            let path = self.dir.keep();
            info!(path = %path.display(), "keeping job workspace for debugging");
            Some(path)
        } else {
            // TempDir removes its contents on drop.
            drop(self.dir);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_removes_workspace_and_contents() {
        let root = tempfile::tempdir().expect("test root");
        let ws = TempWorkspace::create(root.path()).await.expect("workspace");
        let marker = ws.file("clip_1.mp4");
        tokio::fs::write(&marker, b"data").await.expect("write marker");
        let ws_path = ws.path().to_path_buf();

        assert!(ws.cleanup(false).is_none());
        assert!(!ws_path.exists());
    }

    #[tokio::test]
    async fn cleanup_can_keep_workspace() {
        let root = tempfile::tempdir().expect("test root");
        let ws = TempWorkspace::create(root.path()).await.expect("workspace");
        let kept = ws.cleanup(true).expect("kept path");
        assert!(kept.exists());
    }
}
