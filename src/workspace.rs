use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use axum::body::Bytes;
use futures::Stream;
use tempfile::TempDir;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::ApiError, extractor::OUTPUT_STEM};

const JOB_PREFIX: &str = "job-";

/// Removed with its contents on drop.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    pub fn create(root: &Path, request_id: Uuid) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{JOB_PREFIX}{}-", request_id.simple()))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn locate_output(&self) -> Result<PathBuf, ApiError> {
        let canonical_dir = tokio::fs::canonicalize(self.path()).await?;

        let preferred = self.path().join(format!("{OUTPUT_STEM}.mp3"));
        if let Some(path) = resolve_candidate(&canonical_dir, &preferred).await? {
            return Ok(path);
        }

        let prefix = format!("{OUTPUT_STEM}.");
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(self.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        for candidate in candidates {
            if let Some(path) = resolve_candidate(&canonical_dir, &candidate).await? {
                return Ok(path);
            }
        }

        Err(ApiError::internal("Downloaded file not found"))
    }

    pub async fn into_stream(self, path: &Path) -> std::io::Result<(WorkspaceFileStream, u64)> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();

        Ok((
            WorkspaceFileStream {
                inner: ReaderStream::new(file),
                _workspace: self,
            },
            length,
        ))
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        debug!("Removing job workspace {:?}", self.dir.path());
    }
}

pub struct WorkspaceFileStream {
    inner: ReaderStream<tokio::fs::File>,
    _workspace: JobWorkspace,
}

impl Stream for WorkspaceFileStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

async fn resolve_candidate(
    canonical_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ApiError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_dir) {
        warn!("Ignoring output outside the job workspace: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}

pub async fn prepare_root(root: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(root).await
}

pub async fn sweep_stale(root: &Path, max_age: Duration) {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open work directory for cleanup: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate work directory for cleanup: {error}");
                break;
            }
        };

        if !entry.file_name().to_string_lossy().starts_with(JOB_PREFIX) {
            continue;
        }

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age || !metadata.is_dir() {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!("Removed stale job workspace {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale job workspace {:?}: {error}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let workspace = JobWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("audio.mp3"), b"data").unwrap();

        assert!(path.starts_with(root.path()));
        assert!(path.is_dir());
        drop(workspace);
        assert!(!path.exists());
        assert!(is_empty(root.path()));
    }

    #[tokio::test]
    async fn mp3_output_is_preferred() {
        let root = tempfile::tempdir().unwrap();
        let workspace = JobWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        std::fs::write(workspace.path().join("audio.m4a"), b"m4a").unwrap();
        std::fs::write(workspace.path().join("audio.mp3"), b"mp3").unwrap();

        let found = workspace.locate_output().await.unwrap();
        assert_eq!(found.file_name().unwrap(), "audio.mp3");
    }

    #[tokio::test]
    async fn fallback_picks_lexically_first_audio_file() {
        let root = tempfile::tempdir().unwrap();
        let workspace = JobWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        std::fs::write(workspace.path().join("audio.webm"), b"webm").unwrap();
        std::fs::write(workspace.path().join("audio.m4a"), b"m4a").unwrap();
        std::fs::write(workspace.path().join("cover.jpg"), b"jpg").unwrap();
        std::fs::create_dir(workspace.path().join("audio.d")).unwrap();

        let found = workspace.locate_output().await.unwrap();
        assert_eq!(found.file_name().unwrap(), "audio.m4a");
    }

    #[tokio::test]
    async fn missing_output_is_an_internal_error() {
        let root = tempfile::tempdir().unwrap();
        let workspace = JobWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        std::fs::write(workspace.path().join("other.mp3"), b"mp3").unwrap();

        let error = workspace.locate_output().await.unwrap_err();
        assert_eq!(error.status, axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message(), "Downloaded file not found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_leaving_the_workspace_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, b"secret").unwrap();

        let workspace = JobWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        std::os::unix::fs::symlink(&secret, workspace.path().join("audio.mp3")).unwrap();

        assert!(workspace.locate_output().await.is_err());
    }

    #[tokio::test]
    async fn stream_owns_the_workspace() {
        let root = tempfile::tempdir().unwrap();
        let workspace = JobWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        let file = workspace.path().join("audio.mp3");
        std::fs::write(&file, b"ID3 audio bytes").unwrap();

        let (mut stream, length) = workspace.into_stream(&file).await.unwrap();
        assert_eq!(length, 15);
        assert!(file.exists());

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"ID3 audio bytes");

        drop(stream);
        assert!(is_empty(root.path()));
    }

    #[tokio::test]
    async fn sweep_removes_only_job_directories() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("job-leftover");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join("audio.mp3"), b"old").unwrap();
        std::fs::write(root.path().join("notes.txt"), b"keep").unwrap();

        sweep_stale(root.path(), Duration::from_secs(3600)).await;
        assert!(stale.exists());

        sweep_stale(root.path(), Duration::ZERO).await;
        assert!(!stale.exists());
        assert!(root.path().join("notes.txt").exists());
    }
}
