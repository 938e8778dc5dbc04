use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use futures_util::{pin_mut, Stream, StreamExt};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;
use crate::config::ServiceConfig;

/// Extension given to staged uploads
const UPLOAD_EXTENSION: &str = "upload";
/// Extension given to encoder output
const OUTPUT_EXTENSION: &str = "webm";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("uploaded file is empty")]
    Empty,

    #[error("uploaded file exceeds the {} limit", human_size(.limit))]
    TooLarge { limit: u64 },

    #[error("upload stream failed: {0}")]
    Upload(String),

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn human_size(bytes: &u64) -> String {
    format_size(*bytes, DECIMAL)
}

impl StorageError {
    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file written to the inputs directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpload {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Owns the on-disk layout for job artifacts
#[derive(Debug, Clone)]
pub struct TempStorage {
    inputs_dir: PathBuf,
    outputs_dir: PathBuf,
    max_upload_bytes: u64,
}

impl TempStorage {
    pub fn new(cfg: &ServiceConfig) -> Self {
        Self {
            inputs_dir: cfg.inputs_dir(),
            outputs_dir: cfg.outputs_dir(),
            max_upload_bytes: cfg.max_upload_bytes,
        }
    }

    pub fn inputs_dir(&self) -> &Path {
        &self.inputs_dir
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    /// Create the artifact directories
    pub async fn prepare(&self) -> Result<(), StorageError> {
        for dir in [&self.inputs_dir, &self.outputs_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io("create directory", dir, e))?;
        }
        Ok(())
    }

    /// Write an upload stream to a fresh file, enforcing the size limit as bytes arrive.
    /// Nothing is left on disk when this returns an error.
    pub async fn stage<S, B, E>(&self, stream: S) -> Result<StagedUpload, StorageError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let path = self
            .inputs_dir
            .join(format!("{}.{}", Uuid::new_v4(), UPLOAD_EXTENSION));

        match self.write_limited(&path, stream).await {
            Ok(bytes) => {
                debug!("Staged upload {} ({})", path.display(), format_size(bytes, DECIMAL));
                Ok(StagedUpload { path, bytes })
            }
            Err(e) => {
                if let Err(cleanup) = self.release(&path).await {
                    warn!("Failed to remove rejected upload: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn write_limited<S, B, E>(&self, path: &Path, stream: S) -> Result<u64, StorageError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        pin_mut!(stream);

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| StorageError::io("create", path, e))?;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::Upload(e.to_string()))?;
            let data = chunk.as_ref();
            written += data.len() as u64;
            if written > self.max_upload_bytes {
                return Err(StorageError::TooLarge { limit: self.max_upload_bytes });
            }
            file.write_all(data)
                .await
                .map_err(|e| StorageError::io("write", path, e))?;
        }

        file.flush()
            .await
            .map_err(|e| StorageError::io("flush", path, e))?;

        if written == 0 {
            return Err(StorageError::Empty);
        }
        Ok(written)
    }

    /// Output location for a job
    pub fn output_path(&self, job_id: &str) -> PathBuf {
        self.outputs_dir.join(format!("{}.{}", job_id, OUTPUT_EXTENSION))
    }

    /// Reserve the output location for a job, clearing anything stale at that path
    pub async fn allocate_output(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        let path = self.output_path(job_id);
        self.release(&path).await?;
        Ok(path)
    }

    /// Delete one artifact. A file that is already gone counts as released.
    pub async fn release(&self, path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Released {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove", path, e)),
        }
    }

    /// Delete every file left in the artifact directories.
    /// Jobs do not survive a restart, so anything found here at startup is an orphan.
    pub fn purge_orphans(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        let mut reclaimed_bytes = 0;

        for root in [&self.inputs_dir, &self.outputs_dir] {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading directory entry: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        reclaimed_bytes += size;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::io("remove orphan", entry.path(), e)),
                }
            }
        }

        if removed > 0 {
            info!("🗑️  Removed {} orphaned artifact(s), reclaimed {}", removed, format_size(reclaimed_bytes, DECIMAL));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn storage(dir: &Path, limit: u64) -> TempStorage {
        let cfg = ServiceConfig {
            work_dir: dir.to_path_buf(),
            max_upload_bytes: limit,
            ..Default::default()
        };
        TempStorage::new(&cfg)
    }

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<&'static [u8], std::io::Error>> {
        stream::iter(parts.to_vec().into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_stage_writes_all_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1024);
        storage.prepare().await.unwrap();

        let staged = storage.stage(chunks(&[b"hello ", b"world"])).await.unwrap();
        assert_eq!(staged.bytes, 11);
        assert!(staged.path.starts_with(storage.inputs_dir()));
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_stage_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1024);
        storage.prepare().await.unwrap();

        let a = storage.stage(chunks(&[b"same"])).await.unwrap();
        let b = storage.stage(chunks(&[b"same"])).await.unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 8);
        storage.prepare().await.unwrap();

        let err = storage.stage(chunks(&[b"12345", b"67890"])).await.unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { limit: 8 }));
        assert_eq!(std::fs::read_dir(storage.inputs_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 8);
        storage.prepare().await.unwrap();

        let err = storage.stage(chunks(&[])).await.unwrap_err();
        assert!(matches!(err, StorageError::Empty));
        assert_eq!(std::fs::read_dir(storage.inputs_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stream_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1024);
        storage.prepare().await.unwrap();

        let parts: Vec<Result<&'static [u8], String>> = vec![Ok(&b"abc"[..]), Err("connection reset".to_string())];
        let err = storage.stage(stream::iter(parts)).await.unwrap_err();
        assert!(matches!(err, StorageError::Upload(ref msg) if msg == "connection reset"));
        assert_eq!(std::fs::read_dir(storage.inputs_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1024);
        storage.prepare().await.unwrap();

        let path = storage.allocate_output("job-1").await.unwrap();
        std::fs::write(&path, b"webm").unwrap();
        storage.release(&path).await.unwrap();
        storage.release(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_allocate_output_clears_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1024);
        storage.prepare().await.unwrap();

        std::fs::write(storage.output_path("job-2"), b"stale").unwrap();
        let path = storage.allocate_output("job-2").await.unwrap();
        assert_eq!(path, storage.outputs_dir().join("job-2.webm"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_purge_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1024);
        storage.prepare().await.unwrap();

        std::fs::write(storage.inputs_dir().join("a.upload"), b"a").unwrap();
        std::fs::write(storage.outputs_dir().join("b.webm"), b"b").unwrap();
        assert_eq!(storage.purge_orphans().unwrap(), 2);
        assert_eq!(storage.purge_orphans().unwrap(), 0);
        assert!(storage.inputs_dir().exists());
    }
}
