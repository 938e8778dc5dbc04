//! Job API: submit, status, download, health and shutdown.
//!
//! This is the only entry point the HTTP layer talks to. Everything behind it
//! (registry, storage, orchestrator, sweeper) is wired together here.

use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use anyhow::{Context, Result};
use axum::body::Bytes;
use futures_util::Stream;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::fs::File;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::job::{validate_job_id, ConversionOptions, JobStatus};
use crate::orchestrator::Orchestrator;
use crate::registry::JobRegistry;
use crate::storage::{StagedUpload, StorageError, TempStorage};
use crate::sweeper::Sweeper;

/// Client-facing view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
}

/// How long a download waits for a delivery lock it does not get at once.
/// The sweeper holds it only while deleting two files; a download holds it
/// for the whole transfer.
const DELIVERY_LOCK_WAIT: Duration = Duration::from_secs(2);

/// A finished output ready to be streamed to the client
pub struct OutputDelivery {
    pub job_id: String,
    pub content_length: u64,
    pub detected_color: Option<String>,
    pub stream: DeliveryStream,
}

/// Streams an output file while holding the job's delivery lock.
///
/// Once every byte has been read the job record is removed and the file
/// released when the stream is dropped. A stream dropped early leaves the
/// job untouched so the client can retry.
pub struct DeliveryStream {
    inner: ReaderStream<File>,
    sent: u64,
    expected: u64,
    finish: Option<DeliveryFinish>,
    _guard: OwnedMutexGuard<()>,
}

struct DeliveryFinish {
    job_id: String,
    output_path: PathBuf,
    registry: Arc<JobRegistry>,
    storage: TempStorage,
    tracker: TaskTracker,
}

impl DeliveryFinish {
    fn run(self) {
        self.registry.remove(&self.job_id);
        info!("📦 Job {} delivered", self.job_id);
        let storage = self.storage;
        let path = self.output_path;
        self.tracker.spawn(async move {
            if let Err(e) = storage.release(&path).await {
                warn!("Failed to release delivered output: {}", e);
            }
        });
    }
}

impl DeliveryStream {
    /// Bytes handed out so far
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Stream for DeliveryStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        // Runs before `_guard` is released
        if self.sent >= self.expected {
            if let Some(finish) = self.finish.take() {
                finish.run();
            }
        } else {
            debug!("Delivery interrupted after {} of {} bytes", self.sent, self.expected);
        }
    }
}

pub struct JobService {
    config: Arc<ServiceConfig>,
    registry: Arc<JobRegistry>,
    storage: TempStorage,
    orchestrator: Arc<Orchestrator>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl JobService {
    /// Wire up the service. `concurrency` is the encoder cap after auto-detection.
    pub fn new(config: ServiceConfig, concurrency: usize) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(JobRegistry::new());
        let storage = TempStorage::new(&config);
        let shutdown = CancellationToken::new();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            storage.clone(),
            concurrency,
            shutdown.clone(),
        ));

        Self {
            config,
            registry,
            storage,
            orchestrator,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create the artifact directories and remove leftovers from a previous run
    pub async fn prepare(&self) -> Result<()> {
        self.storage
            .prepare()
            .await
            .context("Failed to create artifact directories")?;
        let removed = self
            .storage
            .purge_orphans()
            .context("Failed to remove orphaned artifacts")?;
        info!(
            "Artifact directories ready under {} ({} orphan(s) removed, {} encoder slot(s))",
            self.config.work_dir.display(),
            removed,
            self.orchestrator.concurrency()
        );
        Ok(())
    }

    /// Write an upload to the inputs directory
    pub async fn stage_upload<S, B, E>(&self, stream: S) -> ServiceResult<StagedUpload>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        Ok(self.storage.stage(stream).await?)
    }

    /// Remove a staged upload that will not become a job
    pub async fn discard_upload(&self, staged: &StagedUpload) {
        if let Err(e) = self.storage.release(&staged.path).await {
            warn!("Failed to discard staged upload: {}", e);
        }
    }

    /// Validate, stage and start a conversion. Returns without waiting for the encoder.
    pub async fn submit<S, B, E>(
        &self,
        stream: S,
        options: ConversionOptions,
        requested_id: Option<&str>,
    ) -> ServiceResult<String>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        options.validate()?;
        if let Some(raw) = requested_id {
            validate_job_id(raw)?;
        }
        let staged = self.stage_upload(stream).await?;
        self.submit_staged(staged, options, requested_id).await
    }

    /// Start a conversion for an upload that is already on disk.
    /// The staged file is removed if the submission is rejected.
    pub async fn submit_staged(
        &self,
        staged: StagedUpload,
        options: ConversionOptions,
        requested_id: Option<&str>,
    ) -> ServiceResult<String> {
        let created = options.validate().and_then(|_| match requested_id {
            Some(raw) => {
                let id = validate_job_id(raw)?;
                self.registry.create_with_id(&id, options.clone(), staged.path.clone())
            }
            None => Ok(self.registry.create(options.clone(), staged.path.clone())),
        });

        let id = match created {
            Ok(id) => id,
            Err(e) => {
                self.discard_upload(&staged).await;
                return Err(e);
            }
        };

        info!(
            "📥 Job {} accepted ({} bytes, crf {}, audio {}, detect_green {})",
            id, staged.bytes, options.crf, options.audio_bitrate, options.detect_green
        );
        self.orchestrator.spawn(&self.tracker, id.clone());
        Ok(id)
    }

    pub fn status(&self, id: &str) -> ServiceResult<JobStatusView> {
        let job = self.registry.get(id).ok_or_else(|| ServiceError::not_found(id))?;
        Ok(JobStatusView {
            status: job.status,
            progress: job.progress,
            detected_color: job.detected_color,
            error: job.error,
        })
    }

    /// Open the output of a Complete job for streaming.
    /// Fails with NotReady for any other state and never returns partial output.
    pub async fn fetch_output(&self, id: &str) -> ServiceResult<OutputDelivery> {
        let lock = self
            .registry
            .delivery_lock(id)
            .ok_or_else(|| ServiceError::not_found(id))?;
        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => tokio::time::timeout(DELIVERY_LOCK_WAIT, lock.lock_owned())
                .await
                .map_err(|_| ServiceError::Conflict(format!("job {} is already being delivered", id)))?,
        };

        // Re-read under the lock; the sweeper may have reclaimed it meanwhile
        let job = self.registry.get(id).ok_or_else(|| ServiceError::not_found(id))?;
        if job.status != JobStatus::Complete {
            return Err(ServiceError::NotReady {
                id: job.id,
                status: job.status,
                progress: job.progress,
                error: job.error,
            });
        }
        let output_path = job
            .output_path
            .ok_or_else(|| ServiceError::Internal(format!("job {} is complete but has no output", id)))?;

        let file = File::open(&output_path)
            .await
            .map_err(|e| StorageError::io("open", &output_path, e))?;
        let content_length = file
            .metadata()
            .await
            .map_err(|e| StorageError::io("stat", &output_path, e))?
            .len();

        Ok(OutputDelivery {
            job_id: job.id.clone(),
            content_length,
            detected_color: job.detected_color,
            stream: DeliveryStream {
                inner: ReaderStream::new(file),
                sent: 0,
                expected: content_length,
                finish: Some(DeliveryFinish {
                    job_id: job.id,
                    output_path,
                    registry: Arc::clone(&self.registry),
                    storage: self.storage.clone(),
                    tracker: self.tracker.clone(),
                }),
                _guard: guard,
            },
        })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Start the background sweeper. It stops when shutdown begins.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = Sweeper::new(
            Arc::clone(&self.registry),
            self.storage.clone(),
            Duration::from_secs(self.config.retention_secs),
            Duration::from_secs(self.config.sweep_interval_secs),
            self.shutdown.clone(),
        );
        tokio::spawn(sweeper.run())
    }

    /// Stop every running job, wait for their tasks and delete all artifacts
    pub async fn shutdown(&self) {
        let counts = self.registry.counts();
        info!(
            "Shutting down: {} processing, {} complete, {} failed",
            counts.processing, counts.complete, counts.failed
        );

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        for job in self.registry.list() {
            for path in std::iter::once(&job.input_path).chain(job.output_path.iter()) {
                if let Err(e) = self.storage.release(path).await {
                    warn!("Failed to remove artifact during shutdown: {}", e);
                }
            }
            self.registry.remove(&job.id);
        }
        info!("Shutdown complete");
    }
}
