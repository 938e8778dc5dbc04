use std::path::{Path, PathBuf};
use std::sync::Arc;
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use crate::config::ServiceConfig;
use crate::encoder::{truncate_diagnostic, CommandBuilder, EncodeError, Encoder, EncodingParams};
use crate::ffprobe;
use crate::job::ConversionOptions;
use crate::registry::JobRegistry;
use crate::sampler::ColorSampler;
use crate::storage::TempStorage;

/// Diagnostic recorded when a conversion task panics
pub const INTERNAL_DIAGNOSTIC: &str = "internal error during conversion";

/// Drives each job from staged input to a terminal state
pub struct Orchestrator {
    config: Arc<ServiceConfig>,
    registry: Arc<JobRegistry>,
    storage: TempStorage,
    encoder: Encoder,
    sampler: ColorSampler,
    permits: Semaphore,
    concurrency: usize,
    shutdown: CancellationToken,
    /// Makes the conversion task panic once a job has started
    #[cfg(test)]
    panic_after_start: std::sync::atomic::AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ServiceConfig>,
        registry: Arc<JobRegistry>,
        storage: TempStorage,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            encoder: Encoder::new(&config),
            sampler: ColorSampler::new(&config),
            permits: Semaphore::new(concurrency),
            concurrency,
            config,
            registry,
            storage,
            shutdown,
            #[cfg(test)]
            panic_after_start: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Maximum number of encoders running at once
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start converting a registered job. Returns immediately.
    pub fn spawn(self: &Arc<Self>, tracker: &TaskTracker, id: String) {
        let this = Arc::clone(self);
        tracker.spawn(async move { this.supervise(id).await });
    }

    /// Run the conversion in its own task so a panic is observed here
    /// instead of leaving the job stuck in Processing.
    async fn supervise(self: Arc<Self>, id: String) {
        let worker = Arc::clone(&self);
        let job_id = id.clone();
        let handle = tokio::spawn(async move { worker.process(&job_id).await });

        if let Err(e) = handle.await {
            error!("❌ Conversion task for job {} aborted: {}", id, e);
            if let Some(job) = self.registry.get(&id) {
                self.release_quietly(&job.input_path).await;
            }
            self.release_quietly(&self.storage.output_path(&id)).await;
            self.registry.update(&id, |job| job.fail(INTERNAL_DIAGNOSTIC));
        }
    }

    async fn process(&self, id: &str) {
        let Some(job) = self.registry.get(id) else {
            warn!("Job {} vanished before conversion started", id);
            return;
        };
        let input = job.input_path.clone();

        // The slot is held until the job is terminal
        let permit = tokio::select! {
            permit = self.permits.acquire() => permit.ok(),
            _ = self.shutdown.cancelled() => None,
        };
        let result = if permit.is_some() {
            self.registry.update(id, |job| job.mark_started());
            #[cfg(test)]
            self.inject_fault();
            self.convert(id, &job.options, &input).await
        } else {
            Err(EncodeError::Cancelled)
        };
        self.release_quietly(&input).await;

        match result {
            Ok(output) => {
                self.registry.update(id, |job| job.complete(output));
                info!("✅ Job {} complete", id);
            }
            Err(e) => {
                self.release_quietly(&self.storage.output_path(id)).await;
                let diagnostic = truncate_diagnostic(&e.to_string(), self.config.max_diagnostic_bytes);
                warn!("❌ Job {} failed: {}", id, diagnostic);
                self.registry.update(id, |job| job.fail(diagnostic));
            }
        }
        drop(permit);
    }

    async fn convert(&self, id: &str, options: &ConversionOptions, input: &Path) -> Result<PathBuf, EncodeError> {
        let probe = tokio::select! {
            probe = ffprobe::probe_file(&self.config, input) => {
                probe.map_err(|e| EncodeError::Probe(format!("{:#}", e)))?
            }
            _ = self.shutdown.cancelled() => return Err(EncodeError::Cancelled),
        };
        let duration = probe.duration_secs();
        if duration.is_none() {
            warn!("Job {}: input duration unknown, progress stays at 0 until completion", id);
        }

        if options.detect_green {
            let sampled = tokio::select! {
                color = self.sampler.sample_best_effort(input, &probe) => color,
                _ = self.shutdown.cancelled() => return Err(EncodeError::Cancelled),
            };
            if let Some(color) = sampled {
                info!("🎨 Job {}: detected background {}", id, color);
                self.registry.update(id, |job| job.set_detected_color(color));
            }
        }

        let output = self.storage.allocate_output(id).await?;
        let params = EncodingParams::from_options(options, &self.config);
        let args = CommandBuilder::new().build_encode_command(input, &output, &params);

        info!("🎬 Job {}: encoding (crf {}, audio {})", id, params.crf, params.audio_bitrate);
        let size = self
            .encoder
            .run(args, duration, &output, &self.shutdown, |percent| {
                self.registry.update(id, |job| job.set_progress(percent));
            })
            .await?;

        info!("Job {}: wrote {}", id, format_size(size, DECIMAL));
        Ok(output)
    }

    #[cfg(test)]
    fn inject_fault(&self) {
        if self.panic_after_start.load(std::sync::atomic::Ordering::SeqCst) {
            panic!("conversion fault");
        }
    }

    async fn release_quietly(&self, path: &Path) {
        if let Err(e) = self.storage.release(path).await {
            warn!("Failed to release artifact: {}", e);
        }
    }
}
