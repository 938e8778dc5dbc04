use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::registry::JobRegistry;
use crate::storage::TempStorage;

/// Periodically reclaims artifacts and records of finished jobs
pub struct Sweeper {
    registry: Arc<JobRegistry>,
    storage: TempStorage,
    retention: chrono::Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub fn new(
        registry: Arc<JobRegistry>,
        storage: TempStorage,
        retention: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            storage,
            retention: chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            interval: interval.max(Duration::from_millis(10)),
            shutdown,
        }
    }

    /// Sweep on every tick until shutdown
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing can be expired yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reclaimed = self.sweep_once(Utc::now()).await;
                    if reclaimed > 0 {
                        info!("🧹 Sweeper reclaimed {} job(s), {} remaining", reclaimed, self.registry.len());
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!("Sweeper stopping");
                    break;
                }
            }
        }
    }

    /// Reclaim every terminal job created before `now - retention`.
    /// Jobs still Processing or currently being downloaded are left alone.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut reclaimed = 0;

        for job in self.registry.list() {
            if !job.is_terminal() || job.created_at >= cutoff {
                continue;
            }

            let Some(lock) = self.registry.delivery_lock(&job.id) else {
                continue;
            };
            let Ok(_guard) = lock.try_lock_owned() else {
                debug!("Job {} is being delivered, skipping this round", job.id);
                continue;
            };

            // The record may have been delivered and removed since the listing
            let Some(current) = self.registry.get(&job.id) else {
                continue;
            };

            let mut released = true;
            for path in std::iter::once(&current.input_path).chain(current.output_path.iter()) {
                if let Err(e) = self.storage.release(path).await {
                    warn!("Failed to reclaim artifact for job {}: {}", current.id, e);
                    released = false;
                }
            }
            if !released {
                continue;
            }

            self.registry.remove(&current.id);
            reclaimed += 1;
            debug!("Reclaimed {} job {}", current.status.as_str(), current.id);
        }

        reclaimed
    }
}
