//! In-memory job registry.
//!
//! Each job lives in its own slot as an immutable `Arc<Job>` snapshot.
//! Updates are applied to a private copy and swapped in whole, so a reader
//! sees either the state before an update or after it and never waits for
//! the update closure to run. Slots also carry the delivery lock that makes
//! download and sweeper reclamation mutually exclusive for one id.

use std::path::PathBuf;
use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::error::{ServiceError, ServiceResult};
use crate::job::{ConversionOptions, Job, JobStatus};

struct JobSlot {
    /// Held only to read or replace the pointer
    snapshot: RwLock<Arc<Job>>,
    /// Serialises writers for the whole read-modify-swap
    writer: SyncMutex<()>,
    delivery: Arc<Mutex<()>>,
}

impl JobSlot {
    fn new(job: Job) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(job)),
            writer: SyncMutex::new(()),
            delivery: Arc::new(Mutex::new(())),
        })
    }

    fn load(&self) -> Arc<Job> {
        Arc::clone(&self.snapshot.read())
    }
}

/// Per-status job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub processing: usize,
    pub complete: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobSlot>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and insert a Processing record for it
    pub fn create(&self, options: ConversionOptions, input_path: PathBuf) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.jobs.entry(id.clone()) {
                slot.insert(JobSlot::new(Job::new(id.clone(), options, input_path)));
                return id;
            }
        }
    }

    /// Insert a record under an id chosen by the caller
    pub fn create_with_id(
        &self,
        id: &str,
        options: ConversionOptions,
        input_path: PathBuf,
    ) -> ServiceResult<String> {
        match self.jobs.entry(id.to_string()) {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!("job id {} is already in use", id))),
            Entry::Vacant(slot) => {
                slot.insert(JobSlot::new(Job::new(id.to_string(), options, input_path)));
                Ok(id.to_string())
            }
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<JobSlot>> {
        self.jobs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of a job
    pub fn get(&self, id: &str) -> Option<Job> {
        let slot = self.slot(id)?;
        let job = Job::clone(&slot.load());
        Some(job)
    }

    /// Apply an exclusive mutation. Only the job's own orchestration task calls this.
    pub fn update<F, R>(&self, id: &str, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let slot = self.slot(id)?;
        let _writer = slot.writer.lock();
        let mut job = Job::clone(&slot.load());
        let result = mutate(&mut job);
        *slot.snapshot.write() = Arc::new(job);
        Some(result)
    }

    /// Evict a record. Later reads of the id report not found.
    pub fn remove(&self, id: &str) -> Option<Job> {
        let (_, slot) = self.jobs.remove(id)?;
        let job = Job::clone(&slot.load());
        Some(job)
    }

    /// Lock guarding "check state, then serve or reclaim" for one job
    pub fn delivery_lock(&self, id: &str) -> Option<Arc<Mutex<()>>> {
        self.slot(id).map(|slot| Arc::clone(&slot.delivery))
    }

    pub fn list(&self) -> Vec<Job> {
        let slots: Vec<Arc<JobSlot>> = self.jobs.iter().map(|entry| Arc::clone(entry.value())).collect();
        slots.iter().map(|slot| Job::clone(&slot.load())).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.list() {
            match job.status {
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Complete => counts.complete += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
