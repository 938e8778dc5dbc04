pub mod config;
pub mod error;
pub mod job;
pub mod registry;
pub mod storage;
pub mod ffprobe;
pub mod progress;
pub mod encoder;
pub mod sampler;
pub mod orchestrator;
pub mod sweeper;
pub mod service;
pub mod http;

#[cfg(test)]
mod test_support;

pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};
pub use job::{ConversionOptions, Job, JobStatus};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream};
pub use service::{JobService, JobStatusView};
