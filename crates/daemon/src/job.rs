use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{ServiceError, ServiceResult};

/// Lowest accepted VP9 quality factor
pub const MIN_CRF: u8 = 0;
/// Highest accepted VP9 quality factor
pub const MAX_CRF: u8 = 63;
/// Opus accepts 6k..=510k
pub const MIN_AUDIO_KBPS: u32 = 6;
pub const MAX_AUDIO_KBPS: u32 = 510;
/// Longest job id accepted from the routing layer
pub const MAX_JOB_ID_LEN: usize = 64;

/// Lifecycle state of a conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

/// Conversion parameters captured when the job is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// VP9 constant-quality factor (lower = better quality, larger file)
    pub crf: u8,
    /// Opus bitrate token, e.g. "128k"
    pub audio_bitrate: String,
    /// Sample the source corners for a chroma-key color
    pub detect_green: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            crf: 30,
            audio_bitrate: "128k".to_string(),
            detect_green: false,
        }
    }
}

impl ConversionOptions {
    /// Build options from raw form values. Absent or blank values fall back to defaults.
    pub fn from_fields(
        crf: Option<&str>,
        audio_bitrate: Option<&str>,
        detect_green: Option<&str>,
    ) -> ServiceResult<Self> {
        let defaults = Self::default();
        let options = Self {
            crf: match non_blank(crf) {
                Some(raw) => parse_crf(raw)?,
                None => defaults.crf,
            },
            audio_bitrate: match non_blank(audio_bitrate) {
                Some(raw) => raw.to_string(),
                None => defaults.audio_bitrate,
            },
            detect_green: match non_blank(detect_green) {
                Some(raw) => parse_flag("detect_green", raw)?,
                None => defaults.detect_green,
            },
        };
        options.validate()?;
        Ok(options)
    }

    /// Check bounds on options built in code rather than parsed from a form
    pub fn validate(&self) -> ServiceResult<()> {
        if self.crf > MAX_CRF {
            return Err(ServiceError::Validation(format!(
                "crf must be between {} and {}, got {}",
                MIN_CRF, MAX_CRF, self.crf
            )));
        }
        audio_bitrate_kbps(&self.audio_bitrate)?;
        Ok(())
    }
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a quality factor. Values outside 0-63 are rejected, not clamped.
pub fn parse_crf(raw: &str) -> ServiceResult<u8> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ServiceError::Validation(format!("crf must be an integer, got {:?}", raw)))?;
    if value < MIN_CRF as i64 || value > MAX_CRF as i64 {
        return Err(ServiceError::Validation(format!(
            "crf must be between {} and {}, got {}",
            MIN_CRF, MAX_CRF, value
        )));
    }
    Ok(value as u8)
}

/// Validate a bitrate token like "96k" and return the kilobit value
pub fn audio_bitrate_kbps(token: &str) -> ServiceResult<u32> {
    let invalid = || {
        ServiceError::Validation(format!(
            "audio_bitrate must look like \"128k\" ({}k-{}k), got {:?}",
            MIN_AUDIO_KBPS, MAX_AUDIO_KBPS, token
        ))
    };
    let digits = token
        .strip_suffix('k')
        .or_else(|| token.strip_suffix('K'))
        .ok_or_else(invalid)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let kbps: u32 = digits.parse().map_err(|_| invalid())?;
    if !(MIN_AUDIO_KBPS..=MAX_AUDIO_KBPS).contains(&kbps) {
        return Err(invalid());
    }
    Ok(kbps)
}

/// Parse a boolean form field
pub fn parse_flag(field: &str, raw: &str) -> ServiceResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ServiceError::Validation(format!(
            "{} must be true or false, got {:?}",
            field, raw
        ))),
    }
}

/// Validate a job id handed in by the routing layer
pub fn validate_job_id(raw: &str) -> ServiceResult<String> {
    let id = raw.trim();
    let well_formed = !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !well_formed {
        return Err(ServiceError::Validation(format!(
            "job id must be 1-{} characters of [A-Za-z0-9_-]",
            MAX_JOB_ID_LEN
        )));
    }
    Ok(id.to_string())
}

/// One upload-to-WebM conversion
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub options: ConversionOptions,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub detected_color: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, options: ConversionOptions, input_path: PathBuf) -> Self {
        Self {
            id,
            status: JobStatus::Processing,
            progress: 0,
            options,
            input_path,
            output_path: None,
            detected_color: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record that an encoder slot was acquired
    pub fn mark_started(&mut self) {
        if !self.is_terminal() && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Raise progress. Never lowers it, never reaches 100 (that is reserved for `complete`),
    /// and is a no-op once the job is terminal. Returns whether the value changed.
    pub fn set_progress(&mut self, progress: u8) -> bool {
        if self.is_terminal() {
            return false;
        }
        let capped = progress.min(99);
        if capped > self.progress {
            self.progress = capped;
            return true;
        }
        false
    }

    pub fn set_detected_color(&mut self, color: String) {
        if !self.is_terminal() {
            self.detected_color = Some(color);
        }
    }

    /// Processing -> Complete. Progress jumps to 100 in the same step.
    pub fn complete(&mut self, output_path: PathBuf) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Complete;
        self.progress = 100;
        self.output_path = Some(output_path);
        self.error = None;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Processing -> Failed
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.output_path = None;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        true
    }
}
