use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the WebM transcoding service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP listener binds to
    pub bind_addr: String,
    /// Port the HTTP listener binds to
    pub port: u16,
    /// Root directory for staged inputs and encoded outputs
    pub work_dir: PathBuf,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Maximum accepted upload size in bytes
    pub max_upload_bytes: u64,
    /// Maximum number of encoder processes running at once (0 = derive from CPU count)
    pub max_concurrent_encodes: usize,
    /// Worker threads handed to the VP9 encoder
    pub encoder_threads: u32,
    /// libvpx speed setting (0-8, higher = faster)
    pub encoder_cpu_used: u8,
    /// Kill the encoder if it runs longer than this
    pub encode_timeout_secs: u64,
    /// Kill ffprobe / frame extraction if it runs longer than this
    pub probe_timeout_secs: u64,
    /// How long artifacts of a finished job are kept before the sweeper reclaims them
    pub retention_secs: u64,
    /// Interval in seconds between sweeper passes
    pub sweep_interval_secs: u64,
    /// Upper bound on the encoder diagnostic kept for failed jobs
    pub max_diagnostic_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServiceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8666,
            work_dir: PathBuf::from("/tmp/webmd"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            max_upload_bytes: 512 * 1024 * 1024, // 512 MiB
            max_concurrent_encodes: 0,
            encoder_threads: 2,
            encoder_cpu_used: 5,
            encode_timeout_secs: 30 * 60,
            probe_timeout_secs: 30,
            retention_secs: 60 * 60,
            sweep_interval_secs: 60,
            max_diagnostic_bytes: 2048,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply PORT / WEBMD_WORK_DIR / FFMPEG_BIN / FFPROBE_BIN on top of file values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {}", port))?;
        }
        if let Ok(dir) = std::env::var("WEBMD_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = std::env::var("FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Ok(bin) = std::env::var("FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(bin);
        }
        Ok(())
    }

    /// Directory holding staged uploads
    pub fn inputs_dir(&self) -> PathBuf {
        self.work_dir.join("inputs")
    }

    /// Directory holding encoded results
    pub fn outputs_dir(&self) -> PathBuf {
        self.work_dir.join("outputs")
    }

    /// Resolve the encoder cap. Each encoder runs `encoder_threads` threads,
    /// so auto mode gives every two CPUs one encoder.
    pub fn resolved_concurrency(&self, available_cpus: usize) -> usize {
        if self.max_concurrent_encodes > 0 {
            return self.max_concurrent_encodes;
        }
        (available_cpus / 2).max(1)
    }
}
