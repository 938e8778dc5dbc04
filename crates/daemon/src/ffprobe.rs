use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::config::ServiceConfig;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    /// Seconds as a decimal string, or absent / "N/A" for unseekable input
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<String>,
}

impl FFProbeData {
    /// First video stream, if any
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Total duration in seconds. Falls back to the longest stream duration
    /// when the container does not report one.
    pub fn duration_secs(&self) -> Option<f64> {
        parse_seconds(self.format.duration.as_deref()).or_else(|| {
            self.streams
                .iter()
                .filter_map(|s| parse_seconds(s.duration.as_deref()))
                .fold(None, |longest: Option<f64>, d| Some(longest.map_or(d, |l| l.max(d))))
        })
    }
}

fn parse_seconds(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Run ffprobe and parse the JSON output.
///
/// Any input ffprobe cannot make sense of (non-zero exit, no streams) is an error;
/// that is how undecodable uploads are detected before the encoder starts.
pub async fn probe_file(cfg: &ServiceConfig, file_path: &Path) -> Result<FFProbeData> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("Executing FFprobe for: {}", file_path.display());

    let mut cmd = Command::new(&cfg.ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(file_path)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(cfg.probe_timeout_secs), cmd.output())
        .await
        .with_context(|| format!("FFprobe timed out after {} seconds", cfg.probe_timeout_secs))?
        .with_context(|| format!(
            "Failed to execute FFprobe at: {}. Ensure FFprobe is installed and accessible.",
            cfg.ffprobe_bin.display()
        ))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!("FFprobe failed (exit code {}): {}", exit_code, stderr.trim());
    }

    let json_str = String::from_utf8(output.stdout)
        .context("FFprobe output is not valid UTF-8")?;

    let data: FFProbeData = serde_json::from_str(&json_str)
        .context("Failed to parse FFprobe JSON")?;

    if data.streams.is_empty() {
        anyhow::bail!("No media streams found in input");
    }

    debug!("FFprobe: {} stream(s), duration {:?}s", data.streams.len(), data.duration_secs());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTools, EncoderBehavior, MEDIA_BYTES};

    fn parse(json: &str) -> FFProbeData {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_duration_from_format() {
        let data = parse(r#"{"streams":[{"index":0,"codec_type":"video"}],"format":{"duration":"12.500000"}}"#);
        assert_eq!(data.duration_secs(), Some(12.5));
        assert!(data.video_stream().is_some());
    }

    #[test]
    fn test_duration_falls_back_to_streams() {
        let data = parse(r#"{
            "streams":[
                {"index":0,"codec_type":"video","duration":"9.9"},
                {"index":1,"codec_type":"audio","duration":"10.1"}
            ],
            "format":{"duration":"N/A"}
        }"#);
        assert_eq!(data.duration_secs(), Some(10.1));
    }

    #[test]
    fn test_missing_duration_is_none() {
        let data = parse(r#"{"streams":[{"index":0,"codec_type":"audio"}],"format":{}}"#);
        assert_eq!(data.duration_secs(), None);
        assert!(data.video_stream().is_none());
    }

    #[tokio::test]
    async fn test_probe_valid_media() {
        let tools = FakeTools::new(EncoderBehavior::Succeed);
        let input = tools.write_input("clip.mp4", MEDIA_BYTES);

        let data = probe_file(&tools.config, &input).await.unwrap();
        assert_eq!(data.duration_secs(), Some(2.0));
        assert_eq!(data.video_stream().and_then(|s| s.width), Some(96));
    }

    #[tokio::test]
    async fn test_probe_garbage_fails() {
        let tools = FakeTools::new(EncoderBehavior::Succeed);
        let input = tools.write_input("notes.txt", b"definitely not a video");

        let err = probe_file(&tools.config, &input).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid data found when processing input"));
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let mut tools = FakeTools::new(EncoderBehavior::Succeed);
        tools.config.ffprobe_bin = tools.dir.path().join("no-such-ffprobe");
        let input = tools.write_input("clip.mp4", MEDIA_BYTES);

        let err = probe_file(&tools.config, &input).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to execute FFprobe"));
    }
}
