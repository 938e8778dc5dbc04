//! Dominant background color detection.
//!
//! One frame is decoded to raw RGB and the four corners are averaged. Corners
//! that agree with each other win; a subject covering one corner does not
//! skew the result.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use tokio::process::Command;
use crate::config::ServiceConfig;
use crate::ffprobe::FFProbeData;

/// Side of the square patch averaged in each corner
pub const PATCH_SIZE: u32 = 20;
/// Distance between a patch and the frame edge
pub const PATCH_MARGIN: u32 = 10;
/// Corners closer than this in RGB space count as the same color
pub const AGREEMENT_DISTANCE: f64 = 48.0;
/// Corners needed before the agreeing group is preferred over all four
pub const MAJORITY: usize = 3;
/// Seek offset used to skip fade-in frames on longer clips
const SAMPLE_OFFSET_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `0xRRGGBB`, uppercase
    pub fn to_hex(&self) -> String {
        format!("0x{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    fn distance(&self, other: &Rgb) -> f64 {
        let dr = self.r as f64 - other.r as f64;
        let dg = self.g as f64 - other.g as f64;
        let db = self.b as f64 - other.b as f64;
        (dr * dr + dg * dg + db * db).sqrt()
    }
}

/// Rectangle inside a frame, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// Top-left, top-right, bottom-left, bottom-right patches.
/// Patch and margin shrink for frames too small to hold them.
pub fn corner_regions(width: u32, height: u32) -> [Region; 4] {
    let size = PATCH_SIZE.min(width).min(height).max(1);
    let margin = PATCH_MARGIN
        .min(width.saturating_sub(size) / 2)
        .min(height.saturating_sub(size) / 2);
    let right = width.saturating_sub(size + margin);
    let bottom = height.saturating_sub(size + margin);

    [
        Region { x: margin, y: margin, size },
        Region { x: right, y: margin, size },
        Region { x: margin, y: bottom, size },
        Region { x: right, y: bottom, size },
    ]
}

/// Mean color of a region of a packed rgb24 frame
pub fn average_region(frame: &[u8], width: u32, region: &Region) -> Option<Rgb> {
    let mut sums = [0u64; 3];
    let mut count = 0u64;

    for row in region.y..region.y + region.size {
        for col in region.x..region.x + region.size {
            let offset = ((row as usize * width as usize) + col as usize) * 3;
            let pixel = frame.get(offset..offset + 3)?;
            sums[0] += pixel[0] as u64;
            sums[1] += pixel[1] as u64;
            sums[2] += pixel[2] as u64;
            count += 1;
        }
    }

    if count == 0 {
        return None;
    }
    Some(Rgb::new(
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ))
}

fn mean(colors: &[Rgb]) -> Rgb {
    let n = colors.len().max(1) as u32;
    let (r, g, b) = colors.iter().fold((0u32, 0u32, 0u32), |(r, g, b), c| {
        (r + c.r as u32, g + c.g as u32, b + c.b as u32)
    });
    Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8)
}

/// Average of the largest group of agreeing corners, or of all four when
/// fewer than `MAJORITY` corners agree
pub fn combine_corners(corners: &[Rgb; 4]) -> Rgb {
    let best = corners
        .iter()
        .map(|anchor| {
            corners
                .iter()
                .copied()
                .filter(|c| anchor.distance(c) <= AGREEMENT_DISTANCE)
                .collect::<Vec<_>>()
        })
        .max_by_key(|group| group.len())
        .unwrap_or_default();

    if best.len() >= MAJORITY {
        mean(&best)
    } else {
        mean(corners)
    }
}

/// Dominant corner color of a packed rgb24 frame
pub fn dominant_corner_color(frame: &[u8], width: u32, height: u32) -> Result<Rgb> {
    let expected = width as usize * height as usize * 3;
    if width == 0 || height == 0 || frame.len() < expected {
        bail!(
            "decoded frame is {} bytes, expected {} for {}x{}",
            frame.len(), expected, width, height
        );
    }

    let regions = corner_regions(width, height);
    let mut corners = [Rgb::new(0, 0, 0); 4];
    for (slot, region) in corners.iter_mut().zip(regions.iter()) {
        *slot = average_region(frame, width, region)
            .context("corner patch falls outside the frame")?;
    }
    Ok(combine_corners(&corners))
}

/// Frame dimensions of the first video stream
pub fn frame_size(probe: &FFProbeData) -> Option<(u32, u32)> {
    let video = probe.video_stream()?;
    let width = u32::try_from(video.width?).ok()?;
    let height = u32::try_from(video.height?).ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

/// Arguments grabbing one rgb24 frame at `offset` seconds.
///
/// Autorotation is disabled and the output size pinned so the frame layout
/// matches the probed `width` x `height` even for rotated phone footage.
pub fn frame_grab_args(input: &Path, width: u32, height: u32, offset: f64) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-v", "error", "-noautorotate"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push("-ss".to_string());
    args.push(format!("{:.3}", offset));
    args.push("-i".to_string());
    args.push(input.to_string_lossy().to_string());
    args.extend(["-frames:v", "1", "-s"].iter().map(|s| s.to_string()));
    args.push(format!("{}x{}", width, height));
    args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"].iter().map(|s| s.to_string()));
    args
}

#[derive(Debug, Clone)]
pub struct ColorSampler {
    ffmpeg_bin: PathBuf,
    timeout_secs: u64,
}

impl ColorSampler {
    pub fn new(cfg: &ServiceConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            timeout_secs: cfg.probe_timeout_secs,
        }
    }

    /// Decode one frame and return its dominant corner color
    pub async fn sample(&self, input: &Path, width: u32, height: u32, duration: Option<f64>) -> Result<Rgb> {
        let offset = match duration {
            Some(d) if d > 1.0 => SAMPLE_OFFSET_SECS,
            _ => 0.0,
        };

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(frame_grab_args(input, width, height, offset))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .with_context(|| format!("frame extraction timed out after {} seconds", self.timeout_secs))?
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "frame extraction failed (exit code {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let color = dominant_corner_color(&output.stdout, width, height)?;
        debug!("Sampled {} from {}", color.to_hex(), input.display());
        Ok(color)
    }

    /// Sample in a separate task. Errors and panics are logged and yield `None`.
    pub async fn sample_best_effort(&self, input: &Path, probe: &FFProbeData) -> Option<String> {
        let Some((width, height)) = frame_size(probe) else {
            warn!("Skipping color detection for {}: no video dimensions", input.display());
            return None;
        };

        let sampler = self.clone();
        let input = input.to_path_buf();
        let duration = probe.duration_secs();
        let handle = tokio::spawn(async move {
            let result = sampler.sample(&input, width, height, duration).await;
            (input, result)
        });

        match handle.await {
            Ok((_, Ok(color))) => Some(color.to_hex()),
            Ok((input, Err(e))) => {
                warn!("Color detection failed for {}: {:#}", input.display(), e);
                None
            }
            Err(e) => {
                warn!("Color detection task aborted: {}", e);
                None
            }
        }
    }
}
