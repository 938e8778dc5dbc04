//! Stand-in ffmpeg/ffprobe scripts for tests.
//!
//! The fake ffprobe accepts any file containing `MEDIA`. Files that also
//! contain `AUDIOONLY` probe without a video stream, and files containing
//! `ROTATED` carry a 90 degree display rotation. The fake ffmpeg serves a
//! solid frame for raw frame grabs and otherwise behaves as configured by
//! `EncoderBehavior`. Like the real tool it rejects a mandatory video map on
//! audio-only input, and it autorotates rotated input unless told not to.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use crate::config::ServiceConfig;
use crate::job::Job;
use crate::registry::JobRegistry;

/// Upload body the fake tools treat as valid media
pub const MEDIA_BYTES: &[u8] = b"MEDIA fake container payload";
/// Valid media with an audio stream only
pub const AUDIO_ONLY_BYTES: &[u8] = b"MEDIA AUDIOONLY fake container payload";
/// Valid media whose frames are stored rotated
pub const ROTATED_BYTES: &[u8] = b"MEDIA ROTATED fake container payload";
pub const FRAME_WIDTH: u32 = 96;
pub const FRAME_HEIGHT: u32 = 64;
/// Background of every grabbed frame, 0x0CC828
pub const FRAME_COLOR: [u8; 3] = [12, 200, 40];
/// What an autorotated grab of rotated input looks like to a reader using
/// the coded dimensions
pub const SKEWED_FRAME_COLOR: [u8; 3] = [200, 30, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderBehavior {
    Succeed,
    SucceedSlowly,
    FailWithExit,
    /// Several MB of stderr on one line before the real error
    FloodStderr,
    EmptyOutput,
    Hang,
}

pub struct FakeTools {
    pub dir: TempDir,
    pub config: ServiceConfig,
}

impl FakeTools {
    pub fn new(behavior: EncoderBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let frame_path = dir.path().join("frame.rgb");
        std::fs::write(&frame_path, solid_frame(FRAME_WIDTH, FRAME_HEIGHT, FRAME_COLOR)).unwrap();
        let skewed_path = dir.path().join("skewed.rgb");
        std::fs::write(&skewed_path, solid_frame(FRAME_HEIGHT, FRAME_WIDTH, SKEWED_FRAME_COLOR)).unwrap();

        let ffprobe = dir.path().join("ffprobe");
        write_script(&ffprobe, FFPROBE_SCRIPT);
        let ffmpeg = dir.path().join("ffmpeg");
        write_script(&ffmpeg, &ffmpeg_script(&frame_path, &skewed_path, behavior));

        let config = ServiceConfig {
            work_dir: dir.path().join("work"),
            ffmpeg_bin: ffmpeg,
            ffprobe_bin: ffprobe,
            max_upload_bytes: 1024 * 1024,
            max_concurrent_encodes: 2,
            encode_timeout_secs: 20,
            probe_timeout_secs: 10,
            ..ServiceConfig::default()
        };

        Self { dir, config }
    }

    /// Write a file outside the artifact directories
    pub fn write_input(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

pub fn solid_frame(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    color
        .iter()
        .copied()
        .cycle()
        .take((width * height * 3) as usize)
        .collect()
}

/// Poll until `condition` holds, panicking after ten seconds
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within ten seconds");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll a job until `done` holds, panicking after ten seconds
pub async fn wait_for_job<F>(registry: &JobRegistry, id: &str, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    wait_until(|| registry.get(id).map_or(false, |job| done(&job))).await;
    match registry.get(id) {
        Some(job) => job,
        None => panic!("job {} disappeared", id),
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

const FFPROBE_SCRIPT: &str = r#"#!/bin/sh
for last; do :; done
if grep -q AUDIOONLY "$last" 2>/dev/null; then
cat <<'JSON'
{
  "streams": [
    {"index": 0, "codec_type": "audio", "codec_name": "aac", "duration": "2.000000"}
  ],
  "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "2.000000", "bit_rate": "128000"}
}
JSON
exit 0
fi
if grep -q ROTATED "$last" 2>/dev/null; then
cat <<'JSON'
{
  "streams": [
    {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 96, "height": 64, "duration": "2.000000",
     "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]}
  ],
  "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "2.000000", "bit_rate": "800000"}
}
JSON
exit 0
fi
if grep -q MEDIA "$last" 2>/dev/null; then
cat <<'JSON'
{
  "streams": [
    {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 96, "height": 64, "duration": "2.000000"},
    {"index": 1, "codec_type": "audio", "codec_name": "aac", "duration": "2.000000"}
  ],
  "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "2.000000", "bit_rate": "800000"}
}
JSON
exit 0
fi
echo "$last: Invalid data found when processing input" >&2
exit 1
"#;

fn ffmpeg_script(frame_path: &Path, skewed_path: &Path, behavior: EncoderBehavior) -> String {
    let encode = match behavior {
        EncoderBehavior::Succeed => {
            r#"printf 'frame=10\nout_time_us=500000\nprogress=continue\n'
printf 'frame=20\nout_time_us=1000000\nprogress=continue\n'
printf 'frame=40\nout_time_us=2000000\nprogress=end\n'
printf 'WEBM-OUTPUT-BYTES' > "$last"
exit 0"#
        }
        EncoderBehavior::SucceedSlowly => {
            r#"printf 'out_time_us=500000\nprogress=continue\n'
sleep 0.3
printf 'out_time_us=1000000\nprogress=continue\n'
sleep 0.3
printf 'out_time_us=1500000\nprogress=continue\n'
sleep 0.3
printf 'out_time_us=2000000\nprogress=end\n'
printf 'WEBM-OUTPUT-BYTES' > "$last"
exit 0"#
        }
        EncoderBehavior::FailWithExit => {
            r#"printf 'out_time_us=500000\nprogress=continue\n'
echo "Error while decoding stream #0:0: Invalid data found when processing input" >&2
exit 1"#
        }
        EncoderBehavior::FloodStderr => {
            r#"printf 'out_time_us=500000\nprogress=continue\n'
head -c 3000000 /dev/zero | tr '\000' x >&2
printf '\n' >&2
echo "Error while decoding stream #0:0: Invalid data found when processing input" >&2
echo "Conversion failed!" >&2
exit 1"#
        }
        EncoderBehavior::EmptyOutput => {
            r#": > "$last"
exit 0"#
        }
        EncoderBehavior::Hang => "exec sleep 30",
    };

    format!(
        r#"#!/bin/sh
for last; do :; done
prev=""
input=""
rawvideo=""
noautorotate=""
video_map=""
for arg; do
  if [ "$prev" = "-i" ]; then input="$arg"; fi
  if [ "$prev" = "-map" ] && [ "$arg" = "0:v:0" ]; then video_map="mandatory"; fi
  if [ "$arg" = "rawvideo" ]; then rawvideo="yes"; fi
  if [ "$arg" = "-noautorotate" ]; then noautorotate="yes"; fi
  prev="$arg"
done
if ! grep -q MEDIA "$input" 2>/dev/null; then
  echo "$input: Invalid data found when processing input" >&2
  exit 1
fi
if [ -n "$rawvideo" ]; then
  if grep -q ROTATED "$input" && [ -z "$noautorotate" ]; then
    cat '{skewed}'
  else
    cat '{frame}'
  fi
  exit 0
fi
if grep -q AUDIOONLY "$input" && [ -n "$video_map" ]; then
  echo "Stream map '0:v:0' matches no streams." >&2
  exit 1
fi
{encode}
"#,
        frame = frame_path.display(),
        skewed = skewed_path.display(),
        encode = encode,
    )
}
