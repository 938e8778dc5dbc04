use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use futures_util::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use crate::config::ServiceConfig;
use crate::job::ConversionOptions;
use crate::progress::ProgressParser;
use crate::storage::StorageError;

/// Diagnostic recorded on jobs stopped by shutdown
pub const SHUTDOWN_DIAGNOSTIC: &str = "service shutting down";
/// Longest ffmpeg output line kept; longer lines are skipped
pub const MAX_OUTPUT_LINE_BYTES: usize = 64 * 1024;

/// Why a conversion did not produce output
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("input could not be probed: {0}")]
    Probe(String),

    #[error("failed to start {}: {source}", .bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ffmpeg exited with code {code}: {diagnostic}")]
    Exit { code: i32, diagnostic: String },

    #[error("ffmpeg produced no output: {0}")]
    MissingOutput(String),

    #[error("ffmpeg timed out after {0} seconds and was killed")]
    Timeout(u64),

    #[error("service shutting down")]
    Cancelled,

    #[error("i/o error during conversion: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Encoding parameters for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingParams {
    pub crf: u8,
    pub audio_bitrate: String,
    pub threads: u32,
    pub cpu_used: u8,
}

impl EncodingParams {
    pub fn from_options(options: &ConversionOptions, cfg: &ServiceConfig) -> Self {
        Self {
            crf: options.crf,
            audio_bitrate: options.audio_bitrate.clone(),
            threads: cfg.encoder_threads.max(1),
            cpu_used: cfg.encoder_cpu_used.min(8),
        }
    }
}

/// Command builder for generating FFmpeg command lines
#[derive(Debug, Default)]
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the VP9/Opus WebM encode command.
    ///
    /// Progress goes to stdout as `key=value` blocks; stderr carries errors only.
    pub fn build_encode_command(&self, input: &Path, output: &Path, params: &EncodingParams) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner", "-nostdin", "-y",
            "-v", "error",
            "-progress", "pipe:1",
            "-nostats",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        // First video stream and every audio stream, each only if present
        args.push("-map".to_string());
        args.push("0:v:0?".to_string());
        args.push("-map".to_string());
        args.push("0:a?".to_string());

        args.push("-c:v".to_string());
        args.push("libvpx-vp9".to_string());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());
        // Constant quality mode needs -b:v 0
        args.push("-crf".to_string());
        args.push(params.crf.to_string());
        args.push("-b:v".to_string());
        args.push("0".to_string());
        args.push("-deadline".to_string());
        args.push("realtime".to_string());
        args.push("-cpu-used".to_string());
        args.push(params.cpu_used.to_string());
        args.push("-row-mt".to_string());
        args.push("1".to_string());
        args.push("-threads".to_string());
        args.push(params.threads.to_string());

        args.push("-c:a".to_string());
        args.push("libopus".to_string());
        args.push("-b:a".to_string());
        args.push(params.audio_bitrate.clone());

        args.push("-f".to_string());
        args.push("webm".to_string());
        args.push(output.to_string_lossy().to_string());

        args
    }
}

/// Keeps the last lines of a stream within a byte budget
#[derive(Debug)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl DiagnosticTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Append a line, cutting it to the budget and evicting the oldest
    /// lines until the joined text fits
    pub fn push(&mut self, line: &str) {
        let line = truncate_diagnostic(line.trim_end(), self.max_bytes);
        if line.is_empty() {
            return;
        }
        // Joined with '\n', so every line but the first costs one extra byte
        self.bytes += line.len() + usize::from(!self.lines.is_empty());
        self.lines.push_back(line);
        while self.bytes > self.max_bytes && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    /// Size of the joined text
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_string(self) -> String {
        self.lines.into_iter().collect::<Vec<_>>().join("\n")
    }
}

/// Keep at most `max_bytes` from the end of `text`, cut on a char boundary
pub fn truncate_diagnostic(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// `LinesCodec` that skips lines over the length limit and lines that are
/// not UTF-8 instead of failing the stream
pub struct SkippingLinesCodec {
    inner: LinesCodec,
}

impl SkippingLinesCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn skip_or_fail(e: LinesCodecError) -> io::Result<()> {
        match e {
            // The codec discards up to the next newline on its own
            LinesCodecError::MaxLineLengthExceeded => {
                debug!("Skipping FFmpeg output line longer than the limit");
                Ok(())
            }
            // The bad line has already been consumed
            LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
                debug!("Skipping FFmpeg output line that is not UTF-8");
                Ok(())
            }
            LinesCodecError::Io(e) => Err(e),
        }
    }
}

impl Decoder for SkippingLinesCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            match self.inner.decode(buf) {
                Ok(line) => return Ok(line),
                Err(e) => Self::skip_or_fail(e)?,
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            match self.inner.decode_eof(buf) {
                Ok(line) => return Ok(line),
                Err(e) => Self::skip_or_fail(e)?,
            }
        }
    }
}

/// Line reader over a child pipe with a bounded line length
pub struct OutputLines<R> {
    inner: FramedRead<R, SkippingLinesCodec>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, SkippingLinesCodec::new(max_line_bytes)),
        }
    }

    /// Next complete line, or `None` once the pipe is closed
    pub async fn next_line(&mut self) -> Option<String> {
        match self.inner.next().await? {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Failed to read FFmpeg output: {}", e);
                None
            }
        }
    }
}

/// Runs ffmpeg encodes with progress reporting, a deadline and cancellation
#[derive(Debug, Clone)]
pub struct Encoder {
    ffmpeg_bin: PathBuf,
    timeout_secs: u64,
    max_diagnostic_bytes: usize,
}

impl Encoder {
    pub fn new(cfg: &ServiceConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            timeout_secs: cfg.encode_timeout_secs,
            max_diagnostic_bytes: cfg.max_diagnostic_bytes,
        }
    }

    /// Run one encode to completion.
    ///
    /// `on_progress` receives every percentage ffmpeg reports. Returns the
    /// output size; a zero exit without a non-empty output file is an error.
    pub async fn run<F>(
        &self,
        args: Vec<String>,
        total_secs: Option<f64>,
        output: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<u64, EncodeError>
    where
        F: FnMut(u8),
    {
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EncodeError::Spawn {
            bin: self.ffmpeg_bin.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "failed to capture ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "failed to capture ffmpeg stderr"))?;

        let max_bytes = self.max_diagnostic_bytes;
        let stderr_handle = tokio::spawn(async move {
            let mut tail = DiagnosticTail::new(max_bytes);
            let mut lines = OutputLines::new(stderr, MAX_OUTPUT_LINE_BYTES);
            while let Some(line) = lines.next_line().await {
                tail.push(&line);
            }
            tail.into_string()
        });

        let mut parser = ProgressParser::new(total_secs);
        let mut progress_lines = OutputLines::new(stdout, MAX_OUTPUT_LINE_BYTES);
        let mut stdout_open = true;

        let deadline = tokio::time::sleep(Duration::from_secs(self.timeout_secs));
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                line = progress_lines.next_line(), if stdout_open => match line {
                    Some(line) => {
                        if let Some(percent) = parser.feed_line(&line) {
                            on_progress(percent);
                        }
                    }
                    None => stdout_open = false,
                },
                status = child.wait() => break status?,
                _ = &mut deadline => {
                    terminate(&mut child).await;
                    stderr_handle.abort();
                    return Err(EncodeError::Timeout(self.timeout_secs));
                }
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    stderr_handle.abort();
                    return Err(EncodeError::Cancelled);
                }
            }
        };

        // Pick up the final block written just before exit
        while stdout_open {
            match progress_lines.next_line().await {
                Some(line) => {
                    if let Some(percent) = parser.feed_line(&line) {
                        on_progress(percent);
                    }
                }
                None => stdout_open = false,
            }
        }

        let diagnostic = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(EncodeError::Exit {
                code: status.code().unwrap_or(-1),
                diagnostic,
            });
        }

        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(EncodeError::Io(e)),
        };
        if size == 0 {
            let detail = if diagnostic.is_empty() {
                format!("{} is missing or empty", output.display())
            } else {
                diagnostic
            };
            return Err(EncodeError::MissingOutput(detail));
        }

        info!("FFmpeg execution completed successfully");
        Ok(size)
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill FFmpeg process: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EncoderBehavior, FakeTools, AUDIO_ONLY_BYTES, MEDIA_BYTES};
    use proptest::prelude::*;

    fn params() -> EncodingParams {
        EncodingParams {
            crf: 30,
            audio_bitrate: "128k".to_string(),
            threads: 2,
            cpu_used: 5,
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_encode_command_shape() {
        let args = CommandBuilder::new().build_encode_command(
            Path::new("/work/inputs/a.upload"),
            Path::new("/work/outputs/a.webm"),
            &params(),
        );

        assert_eq!(arg_after(&args, "-i"), Some("/work/inputs/a.upload"));
        let maps: Vec<&str> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-map")
            .filter_map(|(i, _)| args.get(i + 1).map(|s| s.as_str()))
            .collect();
        // Audio-only and video-only inputs both encode
        assert_eq!(maps, vec!["0:v:0?", "0:a?"]);
        assert_eq!(arg_after(&args, "-c:v"), Some("libvpx-vp9"));
        assert_eq!(arg_after(&args, "-crf"), Some("30"));
        assert_eq!(arg_after(&args, "-b:v"), Some("0"));
        assert_eq!(arg_after(&args, "-c:a"), Some("libopus"));
        assert_eq!(arg_after(&args, "-b:a"), Some("128k"));
        assert_eq!(arg_after(&args, "-progress"), Some("pipe:1"));
        assert_eq!(arg_after(&args, "-f"), Some("webm"));
        assert_eq!(args.last().map(|s| s.as_str()), Some("/work/outputs/a.webm"));
    }

    #[test]
    fn test_params_from_options() {
        let cfg = ServiceConfig {
            encoder_threads: 0,
            encoder_cpu_used: 12,
            ..Default::default()
        };
        let options = ConversionOptions {
            crf: 18,
            audio_bitrate: "96k".to_string(),
            detect_green: false,
        };
        let params = EncodingParams::from_options(&options, &cfg);
        assert_eq!(params.crf, 18);
        assert_eq!(params.audio_bitrate, "96k");
        assert_eq!(params.threads, 1);
        assert_eq!(params.cpu_used, 8);
    }

    #[test]
    fn test_diagnostic_tail_keeps_last_lines() {
        let mut tail = DiagnosticTail::new(16);
        tail.push("first line here");
        tail.push("second");
        tail.push("third");
        assert_eq!(tail.len(), 12);
        assert_eq!(tail.into_string(), "second\nthird");
    }

    #[test]
    fn test_diagnostic_tail_cuts_oversized_line() {
        let mut tail = DiagnosticTail::new(2048);
        let huge = format!("{}END", "x".repeat(8 * 1024 * 1024));
        tail.push(&huge);
        assert!(tail.len() <= 2048);

        let text = tail.into_string();
        assert_eq!(text.len(), 2048);
        assert!(text.ends_with("END"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ééééé";
        let cut = truncate_diagnostic(text, 3);
        assert_eq!(cut, "é");
    }

    proptest! {
        #[test]
        fn prop_truncate_is_bounded(text in ".{0,300}", max in 1usize..200) {
            let cut = truncate_diagnostic(&text, max);
            prop_assert!(cut.len() <= max);
            prop_assert!(text.ends_with(&cut));
        }

        #[test]
        fn prop_diagnostic_tail_stays_within_budget(
            lines in proptest::collection::vec(".{0,120}", 0..30),
            max in 1usize..256,
        ) {
            let mut tail = DiagnosticTail::new(max);
            for line in &lines {
                tail.push(line);
                prop_assert!(tail.len() <= max);
            }
            let expected = tail.len();
            prop_assert_eq!(tail.into_string().len(), expected);
        }
    }

    async fn collect_lines(input: &[u8], max_line_bytes: usize) -> Vec<String> {
        let mut lines = OutputLines::new(input, max_line_bytes);
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_output_lines_skip_overlong_and_invalid_lines() {
        let mut input = b"short\r\n".to_vec();
        input.extend(std::iter::repeat(b'x').take(100));
        input.extend_from_slice(b"\nafter\n\xff\xfe\nlast");

        let lines = collect_lines(&input, 10).await;
        assert_eq!(lines, vec!["short", "after", "last"]);
    }

    #[tokio::test]
    async fn test_output_lines_drop_unterminated_overlong_tail() {
        let mut input = b"ok\n".to_vec();
        input.extend(std::iter::repeat(b'y').take(50));

        let lines = collect_lines(&input, 10).await;
        assert_eq!(lines, vec!["ok"]);
    }

    async fn run_with(behavior: EncoderBehavior, timeout_secs: u64) -> (Result<u64, EncodeError>, Vec<u8>, FakeTools) {
        let mut tools = FakeTools::new(behavior);
        tools.config.encode_timeout_secs = timeout_secs;
        let input = tools.write_input("clip.mp4", MEDIA_BYTES);
        let output = tools.dir.path().join("out.webm");
        let args = CommandBuilder::new().build_encode_command(&input, &output, &params());

        let encoder = Encoder::new(&tools.config);
        let mut seen = Vec::new();
        let result = encoder
            .run(args, Some(2.0), &output, &CancellationToken::new(), |p| seen.push(p))
            .await;
        (result, seen, tools)
    }

    #[tokio::test]
    async fn test_successful_encode_reports_progress() {
        let (result, seen, tools) = run_with(EncoderBehavior::Succeed, 30).await;
        let size = result.unwrap();
        assert!(size > 0);
        assert!(tools.dir.path().join("out.webm").exists());
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&99));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_tail() {
        let (result, _, _) = run_with(EncoderBehavior::FailWithExit, 30).await;
        match result {
            Err(EncodeError::Exit { code, diagnostic }) => {
                assert_eq!(code, 1);
                assert!(diagnostic.contains("Invalid data found when processing input"));
            }
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flooded_stderr_keeps_bounded_tail() {
        let (result, _, tools) = run_with(EncoderBehavior::FloodStderr, 30).await;
        match result {
            Err(EncodeError::Exit { diagnostic, .. }) => {
                assert!(diagnostic.len() <= tools.config.max_diagnostic_bytes);
                assert!(diagnostic.ends_with("Conversion failed!"));
                assert!(!diagnostic.contains("xxxx"));
            }
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_audio_only_input_encodes() {
        let tools = FakeTools::new(EncoderBehavior::Succeed);
        let input = tools.write_input("voice.m4a", AUDIO_ONLY_BYTES);
        let output = tools.dir.path().join("voice.webm");
        let args = CommandBuilder::new().build_encode_command(&input, &output, &params());

        let result = Encoder::new(&tools.config)
            .run(args, Some(2.0), &output, &CancellationToken::new(), |_| {})
            .await;
        assert!(result.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_fails() {
        let (result, _, _) = run_with(EncoderBehavior::EmptyOutput, 30).await;
        assert!(matches!(result, Err(EncodeError::MissingOutput(_))));
    }

    #[tokio::test]
    async fn test_hung_encoder_times_out() {
        let (result, _, _) = run_with(EncoderBehavior::Hang, 1).await;
        assert!(matches!(result, Err(EncodeError::Timeout(1))));
    }

    #[tokio::test]
    async fn test_cancellation_kills_encoder() {
        let tools = FakeTools::new(EncoderBehavior::Hang);
        let input = tools.write_input("clip.mp4", MEDIA_BYTES);
        let output = tools.dir.path().join("out.webm");
        let args = CommandBuilder::new().build_encode_command(&input, &output, &params());
        let encoder = Encoder::new(&tools.config);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = encoder.run(args, Some(2.0), &output, &cancel, |_| {}).await;
        assert!(matches!(result, Err(EncodeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut tools = FakeTools::new(EncoderBehavior::Succeed);
        tools.config.ffmpeg_bin = tools.dir.path().join("no-such-ffmpeg");
        let output = tools.dir.path().join("out.webm");
        let encoder = Encoder::new(&tools.config);

        let result = encoder
            .run(vec!["-version".to_string()], None, &output, &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(EncodeError::Spawn { .. })));
    }
}
