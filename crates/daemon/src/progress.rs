//! FFmpeg `-progress` output parsing.
//!
//! FFmpeg writes blocks of `key=value` lines and terminates each block with
//! `progress=continue` or `progress=end`. Only the terminating line produces
//! a percentage.

/// Latest values seen in the current progress block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeProgress {
    /// Output position in microseconds
    pub out_time_us: Option<i64>,
    pub frame: Option<u64>,
    pub speed: Option<f64>,
    pub is_end: bool,
}

/// Incremental parser for one encode's progress stream
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_us: Option<i64>,
    current: EncodeProgress,
    last_percent: u8,
}

impl ProgressParser {
    /// `total_secs` is the probed input duration. Without it the parser
    /// still tracks state but every percentage stays at 0.
    pub fn new(total_secs: Option<f64>) -> Self {
        let total_us = total_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(|s| (s * 1_000_000.0) as i64);
        Self {
            total_us,
            current: EncodeProgress::default(),
            last_percent: 0,
        }
    }

    pub fn current(&self) -> &EncodeProgress {
        &self.current
    }

    /// Feed one line. Returns the percentage when the line closes a block.
    /// The returned value never decreases and never exceeds 99.
    pub fn feed_line(&mut self, line: &str) -> Option<u8> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            // out_time_ms is also microseconds despite the name
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.current.out_time_us = Some(us);
                }
            }
            "out_time" => {
                if self.current.out_time_us.is_none() {
                    self.current.out_time_us = parse_timestamp(value);
                }
            }
            "frame" => self.current.frame = value.parse().ok(),
            "speed" => {
                self.current.speed = value.trim_end_matches('x').parse().ok();
            }
            "progress" => {
                self.current.is_end = value == "end";
                let percent = match (self.current.out_time_us, self.total_us) {
                    (Some(done), Some(total)) => percent_of(done, total),
                    _ => 0,
                };
                self.last_percent = self.last_percent.max(percent);
                self.current.out_time_us = None;
                return Some(self.last_percent);
            }
            _ => {}
        }
        None
    }
}

/// Whole percent of `processed_us` over `total_us`, clamped to 0..=99.
/// 100 is reserved for a finished job.
pub fn percent_of(processed_us: i64, total_us: i64) -> u8 {
    if total_us <= 0 || processed_us <= 0 {
        return 0;
    }
    let ratio = processed_us as f64 / total_us as f64;
    ((ratio * 100.0).floor() as i64).clamp(0, 99) as u8
}

/// Parse `HH:MM:SS.micro` into microseconds
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let mut parts = raw.trim().splitn(3, ':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if hours < 0 || minutes < 0 || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((hours * 3600 + minutes * 60) * 1_000_000 + (seconds * 1_000_000.0).round() as i64)
}
