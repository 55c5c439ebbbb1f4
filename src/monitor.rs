//! Filtering of encoder diagnostic output before it reaches the operator log.

use std::time::{Duration, Instant};

/// Minimum spacing between logged progress lines.
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Decides which encoder output lines are worth logging.
///
/// Errors and warnings always pass. Progress lines (`frame=`/`speed=`
/// counters ffmpeg prints continuously) are sampled at most once per
/// interval, tracked by an explicit last-logged timestamp. Everything
/// else is discarded.
pub struct ProgressFilter {
    interval: Duration,
    last_logged: Option<Instant>,
}

impl ProgressFilter {
    pub fn new(interval: Duration) -> Self {
        ProgressFilter {
            interval,
            last_logged: None,
        }
    }

    pub fn admit(&mut self, line: &str, now: Instant) -> bool {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("warning") {
            return true;
        }
        if !is_progress_line(line) {
            return false;
        }
        match self.last_logged {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_logged = Some(now);
                true
            }
        }
    }
}

fn is_progress_line(line: &str) -> bool {
    line.contains("frame=") || line.contains("speed=")
}
