use std::time::{Duration, Instant};

use indicatif::HumanBytes;
use reqwest::Url;

/// Transfer rate for progress output, e.g. `"1.50 MiB/s"`.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    format!("{}/s", HumanBytes(bytes_per_sec.max(0.0) as u64))
}

/// Percentage of `total` received, capped at 100. An unknown or zero total,
/// as in a record saved before the server reported a size, reads as 0.
#[must_use]
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (downloaded as f32 / total as f32 * 100.0).min(100.0),
        _ => 0.0,
    }
}

/// Strip userinfo and query parameters so signed URLs can be logged.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split('?').next().unwrap_or_default().to_owned(),
    }
}

/// Rate limiter for side effects driven by high-frequency progress ticks.
#[derive(Debug)]
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Returns true at most once per interval; the first call always passes.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
