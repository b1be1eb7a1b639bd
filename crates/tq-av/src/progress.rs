//! Parser for ffmpeg's machine-readable `-progress` stream.
//!
//! ffmpeg emits blocks of `key=value` lines terminated by a
//! `progress=continue` or `progress=end` line. The parser tracks the encoded
//! position within the current block and, at each block boundary, converts it
//! to a whole percentage of the source duration.

/// Incremental `-progress` parser.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    out_time_us: Option<i64>,
    last_emitted: Option<u8>,
}

impl ProgressParser {
    /// `duration_secs` is the source duration; without it no percentage can
    /// be computed and [`feed`](Self::feed) never yields a value.
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| d.is_finite() && *d > 0.0),
            out_time_us: None,
            last_emitted: None,
        }
    }

    /// Consume one stderr line. Returns a new percentage when a progress
    /// block ends and the value differs from the last one emitted.
    pub fn feed(&mut self, line: &str) -> Option<u8> {
        let line = line.trim();

        if let Some(val) = line.strip_prefix("out_time_us=") {
            if let Ok(us) = val.parse::<i64>() {
                self.out_time_us = Some(us);
            }
        } else if let Some(val) = line.strip_prefix("out_time_ms=") {
            // Despite the name ffmpeg reports microseconds here too.
            if self.out_time_us.is_none() {
                self.out_time_us = val.parse::<i64>().ok();
            }
        } else if let Some(val) = line.strip_prefix("out_time=") {
            if self.out_time_us.is_none() {
                self.out_time_us = parse_timemark(val).map(|s| (s * 1_000_000.0) as i64);
            }
        } else if line.starts_with("progress=") {
            let pct = self.percent();
            self.out_time_us = None;
            if pct.is_some() && pct != self.last_emitted {
                self.last_emitted = pct;
                return pct;
            }
        }

        None
    }

    fn percent(&self) -> Option<u8> {
        let duration = self.duration_secs?;
        let out_us = self.out_time_us?;
        let elapsed = out_us.max(0) as f64 / 1_000_000.0;
        Some((elapsed / duration * 100.0).round().clamp(0.0, 100.0) as u8)
    }
}

/// Parse an `HH:MM:SS.frac` timemark into seconds.
pub fn parse_timemark(s: &str) -> Option<f64> {
    let mut parts = s.trim().split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let sec: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || h < 0.0 || m < 0.0 || sec < 0.0 {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + sec)
}
