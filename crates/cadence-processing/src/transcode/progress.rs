//! Parser for ffmpeg's `-progress` key=value stream

/// Turns `-progress pipe:1` lines into a completed fraction of a known duration.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_us: f64,
    last: f64,
}

impl ProgressParser {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_us: (duration_secs * 1_000_000.0).max(0.0),
            last: 0.0,
        }
    }

    /// Feed one line; returns a new fraction when the line advances progress.
    ///
    /// Fractions are clamped to [0, 1] and never decrease.
    pub fn parse_line(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        let fraction = match key {
            // out_time_ms is in microseconds as well
            "out_time_us" | "out_time_ms" => {
                let us = value.trim().parse::<f64>().ok()?;
                if self.duration_us <= 0.0 {
                    return None;
                }
                us / self.duration_us
            }
            "progress" if value.trim() == "end" => 1.0,
            _ => return None,
        };

        let fraction = fraction.clamp(0.0, 1.0);
        if fraction.is_nan() || fraction <= self.last {
            return None;
        }
        self.last = fraction;
        Some(fraction)
    }
}
