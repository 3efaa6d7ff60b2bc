//! Throughput accounting for copies and builds.

use std::fmt;
use std::time::{Duration, Instant};

/// Summary of one finished transfer
#[derive(Debug, Clone, Copy)]
pub struct TransferSummary {
    /// Bytes moved by this transfer
    pub bytes: u64,

    /// Bytes that were already present (resumed copies)
    pub resumed_from: u64,

    pub elapsed: Duration,
}

impl TransferSummary {
    /// Average speed in bytes/second
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} ({})",
            format_bytes(self.bytes),
            format_duration(self.elapsed.as_secs()),
            format_speed(self.bytes_per_second())
        )?;
        if self.resumed_from > 0 {
            write!(f, ", resumed at {}", format_bytes(self.resumed_from))?;
        }
        Ok(())
    }
}

/// Stopwatch for a transfer
pub struct TransferTimer {
    start: Instant,
}

impl TransferTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn finish(self, bytes: u64, resumed_from: u64) -> TransferSummary {
        TransferSummary {
            bytes,
            resumed_from,
            elapsed: self.start.elapsed(),
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_speed() {
        let summary = TransferSummary {
            bytes: 2048,
            resumed_from: 0,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(summary.bytes_per_second(), 1024);
        assert_eq!(summary.to_string(), "2.00 KB in 2s (1.00 KB/s)");
    }

    #[test]
    fn test_summary_mentions_resume() {
        let summary = TransferSummary {
            bytes: 10,
            resumed_from: 1024,
            elapsed: Duration::ZERO,
        };
        assert!(summary.to_string().ends_with("resumed at 1.00 KB"));
        assert_eq!(summary.bytes_per_second(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
