//! Throughput tracking for a running send/receive stream.
//!
//! The pump reports every chunk it forwards; the meter logs elapsed time,
//! current rate and volume at a fixed cadence.

use std::time::{Duration, Instant};
use tracing::info;

/// Snapshot of a stream's progress
#[derive(Debug, Clone, Default)]
pub struct Throughput {
    /// Bytes forwarded so far
    pub bytes: u64,

    /// Rate since the previous report, in bytes/second
    pub bytes_per_second: u64,

    /// Time since the stream started
    pub elapsed: Duration,
}

/// Byte counter with time-based rate calculation
pub struct ThroughputMeter {
    label: String,
    start_time: Instant,
    last_report_time: Instant,
    last_report_bytes: u64,
    /// `None` disables periodic reporting
    interval: Option<Duration>,
    throughput: Throughput,
}

impl ThroughputMeter {
    pub fn new(label: impl Into<String>, interval: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            start_time: now,
            last_report_time: now,
            last_report_bytes: 0,
            interval,
            throughput: Throughput::default(),
        }
    }

    /// Count `len` more bytes; logs a line when a report is due
    pub fn record(&mut self, len: usize) {
        self.throughput.bytes += len as u64;

        let Some(interval) = self.interval else {
            return;
        };
        if self.last_report_time.elapsed() >= interval {
            let snapshot = self.sample();
            info!(
                "{}: time [{}] -- rate {} -- size [{}]",
                self.label,
                format_duration(snapshot.elapsed.as_secs()),
                format_speed(snapshot.bytes_per_second),
                format_bytes(snapshot.bytes)
            );
        }
    }

    /// Current snapshot; resets the rate window
    pub fn sample(&mut self) -> Throughput {
        let now = Instant::now();
        let window = now.duration_since(self.last_report_time).as_secs_f64();

        if window > 0.0 {
            let diff = self.throughput.bytes.saturating_sub(self.last_report_bytes);
            self.throughput.bytes_per_second = (diff as f64 / window) as u64;
        }
        self.throughput.elapsed = now.duration_since(self.start_time);
        self.last_report_time = now;
        self.last_report_bytes = self.throughput.bytes;

        self.throughput.clone()
    }

    pub fn bytes(&self) -> u64 {
        self.throughput.bytes
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
