use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Phase of a flash operation
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stage {
    /// Sizing the image and probing its format
    Preparing,
    /// DATA phase: bytes are going over the wire
    Sending,
    /// The device is writing downloaded data to flash
    Writing,
    /// The partition is fully flashed
    Done,
    /// The operation was aborted
    Failed,
}

/// Progress of a single flash operation, delivered by value to a callback
#[derive(Debug, Clone)]
pub struct Progress {
    pub partition: String,
    pub stage: Stage,
    /// Sub-image currently in flight, 1-based; 0 while preparing
    pub current_chunk: u32,
    /// Expected number of sub-images
    pub total_chunks: u32,
    /// Wire bytes sent so far
    pub bytes_sent: u64,
    /// Size of the image file
    pub total_bytes: u64,
    /// In [0, 100]; exactly 100 only when the operation succeeded
    pub percent: f64,
    /// Transfer rate over the last second of sending
    pub speed_bps: u64,
}

/// Transfer rate over a sliding time window
pub(crate) struct SpeedWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the cumulative byte count and return the current rate
    pub(crate) fn record(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        self.samples.push_back((now, total_bytes));
        while self.samples.len() > 1 {
            let (t, _) = self.samples[0];
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let (start, start_bytes) = self.samples[0];
        let elapsed = now.duration_since(start).as_secs_f64();
        if elapsed > 0.0 {
            ((total_bytes.saturating_sub(start_bytes)) as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Book-keeping for the progress of one flash operation
pub(crate) struct ProgressReporter {
    partition: String,
    total_bytes: u64,
    total_chunks: u32,
    current_chunk: u32,
    bytes_sent: u64,
    speed: SpeedWindow,
    speed_bps: u64,
}

impl ProgressReporter {
    pub(crate) fn new(partition: &str, total_bytes: u64, total_chunks: u32) -> Self {
        Self {
            partition: partition.to_string(),
            total_bytes,
            total_chunks,
            current_chunk: 0,
            bytes_sent: 0,
            speed: SpeedWindow::new(Duration::from_secs(1)),
            speed_bps: 0,
        }
    }

    pub(crate) fn set_totals(&mut self, total_bytes: u64, total_chunks: u32) {
        self.total_bytes = total_bytes;
        self.total_chunks = total_chunks;
    }

    pub(crate) fn begin_chunk(&mut self, chunk: u32) {
        self.current_chunk = chunk;
        self.total_chunks = self.total_chunks.max(chunk);
    }

    pub(crate) fn advance(&mut self, bytes_sent: u64) {
        // Callers report cumulative counts; never step backwards
        self.bytes_sent = self.bytes_sent.max(bytes_sent);
        self.speed_bps = self.speed.record(self.bytes_sent);
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn snapshot(&self, stage: Stage) -> Progress {
        let percent = match stage {
            Stage::Done => 100.0,
            _ if self.total_bytes == 0 => 0.0,
            _ => (self.bytes_sent as f64 / self.total_bytes as f64 * 100.0).min(99.9),
        };
        Progress {
            partition: self.partition.clone(),
            stage,
            current_chunk: self.current_chunk,
            total_chunks: self.total_chunks,
            bytes_sent: self.bytes_sent,
            total_bytes: self.total_bytes,
            percent,
            speed_bps: self.speed_bps,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rate_over_window() {
        let mut speed = SpeedWindow::new(Duration::from_secs(1));
        assert_eq!(speed.record(0), 0);
        std::thread::sleep(Duration::from_millis(50));
        let rate = speed.record(1024 * 1024);
        assert!(rate > 0);
    }

    #[test]
    fn snapshot_percent() {
        let mut reporter = ProgressReporter::new("boot", 1000, 1);
        assert_eq!(reporter.snapshot(Stage::Preparing).percent, 0.0);
        reporter.begin_chunk(1);
        reporter.advance(500);
        let p = reporter.snapshot(Stage::Sending);
        assert!(p.percent >= 49.0 && p.percent <= 51.0);
        // Only completion reports 100
        reporter.advance(1000);
        assert!(reporter.snapshot(Stage::Sending).percent < 100.0);
        assert_eq!(reporter.snapshot(Stage::Done).percent, 100.0);
    }

    #[test]
    fn advance_is_monotone() {
        let mut reporter = ProgressReporter::new("super", 100, 1);
        reporter.advance(60);
        reporter.advance(10);
        assert_eq!(reporter.bytes_sent(), 60);
    }
}
