//! Progress-reporting contract shared by the fetcher and the swarm driver.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One progress observation of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Cumulative bytes present for this target, including resumed bytes.
    pub bytes: u64,
    /// Total expected bytes, when known.
    pub total: Option<u64>,
    /// Time since the current call started.
    pub elapsed: Duration,
    /// Instantaneous rate in bytes per second.
    pub rate: f64,
}

impl ProgressSample {
    /// Completed fraction in `[0, 1]`, if the total is known and non-zero.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.bytes as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Consumer of progress samples.
///
/// Sinks are infallible: anything that goes wrong while rendering progress is
/// the sink's own business and never aborts a transfer.
pub trait ProgressSink {
    fn on_progress(&mut self, sample: &ProgressSample);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressSample),
{
    fn on_progress(&mut self, sample: &ProgressSample) {
        self(sample)
    }
}

/// Sink that discards every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl ProgressSink for Silent {
    fn on_progress(&mut self, _sample: &ProgressSample) {}
}

/// Sliding-window throughput estimate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    points: VecDeque<(Instant, u64)>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            points: VecDeque::new(),
        }
    }

    /// Records the cumulative byte count at `now` and returns the rate in
    /// bytes per second over the window.
    pub fn record(&mut self, now: Instant, cumulative: u64) -> f64 {
        self.points.push_back((now, cumulative));
        while self.points.len() > 2 {
            match self.points.front() {
                Some((t, _)) if now.duration_since(*t) > self.window => {
                    self.points.pop_front();
                }
                _ => break,
            }
        }
        self.rate()
    }

    /// Rate over the points currently in the window.
    pub fn rate(&self) -> f64 {
        let (Some((t0, b0)), Some((t1, b1))) = (self.points.front(), self.points.back()) else {
            return 0.0;
        };
        let secs = t1.duration_since(*t0).as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        b1.saturating_sub(*b0) as f64 / secs
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
