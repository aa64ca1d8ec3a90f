//! Rolling step-duration statistics.
//!
//! Jitter is the sample standard deviation over the mean. Margin is the
//! share of the target interval left unused by the mean step. Verdicts are
//! only issued once the window holds [`MIN_SAMPLES`] durations.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

/// Durations kept in the rolling window.
pub const WINDOW: usize = 100;

/// Samples needed before any verdict.
pub const MIN_SAMPLES: usize = 10;

/// Maximum tolerated jitter (stddev / mean).
pub const JITTER_THRESHOLD: f64 = 0.01;

/// Minimum tolerated margin against the target interval.
pub const MARGIN_MIN: f64 = 0.2;

/// Snapshot of the window's statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    /// Mean step duration in nanoseconds.
    pub mean_ns: f64,
    /// Standard deviation over mean; zero with fewer than two samples.
    pub jitter: f64,
    /// `(target - mean) / target`.
    pub margin: f64,
    /// Samples in the window.
    pub samples: usize,
}

/// Outcome of recording one step duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimingVerdict {
    /// Not enough samples yet.
    Warming,
    /// Within both limits.
    Ok,
    /// Jitter above [`JITTER_THRESHOLD`].
    HighJitter {
        /// Measured jitter.
        jitter: f64,
    },
    /// Margin below [`MARGIN_MIN`].
    LowMargin {
        /// Measured margin.
        margin: f64,
    },
}

impl TimingVerdict {
    /// Whether this verdict is a violation.
    pub const fn is_violation(&self) -> bool {
        matches!(self, Self::HighJitter { .. } | Self::LowMargin { .. })
    }
}

/// Rolling timing monitor for the evolution loop.
#[derive(Debug, Clone)]
pub struct TimingMonitor {
    target_ns: f64,
    samples: VecDeque<f64>,
    violations: u64,
}

impl TimingMonitor {
    /// Monitor steps against a nominal `target` interval.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(target: Duration) -> Self {
        Self {
            target_ns: target.as_nanos() as f64,
            samples: VecDeque::with_capacity(WINDOW),
            violations: 0,
        }
    }

    /// Record one step's wall-clock duration.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, elapsed: Duration) -> TimingVerdict {
        if self.samples.len() >= WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed.as_nanos() as f64);

        if self.samples.len() < MIN_SAMPLES {
            return TimingVerdict::Warming;
        }
        let Some(stats) = self.stats() else {
            return TimingVerdict::Warming;
        };

        let verdict = if stats.jitter > JITTER_THRESHOLD {
            warn!(jitter = stats.jitter, threshold = JITTER_THRESHOLD, "High timing jitter");
            TimingVerdict::HighJitter {
                jitter: stats.jitter,
            }
        } else if stats.margin < MARGIN_MIN {
            warn!(margin = stats.margin, minimum = MARGIN_MIN, "Low timing margin");
            TimingVerdict::LowMargin {
                margin: stats.margin,
            }
        } else {
            TimingVerdict::Ok
        };
        if verdict.is_violation() {
            self.violations = self.violations.saturating_add(1);
        }
        verdict
    }

    /// Current statistics, or `None` when the window is empty.
    #[allow(clippy::cast_precision_loss, clippy::arithmetic_side_effects)]
    pub fn stats(&self) -> Option<TimingStats> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().sum::<f64>() / n;
        let jitter = if self.samples.len() > 1 && mean > 0.0 {
            let sum_sq: f64 = self.samples.iter().map(|s| (s - mean).powi(2)).sum();
            (sum_sq / (n - 1.0)).sqrt() / mean
        } else {
            0.0
        };
        let margin = if self.target_ns > 0.0 {
            (self.target_ns - mean) / self.target_ns
        } else {
            0.0
        };
        Some(TimingStats {
            mean_ns: mean,
            jitter,
            margin,
            samples: self.samples.len(),
        })
    }

    /// Violations recorded so far.
    pub const fn violations(&self) -> u64 {
        self.violations
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_before_judging() {
        let mut monitor = TimingMonitor::new(Duration::from_micros(100));
        for _ in 0..MIN_SAMPLES - 1 {
            assert_eq!(monitor.record(Duration::from_micros(500)), TimingVerdict::Warming);
        }
        assert!(monitor.record(Duration::from_micros(500)).is_violation());
    }

    #[test]
    fn steady_fast_steps_pass() {
        let mut monitor = TimingMonitor::new(Duration::from_micros(100));
        let mut last = TimingVerdict::Warming;
        for _ in 0..20 {
            last = monitor.record(Duration::from_micros(50));
        }
        assert_eq!(last, TimingVerdict::Ok);
        let stats = monitor.stats().unwrap();
        assert!((stats.margin - 0.5).abs() < 1e-12);
        assert!(stats.jitter.abs() < 1e-12);
        assert_eq!(monitor.violations(), 0);
    }

    #[test]
    fn slow_steps_lower_margin() {
        let mut monitor = TimingMonitor::new(Duration::from_micros(100));
        let mut last = TimingVerdict::Warming;
        for _ in 0..MIN_SAMPLES {
            last = monitor.record(Duration::from_micros(90));
        }
        assert!(matches!(last, TimingVerdict::LowMargin { .. }));
    }

    #[test]
    fn erratic_steps_raise_jitter() {
        let mut monitor = TimingMonitor::new(Duration::from_micros(1000));
        let mut last = TimingVerdict::Warming;
        for i in 0..20 {
            let micros = if i % 2 == 0 { 10 } else { 100 };
            last = monitor.record(Duration::from_micros(micros));
        }
        assert!(matches!(last, TimingVerdict::HighJitter { .. }));
        assert!(monitor.violations() > 0);
    }

    #[test]
    fn window_is_bounded() {
        let mut monitor = TimingMonitor::new(Duration::from_micros(100));
        for _ in 0..(WINDOW * 2) {
            monitor.record(Duration::from_micros(10));
        }
        assert_eq!(monitor.stats().unwrap().samples, WINDOW);
    }
}
