//! Wall-clock pacing of the evolution loop.
//!
//! Step `n` after the pacer's origin is due at `origin + n / steps_per_second`
//! on the monotonic clock. After each step the loop sleeps for
//! `target - now`, clamped into `[0, max_sleep]`.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::PacingConfig;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Sleep length for reaching `target` from `now`, clamped into
/// `[0, max_sleep]`.
///
/// A target in the past (the loop is behind) yields zero.
pub fn clamp_sleep(target: Instant, now: Instant, max_sleep: Duration) -> Duration {
    target
        .checked_duration_since(now)
        .unwrap_or(Duration::ZERO)
        .min(max_sleep)
}

/// Paces steps against a fixed-rate schedule.
#[derive(Debug, Clone)]
pub struct StepPacer {
    enabled: bool,
    steps_per_second: u32,
    max_sleep: Duration,
    origin: Instant,
    origin_count: u64,
}

impl StepPacer {
    /// Create a pacer whose schedule starts now at `evolution_count`.
    pub fn new(config: &PacingConfig, steps_per_second: u32, evolution_count: u64) -> Self {
        Self {
            enabled: config.enabled,
            steps_per_second: steps_per_second.max(1),
            max_sleep: Duration::from_millis(config.max_sleep_ms),
            origin: Instant::now(),
            origin_count: evolution_count,
        }
    }

    /// A pacer that never sleeps.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            steps_per_second: 1,
            max_sleep: Duration::ZERO,
            origin: Instant::now(),
            origin_count: 0,
        }
    }

    /// Whether pacing is on.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Restart the schedule at `evolution_count` from now, e.g. after a
    /// restore or an epoch reset.
    pub fn rebase(&mut self, evolution_count: u64) {
        self.origin = Instant::now();
        self.origin_count = evolution_count;
    }

    /// Nominal length of one step.
    pub fn step_interval(&self) -> Duration {
        self.offset_for(1)
    }

    /// When step `evolution_count` is due.
    pub fn target_for(&self, evolution_count: u64) -> Instant {
        let steps = evolution_count.saturating_sub(self.origin_count);
        self.origin
            .checked_add(self.offset_for(steps))
            .unwrap_or(self.origin)
    }

    /// How long to sleep after completing `evolution_count` at `now`.
    pub fn sleep_for(&self, evolution_count: u64, now: Instant) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        clamp_sleep(self.target_for(evolution_count), now, self.max_sleep)
    }

    /// Sleep until `evolution_count` is due, within the clamp.
    pub async fn pace(&self, evolution_count: u64) {
        let sleep = self.sleep_for(evolution_count, Instant::now());
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
    }

    fn offset_for(&self, steps: u64) -> Duration {
        let nanos = u128::from(steps)
            .checked_mul(NANOS_PER_SECOND)
            .and_then(|n| n.checked_div(u128::from(self.steps_per_second)))
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(u64::MAX);
        Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn config(max_sleep_ms: u64) -> PacingConfig {
        PacingConfig {
            enabled: true,
            max_sleep_ms,
        }
    }

    #[test]
    fn past_target_sleeps_zero() {
        let now = Instant::now();
        let target = now.checked_sub(Duration::from_secs(5)).unwrap_or(now);
        assert_eq!(clamp_sleep(target, now, Duration::from_millis(10)), Duration::ZERO);
    }

    #[test]
    fn far_target_is_clamped() {
        let now = Instant::now();
        let target = now + Duration::from_secs(3600);
        assert_eq!(
            clamp_sleep(target, now, Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn near_target_is_exact() {
        let now = Instant::now();
        let target = now + Duration::from_millis(3);
        assert_eq!(
            clamp_sleep(target, now, Duration::from_millis(10)),
            Duration::from_millis(3)
        );
    }

    #[test]
    fn schedule_follows_rate() {
        let pacer = StepPacer::new(&config(10), 1000, 0);
        assert_eq!(pacer.step_interval(), Duration::from_millis(1));
        let due = pacer.target_for(250);
        assert_eq!(due.duration_since(pacer.target_for(0)), Duration::from_millis(250));
    }

    #[test]
    fn huge_step_gap_never_exceeds_max_sleep() {
        let pacer = StepPacer::new(&config(10), 1, 0);
        let sleep = pacer.sleep_for(u64::MAX, Instant::now());
        assert!(sleep <= Duration::from_millis(10));
    }

    #[test]
    fn disabled_never_sleeps() {
        let pacer = StepPacer::disabled();
        assert_eq!(pacer.sleep_for(1_000_000, Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pace_waits_for_schedule() {
        let pacer = StepPacer::new(&config(50), 100, 0);
        let before = Instant::now();
        pacer.pace(1).await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(10));
        assert!(waited < Duration::from_millis(12));
    }

    #[test]
    fn rebase_restarts_schedule() {
        let mut pacer = StepPacer::new(&config(10), 1000, 0);
        pacer.rebase(500);
        let now = Instant::now();
        assert!(pacer.target_for(500) <= now);
        assert!(pacer.sleep_for(500, now).is_zero());
    }
}
