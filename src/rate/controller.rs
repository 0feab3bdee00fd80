//! AIMD rate controller
//!
//! Additive-increase/multiplicative-decrease applied to the inter-query
//! delay: sustained success slowly shrinks the delay, any error jumps it
//! back up. One controller is shared by all tabs of a session so the
//! aggregate request rate stays within safe bounds for the target service.

use std::time::Duration;
use parking_lot::Mutex;
use tracing::debug;

/// Pacing bounds and adjustment policy.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateConfig {
    /// Starting delay between queries in milliseconds
    pub initial_delay_ms: u64,
    /// Hard minimum delay
    pub floor_ms: u64,
    /// Hard maximum delay
    pub ceiling_ms: u64,
    /// Additive decrease applied after a success streak
    pub decrease_step_ms: u64,
    /// Successes required before the delay shrinks
    pub success_threshold: u32,
    /// Multiplicative backoff applied on every error
    pub backoff_factor: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 3000,
            floor_ms: 500,
            ceiling_ms: 20000,
            decrease_step_ms: 250,
            success_threshold: 10,
            backoff_factor: 1.5,
        }
    }
}

#[derive(Debug)]
struct RateState {
    delay_ms: u64,
    success_streak: u32,
}

/// Shared pacing signal for one session.
pub struct RateController {
    config: RateConfig,
    state: Mutex<RateState>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        // Keep the invariant floor <= delay <= ceiling from the start
        let delay_ms = config
            .initial_delay_ms
            .clamp(config.floor_ms, config.ceiling_ms);
        Self {
            config,
            state: Mutex::new(RateState {
                delay_ms,
                success_streak: 0,
            }),
        }
    }

    /// Current inter-query delay.
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.state.lock().delay_ms)
    }

    /// Record one resolved query. Every `success_threshold` consecutive
    /// successes shave `decrease_step_ms` off the delay, down to the floor.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        state.success_streak += 1;
        if state.success_streak >= self.config.success_threshold {
            state.success_streak = 0;
            let next = state.delay_ms.saturating_sub(self.config.decrease_step_ms);
            state.delay_ms = next.max(self.config.floor_ms);
            debug!("Rate delay decreased to {}ms", state.delay_ms);
        }
    }

    /// Record a failed or timed-out query. Multiplies the delay by the
    /// backoff factor (capped at the ceiling) and breaks the streak.
    pub fn on_error(&self) {
        let mut state = self.state.lock();
        state.success_streak = 0;
        let next = (state.delay_ms as f64 * self.config.backoff_factor) as u64;
        state.delay_ms = next.clamp(self.config.floor_ms, self.config.ceiling_ms);
        debug!("Rate delay increased to {}ms", state.delay_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RateController {
        RateController::new(RateConfig {
            initial_delay_ms: 3000,
            floor_ms: 500,
            ceiling_ms: 10000,
            decrease_step_ms: 250,
            success_threshold: 10,
            backoff_factor: 1.5,
        })
    }

    #[test]
    fn test_bounds_hold_under_any_sequence() {
        let rc = controller();
        for i in 0..500 {
            if i % 7 == 0 {
                rc.on_error();
            } else {
                rc.on_success();
            }
            let d = rc.current_delay().as_millis() as u64;
            assert!((500..=10000).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_ten_successes_decrease_delay() {
        let rc = controller();
        let before = rc.current_delay();
        for _ in 0..9 {
            rc.on_success();
        }
        assert_eq!(rc.current_delay(), before, "no decrease before threshold");
        rc.on_success();
        assert_eq!(rc.current_delay(), before - Duration::from_millis(250));
    }

    #[test]
    fn test_success_runs_monotonically_non_increasing_until_floor() {
        let rc = controller();
        let mut prev = rc.current_delay();
        for _ in 0..200 {
            rc.on_success();
            let d = rc.current_delay();
            assert!(d <= prev);
            prev = d;
        }
        assert_eq!(prev, Duration::from_millis(500)); // floor reached
        rc.on_success();
        assert_eq!(rc.current_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_error_strictly_increases_until_ceiling() {
        let rc = controller();
        let mut prev = rc.current_delay();
        loop {
            rc.on_error();
            let d = rc.current_delay();
            if d == Duration::from_millis(10000) {
                break;
            }
            assert!(d > prev);
            prev = d;
        }
        rc.on_error();
        assert_eq!(rc.current_delay(), Duration::from_millis(10000));
    }

    #[test]
    fn test_error_resets_streak() {
        let rc = controller();
        for _ in 0..9 {
            rc.on_success();
        }
        rc.on_error();
        let after_error = rc.current_delay();
        // The streak restarted: one more success must not trigger a decrease
        rc.on_success();
        assert_eq!(rc.current_delay(), after_error);
    }

    #[test]
    fn test_initial_delay_clamped() {
        let rc = RateController::new(RateConfig {
            initial_delay_ms: 50,
            floor_ms: 500,
            ceiling_ms: 10000,
            ..RateConfig::default()
        });
        assert_eq!(rc.current_delay(), Duration::from_millis(500));
    }
}
