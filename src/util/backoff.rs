use std::time::Duration;

use rand::Rng;

use crate::platform::runtime::now_millis;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::BoxedFuture;

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Delay calculator: the first attempt is immediate, each later one grows by
/// `backoff_factor` inside `[initial, max]` with ±50% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    settings: BackoffSettings,
    current_base_ms: f64,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base_ms: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.current_base_ms = 0.0;
    }

    /// The next delay will be the configured maximum.
    pub fn reset_to_max(&mut self) {
        self.current_base_ms = self.settings.max_delay_ms as f64;
    }

    pub fn current_base_ms(&self) -> f64 {
        self.current_base_ms
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base_ms;
        let jitter = if base > 0.0 {
            RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay = (base + jitter).round().max(0.0);

        let next = (base * self.settings.backoff_factor).clamp(
            self.settings.initial_delay_ms as f64,
            self.settings.max_delay_ms as f64,
        );
        self.current_base_ms = next;
        Duration::from_millis(delay as u64)
    }
}

/// Runs operations on an [`AsyncQueue`] after a backoff delay, discounting
/// time already elapsed since the previous attempt.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    backoff: Backoff,
    /// Wall-clock millis at which the previous attempt was due.
    last_attempt_ms: Option<i64>,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId, settings: BackoffSettings) -> Self {
        Self {
            queue,
            timer_id,
            backoff: Backoff::new(settings),
            last_attempt_ms: None,
            timer: None,
        }
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
    }

    pub fn reset_to_max(&mut self) {
        self.backoff.reset_to_max();
    }

    /// Cancels any pending attempt and schedules `op` after the next delay.
    pub fn backoff_and_run<F>(&mut self, op: F)
    where
        F: FnOnce() -> BoxedFuture<'static, ()> + crate::util::MaybeSend + 'static,
    {
        self.cancel();
        let desired = self.backoff.next_delay();
        let now = now_millis();
        let elapsed = elapsed_since(self.last_attempt_ms, now);
        let remaining = desired.saturating_sub(elapsed);
        if !desired.is_zero() {
            log::debug!(
                "backing off {:?} for {:?} (base delay {:?}, {:?} since last attempt)",
                self.timer_id,
                remaining,
                desired,
                elapsed
            );
        }
        self.last_attempt_ms = Some(now.saturating_add(remaining.as_millis() as i64));
        self.timer = Some(self.queue.enqueue_after_delay(self.timer_id, remaining, op));
    }

    /// Runs a pending attempt immediately.
    pub fn skip_backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.skip_delay();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Time since `last_attempt_ms`; zero when it lies in the future.
fn elapsed_since(last_attempt_ms: Option<i64>, now_ms: i64) -> Duration {
    last_attempt_ms
        .map(|last| Duration::from_millis(now_ms.saturating_sub(last).max(0) as u64))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = Backoff::new(BackoffSettings::default());
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base_ms(), 1_000.0);
    }

    #[test]
    fn delays_stay_within_jitter_bounds() {
        let mut backoff = Backoff::new(BackoffSettings::default());
        let mut rng = StdRng::seed_from_u64(42);
        backoff.next_delay_with_rng(&mut rng);
        let mut base = 1_000.0_f64;
        for _ in 0..20 {
            let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as f64;
            assert!(delay >= (base * 0.5).floor());
            assert!(delay <= (base * 1.5).ceil());
            base = (base * 1.5).min(60_000.0);
        }
        assert_eq!(backoff.current_base_ms(), 60_000.0);
    }

    #[test]
    fn reset_to_max_jumps_to_cap() {
        let mut backoff = Backoff::new(BackoffSettings::default());
        backoff.reset_to_max();
        let mut rng = StdRng::seed_from_u64(3);
        let delay = backoff.next_delay_with_rng(&mut rng).as_millis();
        assert!(delay >= 30_000);
        assert!(delay <= 90_000);
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }

    #[test]
    fn elapsed_time_is_measured_on_the_platform_clock() {
        let now = now_millis();
        assert_eq!(elapsed_since(None, now), Duration::ZERO);
        assert_eq!(elapsed_since(Some(now - 400), now), Duration::from_millis(400));
        assert_eq!(elapsed_since(Some(now + 250), now), Duration::ZERO);
    }
}
