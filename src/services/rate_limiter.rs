// Adaptive request spacing for the image generation API.
//
// One limiter is shared by every run in the service, so its state sits
// behind a mutex. The lock is never held across an await: callers reserve
// their slot and then sleep outside the lock.

use crate::errors::PipelineError;
use crate::services::cancel::CancelToken;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterSnapshot {
    pub current_delay: Duration,
    pub consecutive_overloads: u32,
    /// Highest delay reached since the limiter was created.
    pub peak_delay: Duration,
}

struct LimiterState {
    current_delay: Duration,
    last_request: Option<Instant>,
    consecutive_overloads: u32,
    peak_delay: Duration,
}

pub struct RateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let max_delay = max_delay.max(min_delay);
        Self {
            min_delay,
            max_delay,
            state: Mutex::new(LimiterState {
                current_delay: min_delay,
                last_request: None,
                consecutive_overloads: 0,
                peak_delay: min_delay,
            }),
        }
    }

    /// Suspend the caller until `current_delay` has passed since the previous
    /// request, then record this request's time.
    pub async fn wait_before_request(&self, cancel: &CancelToken) -> Result<(), PipelineError> {
        let wait = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let wait = match state.last_request {
                Some(last) => (last + state.current_delay).saturating_duration_since(now),
                None => Duration::ZERO,
            };
            state.last_request = Some(now + wait);
            wait
        };

        if !wait.is_zero() {
            debug!("Rate limiter spacing request by {}ms", wait.as_millis());
        }
        cancel.sleep(wait).await
    }

    /// Record a rate-limit or overload signal from the remote service.
    pub fn on_overload(&self) {
        let mut state = self.state.lock();
        state.consecutive_overloads = state.consecutive_overloads.saturating_add(1);
        state.current_delay = self.delay_for(state.consecutive_overloads).min(self.max_delay);
        if state.current_delay > state.peak_delay {
            state.peak_delay = state.current_delay;
        }
        warn!(
            "Overload signal #{}: request spacing raised to {}ms",
            state.consecutive_overloads,
            state.current_delay.as_millis()
        );
    }

    /// Step one level back towards `min_delay` after a successful request.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_overloads > 0 {
            state.consecutive_overloads -= 1;
            state.current_delay = self
                .delay_for(state.consecutive_overloads)
                .max(self.min_delay)
                .min(self.max_delay);
            info!(
                "Request spacing relaxed to {}ms ({} overload levels left)",
                state.current_delay.as_millis(),
                state.consecutive_overloads
            );
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.state.lock().current_delay
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let state = self.state.lock();
        RateLimiterSnapshot {
            current_delay: state.current_delay,
            consecutive_overloads: state.consecutive_overloads,
            peak_delay: state.peak_delay,
        }
    }

    /// `min_delay * 2^level`, saturating.
    fn delay_for(&self, level: u32) -> Duration {
        match 1u32.checked_shl(level) {
            Some(factor) => self.min_delay.saturating_mul(factor),
            None => self.max_delay,
        }
    }
}
