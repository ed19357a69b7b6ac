// ReconnectBackoff - exponential delay between upstream reconnect attempts

use std::time::Duration;

/// Exponential reconnect delay: `min(max, base * 2^attempts)`.
///
/// Each call to `next_delay` consumes one attempt, so consecutive
/// unexpected closes yield base, 2*base, 4*base and so on up to `max`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        // 2^31 * base overflows long before it matters; saturate instead
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
