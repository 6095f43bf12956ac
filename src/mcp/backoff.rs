//! Exponential backoff calculator for service connection retries.
//!
//! The wait before retry `n` (0-indexed) is `min(max(floor, 2^n seconds), cap)`.
//! With the default 1s floor and 60s cap that yields:
//! 1s, 2s, 4s, 8s, 16s, 32s, 60s, 60s...

use std::time::Duration;

/// Exponential backoff calculator.
///
/// # Example
///
/// ```
/// use mcpmux::mcp::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::with_floor(Duration::from_secs(3));
///
/// // The configured floor wins while 2^n is smaller
/// assert_eq!(backoff.next_delay(), Duration::from_secs(3));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(3));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(4));
///
/// backoff.reset();
/// assert_eq!(backoff.attempt(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Number of delays handed out so far
    attempt: u32,
    /// Minimum wait (the configured retry delay)
    floor: Duration,
    /// Maximum delay cap
    max: Duration,
}

impl Backoff {
    /// Default floor: 1 second
    const DEFAULT_FLOOR: Duration = Duration::from_secs(1);
    /// Default cap: 60 seconds
    pub const DEFAULT_MAX: Duration = Duration::from_secs(60);

    /// Create a backoff calculator with a 1s floor and 60s cap.
    pub fn new() -> Self {
        Self::with_config(Self::DEFAULT_FLOOR, Self::DEFAULT_MAX)
    }

    /// Create a backoff calculator with the given floor and the 60s cap.
    pub fn with_floor(floor: Duration) -> Self {
        Self::with_config(floor, Self::DEFAULT_MAX)
    }

    /// Create a backoff calculator with custom floor and cap.
    pub fn with_config(floor: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            floor,
            max,
        }
    }

    /// Calculate the next delay and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// What the next delay would be, without incrementing.
    pub fn current_delay(&self) -> Duration {
        // delay = min(max(floor, 2^attempt s), max)
        let exp_secs = 2u64.saturating_pow(self.attempt);
        let exp = Duration::from_secs(exp_secs);
        exp.max(self.floor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
