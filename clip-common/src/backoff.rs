use std::time;

/// Backoff policy for a worker polling an empty queue: double the base
/// interval for every consecutive empty poll, capped both by an exponent
/// ceiling and an absolute maximum.
#[derive(Copy, Clone, Debug)]
pub struct PollBackoff {
    base_interval: time::Duration,
    maximum_interval: time::Duration,
}

/// Past this many consecutive empty polls the delay stops growing.
const MAX_EXPONENT: u32 = 5;

impl PollBackoff {
    pub fn new(base_interval: time::Duration, maximum_interval: time::Duration) -> Self {
        Self {
            base_interval,
            maximum_interval,
        }
    }

    /// Delay before the next poll after `consecutive_empty` polls came
    /// back empty. The first empty poll waits the base interval.
    pub fn delay(&self, consecutive_empty: u32) -> time::Duration {
        let exponent = consecutive_empty.saturating_sub(1).min(MAX_EXPONENT);
        let candidate = self.base_interval * 2u32.pow(exponent);
        std::cmp::min(candidate, self.maximum_interval)
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            base_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(30),
        }
    }
}
