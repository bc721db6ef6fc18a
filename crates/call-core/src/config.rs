//! Configuration for the call orchestration core

use std::time::Duration;

/// Structural constants of the orchestration core.
///
/// These are process-lifetime settings. Preferences that can change while
/// the app runs (low-data preference, IP hiding) live behind
/// [`crate::host::CallPolicy`] instead.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Join a call link or group call muted when at least this many
    /// participants are already present.
    pub auto_mute_participant_threshold: usize,

    /// How long an incoming offer may sit unconnected before the call is
    /// failed with a timeout.
    pub incoming_offer_grace_period: Duration,

    /// How long a cancelled ring id is remembered so a late-arriving
    /// ring request for it can be ignored.
    pub cancelled_ring_expiry: Duration,

    /// Retry schedule for the background call link fetch loop.
    pub link_fetch_backoff: FetchBackoff,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            auto_mute_participant_threshold: 8,
            incoming_offer_grace_period: Duration::from_secs(60),
            cancelled_ring_expiry: Duration::from_secs(30 * 60),
            link_fetch_backoff: FetchBackoff::default(),
        }
    }
}

/// Exponential backoff schedule for failed call link fetches.
///
/// Delays grow strictly with the consecutive failure count until they hit
/// the ceiling, so a persistently failing room cannot spin the fetch loop.
#[derive(Debug, Clone)]
pub struct FetchBackoff {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for FetchBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl FetchBackoff {
    /// Delay to wait after the `failure_count`-th consecutive failure.
    /// `failure_count` starts at 1.
    pub fn delay(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(63);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_grows_strictly_until_capped() {
        let backoff = FetchBackoff::default();
        let mut previous = Duration::ZERO;
        for failure_count in 1..=12 {
            let delay = backoff.delay(failure_count);
            if delay < backoff.max_delay {
                assert!(delay > previous, "delay must grow until the cap");
            }
            assert!(delay <= backoff.max_delay);
            previous = delay;
        }
        assert_eq!(backoff.delay(64), backoff.max_delay);
    }

    #[test]
    fn backoff_first_delay_is_initial() {
        let backoff = FetchBackoff::default();
        assert_eq!(backoff.delay(1), backoff.initial_delay);
        assert_eq!(backoff.delay(2), backoff.initial_delay * 2);
    }
}
