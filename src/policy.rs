//! Redelivery and prefetch policies.

use serde::{Deserialize, Serialize};

/// Sentinel for an unlimited redelivery allowance.
pub const NO_MAXIMUM_REDELIVERIES: i32 = -1;

/// How rolled-back messages are retried before being poisoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    /// Delay before the first redelivery, in milliseconds.
    pub initial_redelivery_delay: u64,
    /// Multiplier applied per redelivery when exponential backoff is on.
    pub back_off_multiplier: f64,
    pub use_exponential_back_off: bool,
    /// Redeliveries allowed before a poison ack; `-1` means unlimited.
    pub maximum_redeliveries: i32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            initial_redelivery_delay: 1_000,
            back_off_multiplier: 5.0,
            use_exponential_back_off: false,
            maximum_redeliveries: 6,
        }
    }
}

impl RedeliveryPolicy {
    /// The next backoff step given the previous delay.
    pub fn redelivery_delay(&self, previous: u64) -> u64 {
        if previous == 0 {
            self.initial_redelivery_delay
        } else if self.use_exponential_back_off {
            (previous as f64 * self.back_off_multiplier) as u64
        } else {
            previous
        }
    }

    /// Whether a message at `redelivery_counter` has exhausted its allowance.
    pub fn is_exhausted(&self, redelivery_counter: i32) -> bool {
        self.maximum_redeliveries != NO_MAXIMUM_REDELIVERIES
            && redelivery_counter > self.maximum_redeliveries
    }
}

/// What a redelivery delay holds up.
///
/// `GateDeliveries` arms a deadline on the consumer's unconsumed channel so
/// only new deliveries wait; `HoldDispatch` sleeps the rollback caller
/// itself until the delay passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RedeliveryDelayPolicy {
    #[default]
    GateDeliveries,
    HoldDispatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_the_initial_delay() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.redelivery_delay(0), 1_000);
    }

    #[test]
    fn flat_backoff_repeats_the_delay() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.redelivery_delay(1_000), 1_000);
    }

    #[test]
    fn exponential_backoff_multiplies() {
        let policy = RedeliveryPolicy {
            use_exponential_back_off: true,
            ..RedeliveryPolicy::default()
        };
        assert_eq!(policy.redelivery_delay(1_000), 5_000);
    }

    #[test]
    fn unlimited_policy_never_exhausts() {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: NO_MAXIMUM_REDELIVERIES,
            ..RedeliveryPolicy::default()
        };
        assert!(!policy.is_exhausted(i32::MAX));
    }

    #[test]
    fn capped_policy_exhausts_past_the_cap() {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 2,
            ..RedeliveryPolicy::default()
        };
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }
}
