//! Randomized exponential backoff, as a reusable table.
//!
//! Two independent instances of this exist in the transport core: the
//! 8-entry table governing `Transport` reconnects (spec section 4.3) and the
//! 6-entry table governing the built-in post-connect state-synchronize
//! retry (spec section 4.4). They are kept as separate `RetryTable` values
//! rather than unified into one, matching the original implementation
//! having two distinct tables for the two call sites.

use std::time::Duration;

use rand::Rng;

/// `Transport`'s reconnect backoff ladder, in milliseconds.
pub(crate) const TRANSPORT_RETRY_TABLE_MS: &[u64] =
    &[250, 1000, 3000, 5000, 10000, 20000, 30000, 60000];

/// The built-in post-connect operation's own retry ladder, in milliseconds.
pub(crate) const POST_CONNECT_RETRY_TABLE_MS: &[u64] = &[250, 1000, 3000, 5000, 10000, 20000];

/// Percentage by which a delay may be randomized up or down.
const RANDOMIZATION_PERCENTAGE: u32 = 50;

/// A table of backoff delays with jittered lookups.
#[derive(Clone, Debug)]
pub(crate) struct RetryTable {
    entries: &'static [u64],
}

impl RetryTable {
    pub(crate) const fn new(entries: &'static [u64]) -> RetryTable {
        RetryTable { entries }
    }

    /// Compute the delay to wait before retry attempt `attempt` (1-indexed).
    ///
    /// Attempt numbers beyond the table's length reuse the table's last
    /// entry. The nominal delay is jittered uniformly within
    /// `[nominal / (1 + R), nominal * (1 + R)]` with `R = 0.5`.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize).min(self.entries.len() - 1);
        let nominal = self.entries[index];
        Self::jittered(nominal)
    }

    fn jittered(nominal_ms: u64) -> Duration {
        let low = (nominal_ms * 100) / (100 + RANDOMIZATION_PERCENTAGE as u64);
        let high = nominal_ms * (100 + RANDOMIZATION_PERCENTAGE as u64) / 100;
        let low = low.max(1);
        let high = high.max(low + 1);
        let millis = rand::thread_rng().gen_range(low..high);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_bounds_match_spec_scenario_5() {
        let table = RetryTable::new(TRANSPORT_RETRY_TABLE_MS);
        for attempt in 1..=4u32 {
            let nominal = TRANSPORT_RETRY_TABLE_MS[(attempt - 1) as usize];
            for _ in 0..200 {
                let d = table.delay_for_attempt(attempt).as_millis() as u64;
                assert!(
                    d >= nominal * 2 / 3 && d <= nominal * 3 / 2,
                    "attempt {attempt}: {d}ms out of bounds for nominal {nominal}ms"
                );
            }
        }
    }

    #[test]
    fn attempt_beyond_table_uses_last_entry() {
        let table = RetryTable::new(TRANSPORT_RETRY_TABLE_MS);
        let last = *TRANSPORT_RETRY_TABLE_MS.last().unwrap();
        for _ in 0..50 {
            let d = table.delay_for_attempt(99).as_millis() as u64;
            assert!(d >= last * 2 / 3 && d <= last * 3 / 2);
        }
    }

    #[test]
    fn post_connect_table_has_six_entries() {
        assert_eq!(POST_CONNECT_RETRY_TABLE_MS.len(), 6);
        assert_eq!(TRANSPORT_RETRY_TABLE_MS.len(), 8);
    }
}
