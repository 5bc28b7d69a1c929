//! Batch sizing and scheduling strategies for the polling listener

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Decides how many rows the next poll may fetch
pub trait BatchSizeStrategy: Send + Sync {
    fn next_batch_size(&self) -> usize;
}

/// Fetch single messages right after startup, full batches afterwards
///
/// A listener that crashed on a poisonous message would otherwise re-fetch
/// a whole batch on restart and turn one bad message into a batch of
/// failures. The first `configured` polls fetch one row each; once that
/// warmup is over the configured batch size applies.
pub struct WarmupBatchSizeStrategy {
    configured: usize,
    polls: AtomicUsize,
}

impl WarmupBatchSizeStrategy {
    pub fn new(configured: usize) -> Self {
        Self {
            configured,
            polls: AtomicUsize::new(0),
        }
    }
}

impl BatchSizeStrategy for WarmupBatchSizeStrategy {
    fn next_batch_size(&self) -> usize {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed);
        if poll < self.configured {
            1
        } else {
            self.configured
        }
    }
}

/// Decides how long to sleep once a poll comes back empty
pub trait PollingScheduleStrategy: Send + Sync {
    fn next_delay(&self) -> Duration;
}

/// A fixed sleep between empty polls
pub struct FixedIntervalSchedule {
    interval: Duration,
}

impl FixedIntervalSchedule {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl PollingScheduleStrategy for FixedIntervalSchedule {
    fn next_delay(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_returns_single_rows_first() {
        let strategy = WarmupBatchSizeStrategy::new(3);
        assert_eq!(strategy.next_batch_size(), 1);
        assert_eq!(strategy.next_batch_size(), 1);
        assert_eq!(strategy.next_batch_size(), 1);
        assert_eq!(strategy.next_batch_size(), 3);
        assert_eq!(strategy.next_batch_size(), 3);
    }

    #[test]
    fn a_batch_size_of_one_never_changes() {
        let strategy = WarmupBatchSizeStrategy::new(1);
        assert_eq!(strategy.next_batch_size(), 1);
        assert_eq!(strategy.next_batch_size(), 1);
    }

    #[test]
    fn fixed_schedule_repeats_the_interval() {
        let schedule = FixedIntervalSchedule::new(Duration::from_millis(500));
        assert_eq!(schedule.next_delay(), Duration::from_millis(500));
        assert_eq!(schedule.next_delay(), Duration::from_millis(500));
    }
}
