//! Retry and processing-timeout strategies
//!
//! After a handler fails, the retry strategy decides whether the message
//! gets another attempt or is abandoned for good. The timeout strategy
//! bounds every handler invocation; slow messages surface as failures
//! instead of hanging a listener.

use crate::core::errors::MessagingError;
use crate::core::message::StoredMessage;
use std::time::Duration;

/// The verdict on a failed handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Count the attempt; the message becomes selectable again later
    Transient,
    /// Abandon the message; it will never be attempted again
    Permanent,
}

/// Decides whether a failed message is retried or abandoned
pub trait MessageRetryStrategy: Send + Sync {
    fn decide(&self, message: &StoredMessage, error: &MessagingError) -> RetryDecision;
}

/// Abandon once the next finished attempt would reach the cap
#[derive(Debug)]
pub struct AttemptCapRetryStrategy {
    max_attempts: i16,
}

impl AttemptCapRetryStrategy {
    pub fn new(max_attempts: i16) -> Self {
        Self { max_attempts }
    }
}

impl MessageRetryStrategy for AttemptCapRetryStrategy {
    fn decide(&self, message: &StoredMessage, _error: &MessagingError) -> RetryDecision {
        if message.finished_attempts + 1 >= self.max_attempts {
            RetryDecision::Permanent
        } else {
            RetryDecision::Transient
        }
    }
}

/// Bounds the wall-clock time of a handler invocation
pub trait ProcessingTimeoutStrategy: Send + Sync {
    fn timeout_for(&self, message: &StoredMessage) -> Duration;
}

/// The same timeout for every message
#[derive(Debug)]
pub struct FixedProcessingTimeout {
    timeout: Duration,
}

impl FixedProcessingTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ProcessingTimeoutStrategy for FixedProcessingTimeout {
    fn timeout_for(&self, _message: &StoredMessage) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::tests::test_message;
    use crate::core::message::Concurrency;

    #[test]
    fn retries_until_the_cap_is_one_away() {
        let strategy = AttemptCapRetryStrategy::new(5);
        let error = MessagingError::db("boom");

        let mut message = test_message(None, Concurrency::Sequential);
        message.finished_attempts = 0;
        assert_eq!(strategy.decide(&message, &error), RetryDecision::Transient);

        message.finished_attempts = 3;
        assert_eq!(strategy.decide(&message, &error), RetryDecision::Transient);

        // The fifth finished attempt is the last one
        message.finished_attempts = 4;
        assert_eq!(strategy.decide(&message, &error), RetryDecision::Permanent);
    }

    #[test]
    fn a_cap_of_one_never_retries() {
        let strategy = AttemptCapRetryStrategy::new(1);
        let error = MessagingError::db("boom");
        let message = test_message(None, Concurrency::Sequential);
        assert_eq!(strategy.decide(&message, &error), RetryDecision::Permanent);
    }

    #[test]
    fn fixed_timeout_ignores_the_message() {
        let strategy = FixedProcessingTimeout::new(Duration::from_secs(15));
        let message = test_message(None, Concurrency::Parallel);
        assert_eq!(strategy.timeout_for(&message), Duration::from_secs(15));
    }
}
