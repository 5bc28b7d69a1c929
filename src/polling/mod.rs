//! Polling module for the batch-function listener engine
//!
//! This module contains the listener that drives a database function which
//! atomically selects and locks the next batch of unprocessed messages.

pub mod batch;
pub mod listener;

// Re-export for convenience
pub use batch::{
    BatchSizeStrategy, FixedIntervalSchedule, PollingScheduleStrategy, WarmupBatchSizeStrategy,
};
pub use listener::{
    PollingListenerStrategies, PollingMessageListener, initialize_polling_message_listener,
};
