//! Composite concurrency controller

use crate::concurrency::{ConcurrencyController, ConcurrencySlot, FullParallelController};
use crate::concurrency::mutex::{MutexController, SegmentMutexController};
use crate::core::errors::{MessagingError, MessagingResult};
use crate::core::message::{Concurrency, StoredMessage};
use async_trait::async_trait;
use std::sync::Arc;

type SelectorFn = dyn Fn(&StoredMessage) -> usize + Send + Sync;

/// Routes each message to one of several inner controllers
///
/// The selector maps a message to the index of the controller that should
/// govern it. Slots are acquired from and released to that controller only;
/// cancelling the composite cancels every inner controller.
pub struct MultiController {
    selector: Box<SelectorFn>,
    controllers: Vec<Arc<dyn ConcurrencyController>>,
}

impl MultiController {
    pub fn new(
        controllers: Vec<Arc<dyn ConcurrencyController>>,
        selector: impl Fn(&StoredMessage) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            selector: Box::new(selector),
            controllers,
        }
    }

    /// The typical mix: sequential messages share a global mutex while
    /// parallel messages run unrestricted
    pub fn sequential_or_parallel() -> Self {
        Self::new(
            vec![
                Arc::new(MutexController::new()),
                Arc::new(FullParallelController),
            ],
            |message| match message.concurrency {
                Concurrency::Sequential => 0,
                Concurrency::Parallel => 1,
            },
        )
    }

    /// Per-segment serialization for sequential messages, unrestricted
    /// parallel messages
    ///
    /// The right mix when something else already orders the segments
    /// globally, like the polling batch function.
    pub fn segment_or_parallel() -> Self {
        Self::new(
            vec![
                Arc::new(SegmentMutexController::new()),
                Arc::new(FullParallelController),
            ],
            |message| match message.concurrency {
                Concurrency::Sequential => 0,
                Concurrency::Parallel => 1,
            },
        )
    }
}

#[async_trait]
impl ConcurrencyController for MultiController {
    async fn acquire(&self, message: &StoredMessage) -> MessagingResult<ConcurrencySlot> {
        let index = (self.selector)(message);
        let controller = self.controllers.get(index).ok_or_else(|| {
            MessagingError::config(format!(
                "The concurrency selector chose controller {index} but only {} exist",
                self.controllers.len()
            ))
        })?;
        controller.acquire(message).await
    }

    fn cancel(&self) {
        for controller in &self.controllers {
            controller.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::tests::test_message;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn sequential_messages_share_the_mutex() {
        let controller = MultiController::sequential_or_parallel();
        let sequential = test_message(None, Concurrency::Sequential);
        let parallel = test_message(None, Concurrency::Parallel);

        let held = controller.acquire(&sequential).await.unwrap();

        // Another sequential message queues behind the mutex
        let blocked = timeout(Duration::from_millis(20), controller.acquire(&sequential)).await;
        assert!(blocked.is_err());

        // Parallel messages are not affected by the held mutex
        let free = timeout(Duration::from_millis(100), controller.acquire(&parallel)).await;
        assert!(free.is_ok());

        drop(held);
        let next = timeout(Duration::from_millis(100), controller.acquire(&sequential)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn segment_mix_lets_distinct_segments_run_concurrently() {
        let controller = MultiController::segment_or_parallel();
        let in_a = test_message(Some("A"), Concurrency::Sequential);
        let in_b = test_message(Some("B"), Concurrency::Sequential);

        let _slot_a = controller.acquire(&in_a).await.unwrap();
        let slot_b = timeout(Duration::from_millis(100), controller.acquire(&in_b)).await;
        assert!(slot_b.is_ok());

        let second_a = timeout(Duration::from_millis(20), controller.acquire(&in_a)).await;
        assert!(second_a.is_err(), "same segment is serialized");
    }

    #[tokio::test]
    async fn out_of_range_selection_is_an_error() {
        let controller = MultiController::new(vec![Arc::new(FullParallelController)], |_| 7);
        let message = test_message(None, Concurrency::Sequential);
        assert!(controller.acquire(&message).await.is_err());
    }

    #[tokio::test]
    async fn cancel_reaches_every_inner_controller() {
        let controller = MultiController::sequential_or_parallel();
        let sequential = test_message(None, Concurrency::Sequential);

        let _held = controller.acquire(&sequential).await.unwrap();
        controller.cancel();

        let result = controller.acquire(&sequential).await;
        assert!(result.is_err());
    }
}
