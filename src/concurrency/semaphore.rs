//! Bounded concurrency controller

use crate::concurrency::{ConcurrencyController, ConcurrencySlot};
use crate::core::errors::{MessagingError, MessagingResult};
use crate::core::message::StoredMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// At most `n` messages in flight, FIFO
#[derive(Debug)]
pub struct SemaphoreController {
    semaphore: Arc<Semaphore>,
}

impl SemaphoreController {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
        }
    }
}

#[async_trait]
impl ConcurrencyController for SemaphoreController {
    async fn acquire(&self, _message: &StoredMessage) -> MessagingResult<ConcurrencySlot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MessagingError::ConcurrencyCancelled)?;
        Ok(ConcurrencySlot::from_permit(permit))
    }

    fn cancel(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::tests::test_message;
    use crate::core::errors::ErrorCode;
    use crate::core::message::Concurrency;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn allows_up_to_the_bound() {
        let controller = SemaphoreController::new(2);
        let message = test_message(None, Concurrency::Parallel);

        let first = controller.acquire(&message).await.unwrap();
        let _second = controller.acquire(&message).await.unwrap();

        let third = timeout(Duration::from_millis(20), controller.acquire(&message)).await;
        assert!(third.is_err(), "third acquire should be pending");

        drop(first);
        let third = timeout(Duration::from_millis(100), controller.acquire(&message)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn cancel_fails_pending_acquires() {
        let controller = SemaphoreController::new(1);
        let message = test_message(None, Concurrency::Parallel);

        let _held = controller.acquire(&message).await.unwrap();
        controller.cancel();

        let result = controller.acquire(&message).await;
        assert_eq!(
            result.unwrap_err().code(),
            ErrorCode::ConcurrencyCancelled
        );
    }
}
