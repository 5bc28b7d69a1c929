//! Concurrency controllers for message dispatch
//!
//! A controller mediates how many and which messages may be inside handler
//! execution at the same time. Listeners acquire a slot before invoking a
//! handler and release it by dropping the returned guard, which covers the
//! error path for free. Cancelling a controller fails every waiting acquirer
//! so shutdown never hangs on a queue.

pub mod multi;
pub mod mutex;
pub mod semaphore;

use crate::core::errors::MessagingResult;
use crate::core::message::StoredMessage;
use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;

pub use multi::MultiController;
pub use mutex::{DiscriminatingMutexController, MutexController, SegmentMutexController};
pub use semaphore::SemaphoreController;

/// A held concurrency slot; dropping it releases the slot
///
/// Both normal and exceptional completion paths release through the drop,
/// so a controller can never leak a slot to a failed dispatch.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencySlot {
    /// A slot that does not restrict anything
    pub fn unrestricted() -> Self {
        Self { _permit: None }
    }

    /// A slot backed by a semaphore permit
    pub fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: Some(permit),
        }
    }
}

/// Mediates concurrent handler execution
#[async_trait]
pub trait ConcurrencyController: Send + Sync {
    /// Wait for a slot appropriate for this message
    async fn acquire(&self, message: &StoredMessage) -> MessagingResult<ConcurrencySlot>;

    /// Drop every pending waiter with a cancellation error
    ///
    /// Already-held slots are not revoked; they release on drop as usual.
    fn cancel(&self);
}

/// A controller that never restricts anything
///
/// Every message may run alongside every other message.
#[derive(Debug, Default)]
pub struct FullParallelController;

#[async_trait]
impl ConcurrencyController for FullParallelController {
    async fn acquire(&self, _message: &StoredMessage) -> MessagingResult<ConcurrencySlot> {
        Ok(ConcurrencySlot::unrestricted())
    }

    fn cancel(&self) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::message::Concurrency;
    use chrono::Utc;
    use uuid::Uuid;

    /// A message with just enough shape for controller tests
    pub(crate) fn test_message(
        segment: Option<&str>,
        concurrency: Concurrency,
    ) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            aggregate_type: "order".to_string(),
            aggregate_id: "o-1".to_string(),
            message_type: "order_created".to_string(),
            segment: segment.map(str::to_string),
            concurrency,
            payload: serde_json::json!({}),
            metadata: None,
            locked_until: Utc::now(),
            created_at: Utc::now(),
            processed_at: None,
            abandoned_at: None,
            started_attempts: 0,
            finished_attempts: 0,
        }
    }

    #[tokio::test]
    async fn full_parallel_never_blocks() {
        let controller = FullParallelController;
        let message = test_message(None, Concurrency::Parallel);

        let _a = controller.acquire(&message).await.unwrap();
        let _b = controller.acquire(&message).await.unwrap();
        let _c = controller.acquire(&message).await.unwrap();
    }
}
