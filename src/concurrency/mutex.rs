//! Mutual exclusion controllers
//!
//! The global mutex serializes everything; the keyed variants serialize per
//! segment or per caller-chosen discriminator while unrelated keys proceed
//! in parallel. All of them hand out slots in FIFO acquisition order.

use crate::concurrency::{ConcurrencyController, ConcurrencySlot};
use crate::core::errors::{MessagingError, MessagingResult};
use crate::core::message::StoredMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// One message in flight at a time, FIFO
///
/// Backed by a fair semaphore with a single permit, so waiters are served
/// strictly in acquisition order.
#[derive(Debug)]
pub struct MutexController {
    semaphore: Arc<Semaphore>,
}

impl MutexController {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }
}

impl Default for MutexController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConcurrencyController for MutexController {
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

type KeyFn = dyn Fn(&StoredMessage) -> String + Send + Sync;

/// One message in flight per discriminator value
///
/// The discriminator is a caller-provided function over the message;
/// messages with distinct discriminators proceed in parallel while messages
/// sharing one are handled FIFO. The key map lock is a plain mutex, never
/// held across an await.
pub struct DiscriminatingMutexController {
    discriminator: Box<KeyFn>,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    cancelled: AtomicBool,
}

impl DiscriminatingMutexController {
    pub fn new(discriminator: impl Fn(&StoredMessage) -> String + Send + Sync + 'static) -> Self {
        Self {
            discriminator: Box::new(discriminator),
            locks: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ConcurrencyController for DiscriminatingMutexController {
    async fn acquire(&self, message: &StoredMessage) -> MessagingResult<ConcurrencySlot> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(MessagingError::ConcurrencyCancelled);
        }

        let key = (self.discriminator)(message);
        let semaphore = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| MessagingError::ConcurrencyCancelled)?;
        Ok(ConcurrencySlot::from_permit(permit))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Fail the waiters queued on every key seen so far. The flag above
        // covers keys that show up later.
        let locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for semaphore in locks.values() {
            semaphore.close();
        }
    }
}

/// One message in flight per segment value
///
/// Messages without a segment share a single implicit segment, keeping them
/// strictly ordered among themselves as well.
pub struct SegmentMutexController {
    inner: DiscriminatingMutexController,
}

impl SegmentMutexController {
    pub fn new() -> Self {
        Self {
            inner: DiscriminatingMutexController::new(|message| {
                message.segment.clone().unwrap_or_default()
            }),
        }
    }
}

impl Default for SegmentMutexController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConcurrencyController for SegmentMutexController {
    async fn acquire(&self, message: &StoredMessage) -> MessagingResult<ConcurrencySlot> {
        self.inner.acquire(message).await
    }

    fn cancel(&self) {
        self.inner.cancel();
    }
}
