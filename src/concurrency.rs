//! Backpressure for the engine's fan-out.
//!
//! The limit comes from the downloader's declared concurrency. A unit takes a
//! permit before its request enters the middleware chain and gives it back only
//! once the whole unit has resolved, so at most `capacity` units are ever past
//! the queue at the same time. A capacity of `0` disables limiting.

use crate::error::SpiderError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// A permit held for the lifetime of one unit. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit {
    _inner: Option<OwnedSemaphorePermit>,
}

/// Bounded permit counter, or a no-op when unbounded.
#[derive(Debug, Clone)]
pub struct Backpressure {
    semaphore: Option<Arc<Semaphore>>,
    capacity: usize,
}

impl Backpressure {
    pub fn new(capacity: usize) -> Self {
        Backpressure {
            semaphore: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Declared capacity. `0` when unbounded.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free. `usize::MAX` when unbounded.
    pub fn available(&self) -> usize {
        match &self.semaphore {
            Some(semaphore) => semaphore.available_permits(),
            None => usize::MAX,
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<Permit, SpiderError> {
        match &self.semaphore {
            Some(semaphore) => {
                let permit = Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| SpiderError::GeneralError(format!("backpressure closed: {e}")))?;
                Ok(Permit {
                    _inner: Some(permit),
                })
            }
            None => Ok(Permit { _inner: None }),
        }
    }

    /// Takes a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        match &self.semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(Permit {
                    _inner: Some(permit),
                }),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
            },
            None => Some(Permit { _inner: None }),
        }
    }
}
