//! Worker Pool - shared execution capacity for every build in the composite
//!
//! A lease is one semaphore permit. A task holds its lease while it does
//! work and hands it back while parked in a cross-build wait, so a pool of
//! N workers never deadlocks on N tasks that are all waiting.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task;
use tracing::{debug, warn};

/// Fixed-size pool shared by all builds
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently leased
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<WorkerLease, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(WorkerLease {
            semaphore: Arc::clone(&self.semaphore),
            slot: Mutex::new(LeaseSlot {
                permit: Some(permit),
                waits: 0,
            }),
        })
    }
}

#[derive(Debug)]
struct LeaseSlot {
    permit: Option<OwnedSemaphorePermit>,
    /// Waits in progress. The permit is only held while this is zero.
    waits: usize,
}

/// A held worker slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct WorkerLease {
    semaphore: Arc<Semaphore>,
    slot: Mutex<LeaseSlot>,
}

impl WorkerLease {
    pub fn is_held(&self) -> bool {
        self.lock().permit.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeaseSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter a wait: give the slot back to the pool. Returns whether a slot
    /// was actually released.
    pub fn release(&self) -> bool {
        let mut slot = self.lock();
        slot.waits += 1;
        let released = slot.permit.take().is_some();
        if released {
            debug!("worker lease released");
        }
        released
    }

    /// Leave a wait. The slot is taken back once the last concurrent wait of
    /// this lease has finished.
    ///
    /// Cancelling this future before it completes leaves the wait entered;
    /// use `park` when the caller can be cancelled.
    pub async fn reacquire(&self) -> Result<(), AcquireError> {
        {
            let mut slot = self.lock();
            if slot.waits > 1 || slot.permit.is_some() {
                slot.waits = slot.waits.saturating_sub(1);
                return Ok(());
            }
        }

        // Last wait out: the wait stays counted until a slot is in hand
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        self.leave_with(Some(permit));
        Ok(())
    }

    fn leave_with(&self, permit: Option<OwnedSemaphorePermit>) {
        let mut slot = self.lock();
        slot.waits = slot.waits.saturating_sub(1);
        // Another wait may have started while we were queued for a permit
        if slot.waits == 0 && slot.permit.is_none() {
            if let Some(permit) = permit {
                slot.permit = Some(permit);
                debug!("worker lease reacquired");
            }
        }
    }

    /// Release the slot for the lifetime of the returned guard.
    ///
    /// `ParkedLease::resume` takes the slot back. If the guard is dropped
    /// instead (the waiting future was cancelled) the slot is taken back
    /// on drop, blocking the thread when the pool is full.
    pub fn park(self: &Arc<Self>) -> ParkedLease {
        self.release();
        ParkedLease {
            lease: Arc::clone(self),
            done: false,
        }
    }

    /// Drop-time reacquire for a wait that was cancelled
    fn reclaim(self: &Arc<Self>) {
        {
            let slot = self.lock();
            if slot.waits > 1 || slot.permit.is_some() {
                drop(slot);
                self.leave_with(None);
                return;
            }
        }

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return self.leave_with(Some(permit)),
            Err(TryAcquireError::Closed) => return self.leave_with(None),
            Err(TryAcquireError::NoPermits) => {}
        }

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let semaphore = Arc::clone(&self.semaphore);
                let permit = task::block_in_place(|| handle.block_on(semaphore.acquire_owned()));
                self.leave_with(permit.ok());
            }
            Ok(handle) => {
                // A single-threaded runtime cannot block here; take the slot back asynchronously
                warn!("cancelled wait on a current-thread runtime; worker slot is reclaimed in the background");
                let lease = Arc::clone(self);
                handle.spawn(async move {
                    let permit = Arc::clone(&lease.semaphore).acquire_owned().await;
                    lease.leave_with(permit.ok());
                });
            }
            Err(_) => self.leave_with(None),
        }
    }
}

/// A worker slot lent back to the pool while its task is parked
#[derive(Debug)]
#[must_use = "dropping the guard immediately takes the slot back"]
pub struct ParkedLease {
    lease: Arc<WorkerLease>,
    done: bool,
}

impl ParkedLease {
    /// Leave the wait and take the slot back
    pub async fn resume(mut self) -> Result<(), AcquireError> {
        let result = self.lease.reacquire().await;
        self.done = true;
        result
    }
}

impl Drop for ParkedLease {
    fn drop(&mut self) {
        if !self.done {
            self.lease.reclaim();
        }
    }
}
