//! Shared worker pool for decoded calls.
//!
//! Method bodies run on tokio's blocking threads, never on a connection's
//! read task. The pool only bounds how many run at once: a call that cannot
//! get a permit immediately is rejected with SERVER_OVERLOADED rather than
//! queued.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded admission for method invocations. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` calls at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot without waiting. `None` means saturated or shut down.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Maximum concurrent calls.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse all further calls. Running calls finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturation() {
        let pool = WorkerPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_shutdown_rejects() {
        let pool = WorkerPool::new(4);
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.try_acquire().is_none());
    }
}
