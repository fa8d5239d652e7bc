use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A lightweight counting semaphore, used to bound concurrent Modbus client handler threads
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: SemaphoreInner {
                permissions: <_>::default(),
                capacity,
                cv: Condvar::new(),
            }
            .into(),
        }
    }
    /// Tries to acquire permission, returns None if the capacity is exhausted
    pub fn try_acquire(&self) -> Option<SemaphoreGuard> {
        let mut count = self.inner.permissions.lock();
        if *count == self.inner.capacity {
            return None;
        }
        *count += 1;
        Some(SemaphoreGuard {
            inner: self.inner.clone(),
        })
    }
    /// Acquires permission, blocks until it is available
    #[allow(dead_code)]
    pub fn acquire(&self) -> SemaphoreGuard {
        let mut count = self.inner.permissions.lock();
        while *count == self.inner.capacity {
            self.inner.cv.wait(&mut count);
        }
        *count += 1;
        SemaphoreGuard {
            inner: self.inner.clone(),
        }
    }
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
    pub fn available(&self) -> usize {
        self.inner.capacity - *self.inner.permissions.lock()
    }
}

struct SemaphoreInner {
    permissions: Mutex<usize>,
    capacity: usize,
    cv: Condvar,
}

impl SemaphoreInner {
    fn release(&self) {
        let mut count = self.permissions.lock();
        *count -= 1;
        self.cv.notify_one();
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct SemaphoreGuard {
    inner: Arc<SemaphoreInner>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_semaphore() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.capacity(), 2);
        assert_eq!(sem.available(), 2);
        let _g1 = sem.acquire();
        let g2 = sem.try_acquire().unwrap();
        assert_eq!(sem.available(), 0);
        assert!(sem.try_acquire().is_none());
        drop(g2);
        assert_eq!(sem.available(), 1);
        let _g3 = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
    }
}
