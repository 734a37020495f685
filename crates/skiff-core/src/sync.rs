// src/sync.rs
use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Return `n` permits and wake up to `n` waiters.
    pub fn release(&self, n: usize) {
        let mut permits = self.permits.lock();
        *permits += n;
        drop(permits);
        if n == 1 {
            self.available.notify_one();
        } else if n > 1 {
            self.available.notify_all();
        }
    }
}
