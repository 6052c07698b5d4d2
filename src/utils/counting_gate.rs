use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

/// Blocking permit counter.
///
/// Serves two roles in the pipeline: a classic bounded-resource semaphore
/// (see [`CountingGate::permit`]) and a completion gate, where every producer
/// releases once when it runs out of data and a bundle counts as drained once
/// the permit count reaches the number of outstanding obligations.
pub struct CountingGate {
    permits: Mutex<usize>,
    available: Condvar,
}

impl CountingGate {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes exactly one.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() {
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Returns one permit and wakes at most one waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Current permit count. Only a snapshot once other threads are involved.
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    /// Acquires a permit that is released again when the guard drops.
    pub fn permit(&self) -> GatePermit<'_> {
        self.acquire();
        GatePermit { gate: self }
    }
}

impl fmt::Debug for CountingGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingGate")
            .field("permits", &self.available())
            .finish()
    }
}

pub struct GatePermit<'a> {
    gate: &'a CountingGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
