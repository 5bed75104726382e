//! Optimistic many-reader / single-writer lock with reader-yield conflict
//! resolution
//!
//! Producer threads take optimistic read stamps on the connection map while
//! the actor thread takes the write side to perform connection transitions.
//! A reader that runs into a held write lock may itself be holding stamps the
//! blocked writer is waiting to invalidate, so blocking it could deadlock
//! AB/BA style. Instead of blocking, [`InversibleLock::optimistic_read`]
//! fails fast with [`CycleDetected`]: the reader releases everything it
//! holds, parks on [`CycleDetected::await_resolution`] until the writer is
//! done, and retries from its outermost entry point.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One-shot latch a parked reader waits on until the writer releases.
#[derive(Debug, Default)]
struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }
}

/// Raised to a reader that would otherwise block behind an in-progress write.
///
/// The caller must release every stamp it holds before parking, then retry
/// the whole operation once [`await_resolution`](Self::await_resolution)
/// returns.
#[derive(Debug, Clone, Error)]
#[error("lock is write-held, release stamps and retry")]
pub struct CycleDetected {
    latch: Arc<Latch>,
}

impl CycleDetected {
    /// Park until the writer that forced us out has released the lock.
    pub fn await_resolution(self) {
        self.latch.wait();
    }
}

/// An optimistic read-write lock whose conflict resolution is inverted:
/// readers yield to writers instead of blocking them.
///
/// The write sequence is strictly monotonic; an even value means unlocked,
/// odd means a writer is in. Readers validate their stamp against the
/// sequence after doing their (side-effect-free) work.
#[derive(Debug, Default)]
pub struct InversibleLock {
    /// Write sequence. Even: unlocked; odd: a writer holds the lock.
    seq: AtomicU64,
    /// Latch for the writer currently in, observed by yielding readers.
    latch: Mutex<Option<Arc<Latch>>>,
}

impl InversibleLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an optimistic read stamp.
    ///
    /// Never blocks: while a writer holds the lock this fails fast with
    /// [`CycleDetected`] carrying the writer's latch.
    pub fn optimistic_read(&self) -> Result<u64, CycleDetected> {
        loop {
            let stamp = self.seq.load(Ordering::Acquire);
            if stamp & 1 == 0 {
                return Ok(stamp);
            }
            if let Some(latch) = self.latch.lock().as_ref() {
                return Err(CycleDetected {
                    latch: Arc::clone(latch),
                });
            }
            // The writer is between bumping the sequence and publishing its
            // latch, or between clearing the latch and bumping the sequence.
            // Both windows are a few instructions wide.
            std::hint::spin_loop();
        }
    }

    /// Whether no writer has acquired the lock since `stamp` was taken.
    pub fn validate(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) == stamp
    }

    /// Acquire the write lock, returning the stamp to pass to
    /// [`unlock_write`](Self::unlock_write).
    pub fn write_lock(&self) -> u64 {
        loop {
            let current = self.seq.load(Ordering::Relaxed);
            if current & 1 != 0 {
                // Another writer is in; wait on its latch rather than spin.
                let latch = self.latch.lock().clone();
                match latch {
                    Some(latch) => latch.wait(),
                    None => std::hint::spin_loop(),
                }
                continue;
            }
            if self
                .seq
                .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                *self.latch.lock() = Some(Arc::new(Latch::default()));
                return current + 1;
            }
        }
    }

    /// Release the write lock and wake every parked reader.
    pub fn unlock_write(&self, stamp: u64) {
        debug_assert_eq!(stamp & 1, 1, "unlock_write called with a read stamp");
        let latch = self.latch.lock().take();
        self.seq.store(stamp.wrapping_add(1), Ordering::Release);
        if let Some(latch) = latch {
            latch.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_unlocked_read_validates() {
        let lock = InversibleLock::new();
        let stamp = lock.optimistic_read().unwrap();
        assert_eq!(stamp & 1, 0);
        assert!(lock.validate(stamp));
    }

    #[test]
    fn test_write_invalidates_earlier_stamp() {
        let lock = InversibleLock::new();
        let stamp = lock.optimistic_read().unwrap();
        let write = lock.write_lock();
        lock.unlock_write(write);
        assert!(!lock.validate(stamp));
        // A fresh stamp validates again
        let stamp = lock.optimistic_read().unwrap();
        assert!(lock.validate(stamp));
    }

    #[test]
    fn test_write_sequence_is_monotonic() {
        let lock = InversibleLock::new();
        let mut last = lock.optimistic_read().unwrap();
        for _ in 0..10 {
            let write = lock.write_lock();
            assert!(write > last);
            lock.unlock_write(write);
            let stamp = lock.optimistic_read().unwrap();
            assert!(stamp > last);
            last = stamp;
        }
    }

    #[test]
    fn test_reader_yields_while_write_held() {
        let lock = Arc::new(InversibleLock::new());
        let write = lock.write_lock();

        let err = lock.optimistic_read().expect_err("reader must yield");

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let released = Arc::clone(&released);
            thread::spawn(move || {
                err.await_resolution();
                released.store(true, Ordering::SeqCst);
            })
        };

        // The waiter stays parked while the write lock is held
        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));

        lock.unlock_write(write);
        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));

        // And reads go through again
        let stamp = lock.optimistic_read().unwrap();
        assert!(lock.validate(stamp));
    }

    #[test]
    fn test_second_writer_waits_for_first() {
        let lock = Arc::new(InversibleLock::new());
        let first = lock.write_lock();

        let second = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let stamp = lock.write_lock();
                lock.unlock_write(stamp);
                stamp
            })
        };

        thread::sleep(Duration::from_millis(20));
        lock.unlock_write(first);
        let second = second.join().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_no_torn_reads_under_contention() {
        // Two words kept equal under the write lock; a validated optimistic
        // read must never observe them differing.
        let lock = Arc::new(InversibleLock::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));

        let writer = {
            let (lock, a, b) = (Arc::clone(&lock), Arc::clone(&a), Arc::clone(&b));
            thread::spawn(move || {
                for i in 1..=1000u64 {
                    let stamp = lock.write_lock();
                    a.store(i, Ordering::Relaxed);
                    b.store(i, Ordering::Relaxed);
                    lock.unlock_write(stamp);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (lock, a, b) = (Arc::clone(&lock), Arc::clone(&a), Arc::clone(&b));
                thread::spawn(move || {
                    let mut validated = 0u32;
                    while validated < 500 {
                        let stamp = match lock.optimistic_read() {
                            Ok(stamp) => stamp,
                            Err(cycle) => {
                                cycle.await_resolution();
                                continue;
                            }
                        };
                        let seen_a = a.load(Ordering::Relaxed);
                        let seen_b = b.load(Ordering::Relaxed);
                        if lock.validate(stamp) {
                            assert_eq!(seen_a, seen_b, "torn read slipped past validation");
                            validated += 1;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
