use super::{LockStatus, Timeout};
use crate::{
    error::ThreadError,
    vm::{
        backend::{Backend, ThreadBackend, WaitEvent, WaitOutcome, WaitPrimitive},
        metrics::RuntimeMetrics,
        sync::{Arc, AtomicBool, AtomicUsize, Ordering},
    },
};
use tracing::{trace, warn};

/// General-purpose lock for runtime code that is not the GIL.
///
/// Not owned by a thread: any thread may release it, like the lock objects of
/// the interpreted language. Releasing an unlocked lock is reported as
/// [`ThreadError::BadLock`] instead of aborting.
#[derive(Debug)]
pub struct ThreadLock {
    locked: AtomicBool,
    waiters: AtomicUsize,
    event: WaitEvent,
    backend: Backend,
    metrics: Arc<RuntimeMetrics>,
}

impl ThreadLock {
    pub fn new(backend: &Backend) -> Self {
        Self::with_metrics(backend, Arc::new(RuntimeMetrics::new()))
    }

    pub fn with_metrics(backend: &Backend, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            event: backend.new_event(),
            backend: *backend,
            metrics,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Blocking (`true`) or polling (`false`) acquire. A blocking acquire is
    /// not interruptible and always succeeds eventually.
    pub fn acquire(&self, blocking: bool) -> bool {
        let timeout = if blocking {
            Timeout::INFINITE
        } else {
            Timeout::NON_BLOCKING
        };
        self.acquire_inner(timeout, false).is_acquired()
    }

    /// Acquire within `timeout`, giving up early on an interruption.
    pub fn acquire_timed(&self, timeout: Timeout) -> LockStatus {
        self.acquire_inner(timeout, true)
    }

    fn acquire_inner(&self, timeout: Timeout, interruptible: bool) -> LockStatus {
        let status = if self.try_acquire() {
            LockStatus::Acquired
        } else if timeout.is_non_blocking() {
            LockStatus::Failure
        } else {
            self.acquire_contended(timeout, interruptible)
        };
        self.metrics.record_lock_status(status);
        status
    }

    #[cold]
    fn acquire_contended(&self, timeout: Timeout, interruptible: bool) -> LockStatus {
        let start = self.backend.now();
        let deadline = timeout.deadline_from(start);
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let status = loop {
            let ticket = self.event.prepare();
            if self.try_acquire() {
                break LockStatus::Acquired;
            }
            let remaining = match deadline {
                None => Timeout::INFINITE,
                Some(deadline) => {
                    let now = self.backend.now();
                    if now >= deadline {
                        break LockStatus::Failure;
                    }
                    Timeout::from_duration(deadline - now)
                }
            };
            match self.event.wait(ticket, remaining) {
                WaitOutcome::Interrupted if interruptible => break LockStatus::Interrupted,
                // Signals can be spurious and timeouts are re-checked above.
                _ => {}
            }
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        match status {
            LockStatus::Acquired => self.metrics.record_lock_contention(start.elapsed()),
            _ => {
                self.pass_on_wakeup();
                trace!(?status, "timed lock acquire gave up");
            }
        }
        status
    }

    /// Called by a waiter that gave up: it may have swallowed the wakeup meant
    /// for a waiter that stays parked.
    fn pass_on_wakeup(&self) {
        if !self.is_locked() && self.waiters.load(Ordering::SeqCst) > 0 {
            self.event.signal_one();
        }
    }

    pub fn release(&self) -> Result<(), ThreadError> {
        if !self.locked.swap(false, Ordering::SeqCst) {
            return Err(ThreadError::BadLock);
        }
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.event.signal_one();
        }
        Ok(())
    }

    /// Interrupt every thread currently in [`ThreadLock::acquire_timed`].
    /// Backends without interruptible waits ignore this.
    pub fn interrupt(&self) {
        self.event.interrupt();
    }

    /// Blocking acquire returning a guard that releases on drop.
    pub fn lock(&self) -> ThreadLockGuard<'_> {
        self.acquire(true);
        ThreadLockGuard { lock: self }
    }
}

pub struct ThreadLockGuard<'a> {
    lock: &'a ThreadLock,
}

impl Drop for ThreadLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("lock guard dropped after the lock was released elsewhere: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::backend::BackendKind;
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    fn lock(kind: BackendKind) -> Arc<ThreadLock> {
        Arc::new(ThreadLock::new(&kind.build()))
    }

    #[test]
    fn test_non_blocking_acquire_on_held_lock() {
        for kind in [BackendKind::Posix, BackendKind::NativeWindows] {
            let lock = lock(kind);
            assert!(lock.acquire(false));
            assert!(!lock.acquire(false));
            let start = Instant::now();
            assert_eq!(lock.acquire_timed(Timeout::NON_BLOCKING), LockStatus::Failure);
            assert!(start.elapsed() < Duration::from_millis(50));
            lock.release().unwrap();
        }
    }

    #[test]
    fn test_release_unlocked_is_bad_lock() {
        let lock = lock(BackendKind::Posix);
        assert!(matches!(lock.release(), Err(ThreadError::BadLock)));
    }

    #[test]
    fn test_timed_acquire_times_out() {
        for kind in [BackendKind::Posix, BackendKind::NativeWindows] {
            let lock = lock(kind);
            lock.acquire(true);
            let start = Instant::now();
            assert_eq!(
                lock.acquire_timed(Timeout::from_millis(20)),
                LockStatus::Failure
            );
            assert!(start.elapsed() >= Duration::from_millis(20));
            lock.release().unwrap();
        }
    }

    #[test]
    fn test_released_by_other_thread() {
        for kind in [BackendKind::Posix, BackendKind::NativeWindows] {
            let lock = lock(kind);
            lock.acquire(true);
            let releaser = {
                let lock = lock.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    lock.release().unwrap();
                })
            };
            assert_eq!(lock.acquire_timed(Timeout::INFINITE), LockStatus::Acquired);
            releaser.join().unwrap();
            lock.release().unwrap();
        }
    }

    #[test]
    fn test_interrupt_on_posix() {
        let lock = lock(BackendKind::Posix);
        lock.acquire(true);
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire_timed(Timeout::from_millis(5_000)))
        };
        while lock.waiters.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        lock.interrupt();
        assert_eq!(waiter.join().unwrap(), LockStatus::Interrupted);
        assert!(lock.is_locked());
        lock.release().unwrap();
    }

    #[test]
    fn test_guard_releases() {
        let lock = lock(BackendKind::Posix);
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_waiter_that_gives_up_passes_wakeup_on() {
        for kind in [BackendKind::Posix, BackendKind::NativeWindows] {
            let lock = lock(kind);
            lock.acquire(true);
            let (tx, rx) = mpsc::channel();
            let stays = {
                let lock = lock.clone();
                thread::spawn(move || tx.send(lock.acquire_timed(Timeout::INFINITE)).unwrap())
            };
            while lock.waiters.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(10));

            // Freed, but the signal went to a waiter that has since left.
            lock.locked.store(false, Ordering::SeqCst);
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

            lock.pass_on_wakeup();
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                LockStatus::Acquired
            );
            stays.join().unwrap();
            lock.release().unwrap();
        }
    }

    #[test]
    fn test_release_at_timeout_still_wakes_indefinite_waiter() {
        for kind in [BackendKind::Posix, BackendKind::NativeWindows] {
            for _ in 0..10 {
                let lock = lock(kind);
                lock.acquire(true);
                let deadline = Instant::now() + Duration::from_millis(30);

                let short = {
                    let lock = lock.clone();
                    thread::spawn(move || {
                        if lock.acquire_timed(Timeout::from_millis(30)).is_acquired() {
                            lock.release().unwrap();
                        }
                    })
                };
                let (tx, rx) = mpsc::channel();
                let patient = {
                    let lock = lock.clone();
                    thread::spawn(move || {
                        let status = lock.acquire_timed(Timeout::INFINITE);
                        lock.release().unwrap();
                        tx.send(status).unwrap();
                    })
                };
                while lock.waiters.load(Ordering::SeqCst) < 2 {
                    thread::yield_now();
                }
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                lock.release().unwrap();

                assert_eq!(
                    rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                    LockStatus::Acquired
                );
                short.join().unwrap();
                patient.join().unwrap();
            }
        }
    }
}
