use crate::vm::sync::{AtomicU64, LockStatus, Ordering};
use serde::Serialize;
use std::time::Duration;

/// Metrics counters.
///
/// All counters use `Ordering::Relaxed` because they are independent and do not
/// synchronize memory between threads. We only care that they are updated
/// atomically, not when those updates become visible to other threads relative
/// to other memory operations.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// GIL acquisitions that succeeded on the first compare-and-swap
    pub gil_fast_acquires: AtomicU64,
    /// GIL acquisitions that had to park at least once
    pub gil_slow_acquires: AtomicU64,
    /// Total time spent parked waiting for the GIL (in microseconds)
    pub gil_contention_total_us: AtomicU64,
    pub gil_yields: AtomicU64,
    /// Yields where another thread took the GIL before the yielder re-acquired
    pub gil_handoffs: AtomicU64,
    pub gil_handoff_timeouts: AtomicU64,
    pub lock_acquired: AtomicU64,
    pub lock_failures: AtomicU64,
    pub lock_interrupts: AtomicU64,
    /// Number of times a thread had to block waiting for a general lock
    pub lock_contention_count: AtomicU64,
    /// Total time spent waiting for general locks (in microseconds)
    pub lock_contention_total_us: AtomicU64,
    pub threads_spawned: AtomicU64,
    pub threads_exited: AtomicU64,
    pub spawn_failures: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_gil_fast_acquire(&self) {
        self.gil_fast_acquires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gil_contention(&self, duration: Duration) {
        self.gil_slow_acquires.fetch_add(1, Ordering::Relaxed);
        self.gil_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gil_yield(&self) {
        self.gil_yields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gil_handoff(&self, completed: bool) {
        if completed {
            self.gil_handoffs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.gil_handoff_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lock_status(&self, status: LockStatus) {
        let counter = match status {
            LockStatus::Acquired => &self.lock_acquired,
            LockStatus::Failure => &self.lock_failures,
            LockStatus::Interrupted => &self.lock_interrupts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self, duration: Duration) {
        self.lock_contention_count.fetch_add(1, Ordering::Relaxed);
        self.lock_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_thread_spawned(&self) {
        self.threads_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thread_exited(&self) {
        self.threads_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spawn_failure(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            gil: GilStats {
                fast_acquires: load(&self.gil_fast_acquires),
                slow_acquires: load(&self.gil_slow_acquires),
                contention_total_us: load(&self.gil_contention_total_us),
                yields: load(&self.gil_yields),
                handoffs: load(&self.gil_handoffs),
                handoff_timeouts: load(&self.gil_handoff_timeouts),
            },
            locks: LockStats {
                acquired: load(&self.lock_acquired),
                failures: load(&self.lock_failures),
                interrupts: load(&self.lock_interrupts),
                contention_count: load(&self.lock_contention_count),
                contention_total_us: load(&self.lock_contention_total_us),
            },
            threads: ThreadStats {
                spawned: load(&self.threads_spawned),
                exited: load(&self.threads_exited),
                spawn_failures: load(&self.spawn_failures),
            },
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct GilStats {
    pub fast_acquires: u64,
    pub slow_acquires: u64,
    pub contention_total_us: u64,
    pub yields: u64,
    pub handoffs: u64,
    pub handoff_timeouts: u64,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub failures: u64,
    pub interrupts: u64,
    pub contention_count: u64,
    pub contention_total_us: u64,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStats {
    pub spawned: u64,
    pub exited: u64,
    pub spawn_failures: u64,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub gil: GilStats,
    pub locks: LockStats,
    pub threads: ThreadStats,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Runtime Metrics:")?;
        writeln!(
            f,
            "  GIL:     fast: {:>10}, slow: {:>8}, waited: {:>10} us",
            self.gil.fast_acquires, self.gil.slow_acquires, self.gil.contention_total_us
        )?;
        writeln!(
            f,
            "  Yields:  total: {:>9}, handoffs: {:>8}, timeouts: {:>6}",
            self.gil.yields, self.gil.handoffs, self.gil.handoff_timeouts
        )?;
        writeln!(
            f,
            "  Locks:   acquired: {:>6}, failed: {:>6}, interrupted: {:>6}, contended: {:>6}",
            self.locks.acquired,
            self.locks.failures,
            self.locks.interrupts,
            self.locks.contention_count
        )?;
        writeln!(
            f,
            "  Threads: spawned: {:>7}, exited: {:>7}, spawn failures: {:>4}",
            self.threads.spawned, self.threads.exited, self.threads.spawn_failures
        )?;
        Ok(())
    }
}
