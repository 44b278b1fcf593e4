//! The fast-path Global Interpreter Lock.
//!
//! One machine word decides who may run interpreted code. Taking the lock when
//! nobody holds it is a single compare-and-swap; only a thread that loses that
//! race touches the backend's wait primitive.
//!
//! # Lock word encoding
//!
//! The word is 0 when free. What "locked" looks like depends on
//! [`FastGilMode`]:
//!
//! - `Generic`: any non-zero value is locked.
//! - `Constrained`: only exactly 1 is locked; anything else is a corrupted word.
//!   Used when a stack walker needs to recognize the flag in raw memory.
//!
//! Either way, this implementation always writes 1 when it takes the lock.
//!
//! # Fairness
//!
//! Waiters are not served in FIFO order and a particular waiter can in
//! principle be starved. The bound comes from the holder calling
//! [`Gil::yield_thread`] at safe points: a yield with parked waiters hands the
//! lock over and waits (up to the configured handoff bound) until somebody
//! else has taken it before competing again.
//!
//! # Reentrancy
//!
//! The GIL is not reentrant. Acquiring it on the thread that already holds it
//! is a contract violation and stops the process rather than deadlocking.
use crate::{
    error::contract_violation,
    utils::sync::{get_ident, ThreadIdent},
    vm::{
        backend::{Backend, ThreadBackend, WaitEvent, WaitPrimitive, WaitTicket},
        metrics::RuntimeMetrics,
        sync::{Arc, AtomicIsize, AtomicU64, AtomicUsize, Ordering, Timeout},
    },
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, trace};

/// Value of the lock word when nobody holds the GIL.
pub const FASTGIL_FREE: isize = 0;

/// Default upper bound on how long a yielding holder waits for a waiter to
/// take the lock.
pub const DEFAULT_YIELD_HANDOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FastGilMode {
    Generic,
    Constrained,
}

impl FastGilMode {
    /// Mode selected at build time by the `constrained-fastgil` feature.
    pub const fn build_default() -> Self {
        if cfg!(feature = "constrained-fastgil") {
            FastGilMode::Constrained
        } else {
            FastGilMode::Generic
        }
    }

    #[inline]
    pub const fn is_locked(self, value: isize) -> bool {
        match self {
            FastGilMode::Generic => value != FASTGIL_FREE,
            FastGilMode::Constrained => value == 1,
        }
    }

    #[inline]
    pub const fn encoded_locked_value(self) -> isize {
        1
    }

    /// Whether `value` is one of the two states this mode defines.
    #[inline]
    pub const fn is_valid(self, value: isize) -> bool {
        match self {
            FastGilMode::Generic => true,
            FastGilMode::Constrained => value == FASTGIL_FREE || value == 1,
        }
    }
}

impl Default for FastGilMode {
    fn default() -> Self {
        Self::build_default()
    }
}

impl Display for FastGilMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FastGilMode::Generic => write!(f, "generic"),
            FastGilMode::Constrained => write!(f, "constrained"),
        }
    }
}

impl FromStr for FastGilMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(FastGilMode::Generic),
            "constrained" | "asmgcc" => Ok(FastGilMode::Constrained),
            other => Err(format!("unknown fast GIL mode: {}", other)),
        }
    }
}

/// The shared lock word and its encoding.
#[derive(Debug)]
pub struct FastGilState {
    word: AtomicIsize,
    mode: FastGilMode,
}

impl FastGilState {
    pub const fn new(mode: FastGilMode) -> Self {
        Self {
            word: AtomicIsize::new(FASTGIL_FREE),
            mode,
        }
    }

    pub fn mode(&self) -> FastGilMode {
        self.mode
    }

    pub fn load(&self) -> isize {
        self.word.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.mode.is_locked(self.load())
    }

    /// Raw access to the word, for embedders that must inspect the lock
    /// without taking it (e.g. from a signal handler).
    pub fn handle(&self) -> &AtomicIsize {
        &self.word
    }

    /// One compare-and-swap from free to locked.
    ///
    /// SeqCst pairs with the waiter count in [`Gil`]: a waiter publishes itself
    /// before its failing CAS, a releaser clears the word before reading the
    /// count, so one of the two always sees the other.
    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        match self.word.compare_exchange(
            FASTGIL_FREE,
            self.mode.encoded_locked_value(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(current) => {
                if !self.mode.is_valid(current) {
                    contract_violation(&format!(
                        "fast GIL word holds {} which is neither free nor locked in {} mode",
                        current, self.mode
                    ));
                }
                false
            }
        }
    }

    /// Set the word to free, returning what it held.
    #[inline]
    pub(crate) fn unlock(&self) -> isize {
        self.word.swap(FASTGIL_FREE, Ordering::SeqCst)
    }

    pub(crate) fn force_locked(&self) {
        self.word
            .store(self.mode.encoded_locked_value(), Ordering::SeqCst);
    }
}

/// Acquire / release / yield protocol over a [`FastGilState`].
#[derive(Debug)]
pub struct Gil {
    state: FastGilState,
    /// Ident of the current holder, 0 when free. Only written by the holder.
    holder: AtomicU64,
    /// Threads registered on the contended path.
    waiters: AtomicUsize,
    /// Total successful acquisitions; a yielder watches this to see a handoff.
    acquisitions: AtomicU64,
    /// Contended acquirers park here; release wakes one.
    wakeup: WaitEvent,
    /// A yielding holder parks here until someone else takes the lock.
    handoff: WaitEvent,
    yield_handoff: Duration,
    /// Source of the clock for contention and handoff timing.
    backend: Backend,
    metrics: Arc<RuntimeMetrics>,
}

impl Gil {
    pub fn new(mode: FastGilMode, backend: &Backend) -> Self {
        Self::with_metrics(
            mode,
            backend,
            DEFAULT_YIELD_HANDOFF,
            Arc::new(RuntimeMetrics::new()),
        )
    }

    pub fn with_metrics(
        mode: FastGilMode,
        backend: &Backend,
        yield_handoff: Duration,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            state: FastGilState::new(mode),
            holder: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            wakeup: backend.new_event(),
            handoff: backend.new_event(),
            yield_handoff,
            backend: *backend,
            metrics,
        }
    }

    pub fn state(&self) -> &FastGilState {
        &self.state
    }

    pub fn mode(&self) -> FastGilMode {
        self.state.mode()
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub fn fetch_fast_gil(&self) -> &AtomicIsize {
        self.state.handle()
    }

    pub fn holder(&self) -> Option<ThreadIdent> {
        ThreadIdent::from_u64(self.holder.load(Ordering::Acquire))
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == get_ident().as_u64()
    }

    /// Number of threads currently on the contended path.
    pub fn waiting_threads(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Block until the calling thread is the sole holder.
    pub fn acquire(&self) {
        let me = get_ident();
        if self.holder.load(Ordering::Relaxed) == me.as_u64() {
            contract_violation(&format!(
                "thread {} tried to acquire the GIL it already holds (the GIL is not reentrant)",
                me
            ));
        }

        if self.state.try_lock() {
            self.enter(me);
            self.metrics.record_gil_fast_acquire();
            return;
        }
        self.acquire_contended(me);
    }

    #[cold]
    fn acquire_contended(&self, me: ThreadIdent) {
        let start = self.backend.now();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        loop {
            // Ticket first, then re-check: a release between the two is seen by wait().
            let ticket = self.wakeup.prepare();
            if self.state.try_lock() {
                break;
            }
            trace!(thread = %me, "parking on contended GIL");
            self.wakeup.wait(ticket, Timeout::INFINITE);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        self.enter(me);
        // A yielder may be waiting to see that somebody else got in.
        self.handoff.signal_all();
        self.metrics.record_gil_contention(start.elapsed());
    }

    #[inline]
    fn enter(&self, me: ThreadIdent) {
        self.holder.store(me.as_u64(), Ordering::Release);
        self.acquisitions.fetch_add(1, Ordering::AcqRel);
    }

    /// Give up the lock. The caller must hold it.
    pub fn release(&self) {
        let me = get_ident();
        let holder = self.holder.load(Ordering::Relaxed);
        if holder != me.as_u64() {
            contract_violation(&format!(
                "thread {} released the GIL without holding it (holder: {})",
                me, holder
            ));
        }
        self.holder.store(0, Ordering::Release);

        let previous = self.state.unlock();
        if !self.state.mode().is_locked(previous) {
            contract_violation(&format!(
                "released a GIL whose word was {} in {} mode",
                previous,
                self.state.mode()
            ));
        }

        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.wakeup.signal_one();
        }
    }

    /// Offer the lock to waiters at a safe point.
    ///
    /// Without waiters this returns immediately. Otherwise the lock is released,
    /// the caller waits until another thread has taken it (or the handoff bound
    /// passes), and then competes for it again like any other thread.
    ///
    /// Returns whether the lock was actually released and re-acquired.
    pub fn yield_thread(&self) -> bool {
        if !self.is_held_by_current_thread() {
            contract_violation("GIL yield from a thread that does not hold it");
        }
        self.metrics.record_gil_yield();
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return false;
        }

        let before = self.acquisitions.load(Ordering::Acquire);
        let ticket = self.handoff.prepare();
        self.release();
        let handed_off = self.wait_for_handoff(before, ticket);
        self.metrics.record_gil_handoff(handed_off);
        self.acquire();
        true
    }

    fn wait_for_handoff(&self, before: u64, mut ticket: WaitTicket) -> bool {
        let deadline = self.backend.now() + self.yield_handoff;
        loop {
            if self.acquisitions.load(Ordering::Acquire) != before {
                return true;
            }
            if self.waiters.load(Ordering::SeqCst) == 0 {
                return false;
            }
            let now = self.backend.now();
            if now >= deadline {
                debug!(
                    waiters = self.waiters.load(Ordering::Relaxed),
                    "GIL handoff timed out; re-acquiring"
                );
                return false;
            }
            self.handoff
                .wait(ticket, Timeout::from_duration(deadline - now));
            ticket = self.handoff.prepare();
        }
    }

    /// Run `f` with the GIL released, re-acquiring it afterwards even if `f`
    /// unwinds. For calls that block on external I/O.
    pub fn allow_threads<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Reacquire<'a>(&'a Gil);
        impl Drop for Reacquire<'_> {
            fn drop(&mut self) {
                self.0.acquire();
            }
        }

        self.release();
        let _reacquire = Reacquire(self);
        f()
    }

    /// Re-establish the lock in a freshly forked child.
    ///
    /// Only the calling thread exists after a fork, so any recorded waiters are
    /// gone and the caller becomes the holder.
    pub fn reinit_after_fork(&self) {
        let me = get_ident();
        self.waiters.store(0, Ordering::SeqCst);
        self.state.force_locked();
        self.holder.store(me.as_u64(), Ordering::Release);
        debug!(thread = %me, "GIL reinitialized after fork");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::backend::BackendKind;
    use std::{sync::atomic::AtomicBool, thread};

    fn gil(mode: FastGilMode) -> Arc<Gil> {
        Arc::new(Gil::new(mode, &BackendKind::Posix.build()))
    }

    #[test]
    fn test_encodings() {
        assert!(FastGilMode::Generic.is_locked(1));
        assert!(FastGilMode::Generic.is_locked(-7));
        assert!(!FastGilMode::Generic.is_locked(0));
        assert!(FastGilMode::Constrained.is_locked(1));
        assert!(!FastGilMode::Constrained.is_locked(2));
        assert!(!FastGilMode::Constrained.is_valid(2));
        assert!(FastGilMode::Generic.is_valid(2));
        for mode in [FastGilMode::Generic, FastGilMode::Constrained] {
            assert!(mode.is_locked(mode.encoded_locked_value()));
            assert_eq!(mode.to_string().parse::<FastGilMode>(), Ok(mode));
        }
    }

    #[test]
    fn test_round_trip_restores_free() {
        for mode in [FastGilMode::Generic, FastGilMode::Constrained] {
            let gil = gil(mode);
            assert_eq!(gil.state().load(), FASTGIL_FREE);
            gil.acquire();
            assert!(gil.state().is_locked());
            assert!(gil.is_held_by_current_thread());
            gil.release();
            assert_eq!(gil.state().load(), FASTGIL_FREE);
            assert_eq!(gil.holder(), None);
        }
    }

    #[test]
    fn test_uncontended_acquire_takes_fast_path() {
        let gil = gil(FastGilMode::Generic);
        gil.acquire();
        gil.release();
        let snap = gil.metrics().snapshot();
        assert_eq!(snap.gil.fast_acquires, 1);
        assert_eq!(snap.gil.slow_acquires, 0);
    }

    #[test]
    fn test_yield_without_waiters_keeps_lock() {
        let gil = gil(FastGilMode::Generic);
        gil.acquire();
        assert!(!gil.yield_thread());
        assert!(gil.is_held_by_current_thread());
        assert_eq!(gil.metrics().snapshot().gil.handoffs, 0);
        gil.release();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not reentrant")]
    fn test_double_acquire_is_rejected() {
        let gil = gil(FastGilMode::Generic);
        gil.acquire();
        gil.acquire();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without holding it")]
    fn test_release_without_holding() {
        let gil = gil(FastGilMode::Generic);
        gil.release();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "neither free nor locked")]
    fn test_corrupted_word_in_constrained_mode() {
        let gil = gil(FastGilMode::Constrained);
        gil.fetch_fast_gil().store(42, Ordering::SeqCst);
        gil.acquire();
    }

    #[test]
    fn test_generic_mode_tolerates_any_locked_value() {
        let gil = gil(FastGilMode::Generic);
        gil.fetch_fast_gil().store(42, Ordering::SeqCst);
        assert!(gil.state().is_locked());
        assert!(!gil.state().try_lock());
    }

    #[test]
    fn test_allow_threads_lets_others_in() {
        let gil = gil(FastGilMode::Generic);
        gil.acquire();
        let other_ran = Arc::new(AtomicBool::new(false));
        gil.allow_threads(|| {
            let gil = gil.clone();
            let other_ran = other_ran.clone();
            thread::spawn(move || {
                gil.acquire();
                other_ran.store(true, Ordering::SeqCst);
                gil.release();
            })
            .join()
            .unwrap();
        });
        assert!(other_ran.load(Ordering::SeqCst));
        assert!(gil.is_held_by_current_thread());
        gil.release();
    }

    #[test]
    fn test_reinit_after_fork_makes_caller_holder() {
        let gil = gil(FastGilMode::Constrained);
        gil.reinit_after_fork();
        assert!(gil.is_held_by_current_thread());
        assert_eq!(gil.state().load(), 1);
        assert_eq!(gil.waiting_threads(), 0);
        gil.release();
        assert_eq!(gil.state().load(), FASTGIL_FREE);
    }

    #[test]
    fn test_contended_waiter_is_woken_by_release() {
        let gil = gil(FastGilMode::Generic);
        gil.acquire();
        let waiter = {
            let gil = gil.clone();
            thread::spawn(move || {
                gil.acquire();
                gil.release();
            })
        };
        while gil.waiting_threads() == 0 {
            thread::yield_now();
        }
        gil.release();
        waiter.join().unwrap();
        assert_eq!(gil.metrics().snapshot().gil.slow_acquires, 1);
    }
}
