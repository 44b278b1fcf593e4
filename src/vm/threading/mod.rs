//! Thread creation for the runtime.
//!
//! Every OS thread the runtime starts goes through [`ThreadBootstrap::spawn`].
//! The thread does not run the caller's entry point directly but a wrapper
//! that:
//!
//! 1. installs the thread's [`ThreadIdent`] (chosen by the spawner so the
//!    returned [`ThreadHandle`] knows it without waiting),
//! 2. registers the thread with the collector, if one is configured,
//! 3. runs `entry(arg)`,
//! 4. deregisters when the wrapper's scope ends, whether `entry` returned or
//!    unwound.
//!
//! The collector therefore never sees the thread before its registration and
//! never scans its stack after the entry point stopped touching it.
//!
//! # Failure
//!
//! Spawning fails with [`ThreadError::ResourceExhausted`] when the configured
//! live-thread limit is reached and with [`ThreadError::Spawn`] when the OS
//! refuses. Neither is retried.
//!
//! # Example
//!
//! ```ignore
//! let handle = bootstrap.spawn(|n: u32| worker(n), 7)?;
//! handle.join().unwrap();
//! ```
use crate::{
    error::ThreadError,
    utils::sync::{allocate_ident, install_ident, ThreadIdent},
    vm::{
        backend::{Backend, ThreadBackend},
        gc::{CollectorHooks, CollectorRegistration},
        metrics::RuntimeMetrics,
        sync::{Arc, AtomicUsize, Ordering},
    },
};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A spawned runtime thread.
#[derive(Debug)]
pub struct ThreadHandle {
    ident: ThreadIdent,
    inner: JoinHandle<()>,
}

impl ThreadHandle {
    pub fn ident(&self) -> ThreadIdent {
        self.ident
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the thread; `Err` carries the panic payload if the entry point
    /// unwound.
    pub fn join(self) -> thread::Result<()> {
        self.inner.join()
    }

    /// Let the thread run to completion on its own.
    pub fn detach(self) {
        drop(self.inner);
    }
}

/// Holds one slot of the live-thread count until the thread finishes, or
/// until a failed spawn drops the wrapper without running it.
struct LiveSlot {
    live: Arc<AtomicUsize>,
    metrics: Arc<RuntimeMetrics>,
    started: bool,
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        // Saturates: a fork may have reset the count while this thread ran.
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
        if self.started {
            self.metrics.record_thread_exited();
        }
    }
}

pub struct ThreadBootstrap {
    backend: Backend,
    collector: Option<Arc<dyn CollectorHooks>>,
    stack_size: AtomicUsize,
    max_threads: Option<usize>,
    live: Arc<AtomicUsize>,
    metrics: Arc<RuntimeMetrics>,
}

impl ThreadBootstrap {
    pub fn new(
        backend: Backend,
        collector: Option<Arc<dyn CollectorHooks>>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            backend,
            collector,
            stack_size: AtomicUsize::new(0),
            max_threads: None,
            live: Arc::new(AtomicUsize::new(0)),
            metrics,
        }
    }

    pub fn with_max_threads(mut self, limit: Option<usize>) -> Self {
        self.max_threads = limit;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn collector(&self) -> Option<&Arc<dyn CollectorHooks>> {
        self.collector.as_ref()
    }

    /// Threads spawned here whose wrapper has not finished yet.
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Forget the threads that did not survive a fork. The forking thread is
    /// not counted afterwards even if it was spawned here.
    pub(crate) fn reset_after_fork(&self) {
        self.live.store(0, Ordering::Release);
    }

    /// Stack size for new threads; 0 means the platform default.
    pub fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }

    /// Set the stack size for threads spawned from now on, returning the
    /// previous setting.
    pub fn set_stack_size(&self, size: usize) -> Result<usize, ThreadError> {
        let min = self.backend.min_stack_size();
        let max = self.backend.max_stack_size();
        if size != 0 && !(min..=max).contains(&size) {
            return Err(ThreadError::InvalidStackSize {
                requested: size,
                min,
                max,
            });
        }
        Ok(self.stack_size.swap(size, Ordering::Relaxed))
    }

    pub fn spawn<F, T>(&self, entry: F, arg: T) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_named(None, entry, arg)
    }

    pub fn spawn_named<F, T>(
        &self,
        name: Option<String>,
        entry: F,
        arg: T,
    ) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        self.reserve_slot()?;

        let ident = allocate_ident();
        let mut slot = LiveSlot {
            live: self.live.clone(),
            metrics: self.metrics.clone(),
            started: false,
        };
        let collector = self.collector.clone();

        let body = move || {
            let installed = install_ident(ident);
            debug_assert!(installed, "fresh thread already had an ident");
            slot.started = true;
            // Declared first so it is dropped last, after deregistration.
            let _slot = slot;
            let _registration = collector.map(|hooks| CollectorRegistration::new(hooks, ident));
            debug!(thread = %ident, "runtime thread started");
            entry(arg);
            debug!(thread = %ident, "runtime thread finished");
        };

        match self.backend.spawn(name, self.stack_size(), Box::new(body)) {
            Ok(inner) => {
                self.metrics.record_thread_spawned();
                Ok(ThreadHandle { ident, inner })
            }
            Err(e) => {
                // The wrapper was dropped unrun, which already gave the slot back.
                self.metrics.record_spawn_failure();
                debug!("thread spawn failed: {}", e);
                Err(ThreadError::Spawn(e))
            }
        }
    }

    fn reserve_slot(&self) -> Result<(), ThreadError> {
        match self.max_threads {
            Some(limit) => self
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| {
                    self.metrics.record_spawn_failure();
                    ThreadError::ResourceExhausted { limit }
                }),
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }
}
