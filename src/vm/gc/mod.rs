//! Boundary with the conservative collector.
//!
//! The collector scans the stack of every registered thread, so the runtime
//! owes it two things per thread: register before any runtime code runs on
//! that thread, and deregister once nothing on that stack can change any more.
//! [`CollectorRegistration`] ties both to a scope so every exit path, unwinding
//! included, deregisters.
use crate::{
    utils::sync::ThreadIdent,
    vm::sync::{Arc, Mutex},
};
use std::{
    collections::HashMap,
    thread::{self, ThreadId},
    time::Instant,
};
use tracing::{debug, warn};

/// Thread lifecycle hooks a collector exposes to the runtime.
pub trait CollectorHooks: Send + Sync {
    fn register_thread(&self, ident: ThreadIdent);
    fn deregister_thread(&self, ident: ThreadIdent);

    /// Called whenever `ident` has (re-)acquired the GIL.
    fn thread_run(&self, _ident: ThreadIdent) {}

    /// Called in the parent right before the process forks.
    fn before_fork(&self) {}

    /// Called in the child after a fork. Only `survivor` exists there; every
    /// other registered thread is gone without having deregistered.
    fn after_fork(&self, _survivor: ThreadIdent) {}
}

/// Scoped registration of the current thread with a collector.
pub struct CollectorRegistration {
    hooks: Arc<dyn CollectorHooks>,
    ident: ThreadIdent,
}

impl CollectorRegistration {
    pub fn new(hooks: Arc<dyn CollectorHooks>, ident: ThreadIdent) -> Self {
        hooks.register_thread(ident);
        Self { hooks, ident }
    }

    pub fn ident(&self) -> ThreadIdent {
        self.ident
    }
}

impl Drop for CollectorRegistration {
    fn drop(&mut self) {
        self.hooks.deregister_thread(self.ident);
    }
}

/// Information about a registered thread.
#[derive(Debug, Clone)]
pub struct RegisteredThread {
    /// Native OS thread ID
    pub native_id: ThreadId,
    pub registered_at: Instant,
    /// Number of GIL acquisitions reported through `thread_run`
    pub runs: u64,
}

/// Default collector binding: tracks which thread stacks are scan roots.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<ThreadIdent, RegisteredThread>>,
}

impl ThreadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registered_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_registered(&self, ident: ThreadIdent) -> bool {
        self.threads.lock().contains_key(&ident)
    }

    pub fn get(&self, ident: ThreadIdent) -> Option<RegisteredThread> {
        self.threads.lock().get(&ident).cloned()
    }

    /// Threads whose stacks are currently scan roots, in ident order.
    pub fn roots(&self) -> Vec<ThreadIdent> {
        let mut roots: Vec<_> = self.threads.lock().keys().copied().collect();
        roots.sort();
        roots
    }
}

impl CollectorHooks for ThreadRegistry {
    fn register_thread(&self, ident: ThreadIdent) {
        let info = RegisteredThread {
            native_id: thread::current().id(),
            registered_at: Instant::now(),
            runs: 0,
        };
        if self.threads.lock().insert(ident, info).is_some() {
            warn!(thread = %ident, "thread registered with the collector twice");
        }
    }

    fn deregister_thread(&self, ident: ThreadIdent) {
        if self.threads.lock().remove(&ident).is_none() {
            warn!(thread = %ident, "deregistering a thread the collector never saw");
        }
    }

    fn thread_run(&self, ident: ThreadIdent) {
        if let Some(info) = self.threads.lock().get_mut(&ident) {
            info.runs += 1;
        }
    }

    fn after_fork(&self, survivor: ThreadIdent) {
        let mut threads = self.threads.lock();
        let before = threads.len();
        threads.retain(|ident, _| *ident == survivor);
        debug!(
            dropped = before - threads.len(),
            "forgot threads that did not survive the fork"
        );
    }
}
