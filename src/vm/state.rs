use crate::{
    error::ThreadError,
    utils::sync::get_ident,
    vm::{
        backend::Backend,
        config::RuntimeConfig,
        gc::{CollectorHooks, ThreadRegistry},
        gil::Gil,
        metrics::{MetricsSnapshot, RuntimeMetrics},
        sync::{Arc, AtomicIsize, LockStatus, ThreadLock, Timeout},
        threading::{ThreadBootstrap, ThreadHandle},
    },
};
use tracing::debug;

/// Shared state of one runtime instance.
///
/// Nothing here is a process global: a `Runtime` is built explicitly and
/// handed to every thread that needs it, so independent instances can coexist
/// (tests rely on this).
pub struct Runtime {
    config: RuntimeConfig,
    backend: Backend,
    gil: Gil,
    bootstrap: ThreadBootstrap,
    /// Hooks of the attached collector, `None` when collection is disabled.
    collector: Option<Arc<dyn CollectorHooks>>,
    metrics: Arc<RuntimeMetrics>,
}

impl Runtime {
    /// Build a runtime, attaching a [`ThreadRegistry`] as the collector when
    /// `config.collector` is set.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, ThreadError> {
        let collector: Option<Arc<dyn CollectorHooks>> = if config.collector {
            Some(ThreadRegistry::new())
        } else {
            None
        };
        Self::build(config, collector)
    }

    /// Build a runtime bound to a specific collector.
    pub fn with_collector(
        config: RuntimeConfig,
        hooks: Arc<dyn CollectorHooks>,
    ) -> Result<Arc<Self>, ThreadError> {
        let collector = config.collector.then_some(hooks);
        Self::build(config, collector)
    }

    fn build(
        config: RuntimeConfig,
        collector: Option<Arc<dyn CollectorHooks>>,
    ) -> Result<Arc<Self>, ThreadError> {
        let backend = config.backend.build();
        let metrics = Arc::new(RuntimeMetrics::new());
        let gil = Gil::with_metrics(
            config.fast_gil,
            &backend,
            config.yield_handoff,
            metrics.clone(),
        );
        let bootstrap = ThreadBootstrap::new(backend, collector.clone(), metrics.clone())
            .with_max_threads(config.max_threads);
        bootstrap.set_stack_size(config.stack_size)?;

        debug!(
            mode = %config.fast_gil,
            backend = %config.backend,
            collector = collector.is_some(),
            "runtime initialized"
        );

        Ok(Arc::new(Self {
            config,
            backend,
            gil,
            bootstrap,
            collector,
            metrics,
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn gil(&self) -> &Gil {
        &self.gil
    }

    pub fn collector(&self) -> Option<&Arc<dyn CollectorHooks>> {
        self.collector.as_ref()
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // GIL

    pub fn acquire_gil(&self) {
        self.gil.acquire();
        self.notify_thread_run();
    }

    pub fn release_gil(&self) {
        self.gil.release();
    }

    pub fn yield_gil(&self) {
        if self.gil.yield_thread() {
            self.notify_thread_run();
        }
    }

    /// The raw lock word, readable without taking the lock.
    pub fn fetch_fast_gil(&self) -> &AtomicIsize {
        self.gil.fetch_fast_gil()
    }

    /// Run `f` with the GIL released. The collector hears about the
    /// re-acquisition even if `f` unwinds.
    pub fn allow_threads<R>(&self, f: impl FnOnce() -> R) -> R {
        let _notify = NotifyRun(self);
        self.gil.allow_threads(f)
    }

    /// Call in the parent right before forking.
    pub fn before_fork(&self) {
        if let Some(hooks) = &self.collector {
            hooks.before_fork();
        }
    }

    /// Reset the runtime in a forked child. The calling thread is the only
    /// one left: it becomes the GIL holder and the collector's only root.
    pub fn after_fork(&self) {
        self.gil.reinit_after_fork();
        let survivor = get_ident();
        if let Some(hooks) = &self.collector {
            hooks.after_fork(survivor);
        }
        self.bootstrap.reset_after_fork();
        debug!(thread = %survivor, "runtime reset after fork");
        self.notify_thread_run();
    }

    fn notify_thread_run(&self) {
        if let Some(hooks) = &self.collector {
            hooks.thread_run(get_ident());
        }
    }

    // Threads

    pub fn spawn_thread<F, T>(&self, entry: F, arg: T) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        self.bootstrap.spawn(entry, arg)
    }

    pub fn spawn_named_thread<F, T>(
        &self,
        name: impl Into<String>,
        entry: F,
        arg: T,
    ) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        self.bootstrap.spawn_named(Some(name.into()), entry, arg)
    }

    pub fn live_threads(&self) -> usize {
        self.bootstrap.live_threads()
    }

    pub fn get_stack_size(&self) -> usize {
        self.bootstrap.stack_size()
    }

    /// Returns the previous stack size.
    pub fn set_stack_size(&self, size: usize) -> Result<usize, ThreadError> {
        self.bootstrap.set_stack_size(size)
    }

    // General-purpose locks

    pub fn allocate_lock(&self) -> ThreadLock {
        ThreadLock::with_metrics(&self.backend, self.metrics.clone())
    }

    pub fn acquire(&self, lock: &ThreadLock, timeout: Timeout) -> LockStatus {
        lock.acquire_timed(timeout)
    }

    pub fn release(&self, lock: &ThreadLock) -> Result<(), ThreadError> {
        lock.release()
    }
}

/// Reports a `thread_run` when dropped.
struct NotifyRun<'a>(&'a Runtime);

impl Drop for NotifyRun<'_> {
    fn drop(&mut self) {
        self.0.notify_thread_run();
    }
}
