//! # fastgil
//!
//! A global interpreter lock with a compare-and-swap fast path, the thread
//! bootstrap that keeps spawned threads registered with a conservative
//! collector, and the general-purpose timed locks built on the same backend.
//!
//! ## Feature Flags
//!
//! - `constrained-fastgil`: Makes [`FastGilMode::Constrained`] the default lock
//!   word encoding, where a held lock is always exactly 1 and any other
//!   non-zero value is treated as corruption.
use clap::Parser;
use serde::Serialize;
use std::{
    process::ExitCode,
    time::{Duration, Instant},
};
use vm::sync::{Arc, AtomicU64, AtomicUsize, Ordering};

pub mod error;
pub mod utils;
pub mod vm;

pub use error::{ArrayError, ThreadError};
pub use utils::sync::{get_ident, ThreadIdent, ThreadLocalRef};
pub use vm::{
    backend::BackendKind,
    config::RuntimeConfig,
    gil::FastGilMode,
    state::Runtime,
    sync::{LockStatus, Timeout},
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run a GIL contention workload and report lock metrics"
)]
pub struct Args {
    /// Worker threads competing for the GIL
    #[arg(short, long, default_value_t = 4)]
    pub threads: usize,
    /// Critical sections each worker runs
    #[arg(short, long, default_value_t = 10_000)]
    pub iterations: u64,
    /// Yield the GIL every N critical sections (0 never yields)
    #[arg(short, long, default_value_t = 100)]
    pub yield_every: u64,
    /// Lock word encoding: generic or constrained
    #[arg(long)]
    pub mode: Option<FastGilMode>,
    /// Wait primitive backend: posix or windows
    #[arg(long)]
    pub backend: Option<BackendKind>,
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct WorkloadReport {
    pub mode: FastGilMode,
    pub backend: BackendKind,
    pub threads: usize,
    pub iterations: u64,
    pub elapsed_ms: u64,
    pub critical_sections: u64,
    /// Times a worker found another thread inside the critical section.
    pub exclusion_violations: u64,
    pub metrics: vm::metrics::MetricsSnapshot,
}

struct Worker {
    runtime: Arc<Runtime>,
    inside: Arc<AtomicUsize>,
    sections: Arc<AtomicU64>,
    violations: Arc<AtomicU64>,
    iterations: u64,
    yield_every: u64,
}

fn run_worker(w: Worker) {
    for i in 1..=w.iterations {
        w.runtime.acquire_gil();
        if w.inside.fetch_add(1, Ordering::SeqCst) != 0 {
            w.violations.fetch_add(1, Ordering::Relaxed);
        }
        w.sections.fetch_add(1, Ordering::Relaxed);
        w.inside.fetch_sub(1, Ordering::SeqCst);
        if w.yield_every != 0 && i % w.yield_every == 0 {
            w.runtime.yield_gil();
        }
        w.runtime.release_gil();
    }
}

/// Run the contention workload described by `args`.
pub fn run_workload(args: &Args) -> Result<WorkloadReport, ThreadError> {
    let mut config = RuntimeConfig::from_env();
    if let Some(mode) = args.mode {
        config.fast_gil = mode;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    let runtime = Runtime::new(config)?;

    let inside = Arc::new(AtomicUsize::new(0));
    let sections = Arc::new(AtomicU64::new(0));
    let violations = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let mut handles = Vec::with_capacity(args.threads);
    for n in 0..args.threads {
        let worker = Worker {
            runtime: runtime.clone(),
            inside: inside.clone(),
            sections: sections.clone(),
            violations: violations.clone(),
            iterations: args.iterations,
            yield_every: args.yield_every,
        };
        handles.push(runtime.spawn_named_thread(format!("worker-{}", n), run_worker, worker)?);
    }
    for handle in handles {
        if handle.join().is_err() {
            // A worker only panics on a contract violation, which is reported below.
            violations.fetch_add(1, Ordering::Relaxed);
        }
    }
    let elapsed: Duration = start.elapsed();

    Ok(WorkloadReport {
        mode: runtime.config().fast_gil,
        backend: runtime.config().backend,
        threads: args.threads,
        iterations: args.iterations,
        elapsed_ms: elapsed.as_millis() as u64,
        critical_sections: sections.load(Ordering::Relaxed),
        exclusion_violations: violations.load(Ordering::Relaxed),
        metrics: runtime.metrics_snapshot(),
    })
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    let report = match run_workload(&args) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error running workload: {}", e);
            return ExitCode::from(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing report: {}", e);
                return ExitCode::from(1);
            }
        }
    } else {
        println!(
            "{} threads x {} iterations ({} mode, {} backend) in {} ms",
            report.threads, report.iterations, report.mode, report.backend, report.elapsed_ms
        );
        println!(
            "critical sections: {}, exclusion violations: {}",
            report.critical_sections, report.exclusion_violations
        );
        print!("{}", report.metrics);
    }

    if report.exclusion_violations == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
