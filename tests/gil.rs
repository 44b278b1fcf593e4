use fastgil::{
    vm::{sync::ThreadLock, BackendKind},
    FastGilMode, LockStatus, Runtime, RuntimeConfig, Timeout,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

fn runtime(mode: FastGilMode, backend: BackendKind) -> Arc<Runtime> {
    Runtime::new(
        RuntimeConfig::default()
            .with_fast_gil(mode)
            .with_backend(backend),
    )
    .unwrap()
}

fn each_config() -> Vec<Arc<Runtime>> {
    let mut out = Vec::new();
    for mode in [FastGilMode::Generic, FastGilMode::Constrained] {
        for backend in [BackendKind::Posix, BackendKind::NativeWindows] {
            out.push(runtime(mode, backend));
        }
    }
    out
}

/// Join `handles`, failing the test instead of hanging if they deadlock.
fn join_within(handles: Vec<thread::JoinHandle<()>>, limit: Duration) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for h in handles {
            h.join().unwrap();
        }
        let _ = tx.send(());
    });
    rx.recv_timeout(limit)
        .expect("threads did not finish; GIL deadlocked");
}

#[test]
fn test_mutual_exclusion() {
    for rt in each_config() {
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let handles = (0..6)
            .map(|_| {
                let rt = rt.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        rt.acquire_gil();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        rt.release_gil();
                    }
                })
            })
            .collect();
        join_within(handles, Duration::from_secs(60));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(rt.fetch_fast_gil().load(Ordering::SeqCst), 0);
    }
}

#[test]
fn test_liveness_with_yielding_holders() {
    for rt in each_config() {
        let done = Arc::new(AtomicUsize::new(0));
        let handles = (0..8)
            .map(|_| {
                let rt = rt.clone();
                let done = done.clone();
                thread::spawn(move || {
                    rt.acquire_gil();
                    for _ in 0..200 {
                        rt.yield_gil();
                    }
                    rt.release_gil();
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        join_within(handles, Duration::from_secs(60));
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }
}

#[test]
fn test_yield_hands_lock_to_waiter() {
    for rt in each_config() {
        rt.acquire_gil();
        let got_it = Arc::new(AtomicBool::new(false));
        let waiter = {
            let rt = rt.clone();
            let got_it = got_it.clone();
            thread::spawn(move || {
                rt.acquire_gil();
                got_it.store(true, Ordering::SeqCst);
                rt.release_gil();
            })
        };
        while rt.gil().waiting_threads() == 0 {
            thread::yield_now();
        }

        let mut cycles = 0;
        while !got_it.load(Ordering::SeqCst) {
            assert!(cycles < 1_000, "waiter starved for 1000 yield cycles");
            rt.yield_gil();
            cycles += 1;
        }
        rt.release_gil();
        waiter.join().unwrap();
    }
}

#[test]
fn test_round_trip_restores_free_word() {
    for rt in each_config() {
        let before = rt.fetch_fast_gil().load(Ordering::SeqCst);
        rt.acquire_gil();
        assert_eq!(rt.fetch_fast_gil().load(Ordering::SeqCst), 1);
        rt.release_gil();
        assert_eq!(rt.fetch_fast_gil().load(Ordering::SeqCst), before);
    }
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "not reentrant")]
fn test_gil_is_not_reentrant() {
    let rt = runtime(FastGilMode::Generic, BackendKind::Posix);
    rt.acquire_gil();
    rt.acquire_gil();
}

#[test]
fn test_timed_acquire_on_held_lock_fails_fast() {
    for backend in [BackendKind::Posix, BackendKind::NativeWindows] {
        let lock = ThreadLock::new(&backend.build());
        assert!(lock.acquire(true));
        let start = Instant::now();
        assert_eq!(lock.acquire_timed(Timeout::NON_BLOCKING), LockStatus::Failure);
        assert!(start.elapsed() < Duration::from_millis(50));
        lock.release().unwrap();
    }
}

#[test]
fn test_indefinite_acquire_after_release_elsewhere() {
    for rt in each_config() {
        let lock = Arc::new(rt.allocate_lock());
        assert_eq!(rt.acquire(&lock, Timeout::NON_BLOCKING), LockStatus::Acquired);
        let releaser = {
            let lock = lock.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lock.release().unwrap();
            })
        };
        assert_eq!(rt.acquire(&lock, Timeout::INFINITE), LockStatus::Acquired);
        releaser.join().unwrap();
        rt.release(&lock).unwrap();
    }
}

#[test]
fn test_timed_acquire_expires() {
    let rt = runtime(FastGilMode::Generic, BackendKind::Posix);
    let lock = rt.allocate_lock();
    assert!(lock.acquire(false));
    let start = Instant::now();
    assert_eq!(
        rt.acquire(&lock, Timeout::from_millis(30)),
        LockStatus::Failure
    );
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_allow_threads_around_blocking_call() {
    let rt = runtime(FastGilMode::Generic, BackendKind::Posix);
    rt.acquire_gil();
    let other = {
        let rt = rt.clone();
        move || {
            rt.acquire_gil();
            rt.release_gil();
        }
    };
    rt.allow_threads(|| thread::spawn(other).join().unwrap());
    assert!(rt.gil().is_held_by_current_thread());
    rt.release_gil();
}
