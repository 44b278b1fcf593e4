//! OS thread and wait-primitive backends.
//!
//! The runtime never branches on the platform itself. It talks to a
//! [`Backend`], chosen once at startup from [`BackendKind`], which provides:
//!
//! - thread creation (with a requested stack size),
//! - the wait primitive ([`WaitEvent`]) that contended lockers park on,
//! - the clock used for timed waits,
//! - the stack size limits of the platform.
//!
//! # Backends
//!
//! - [`PosixBackend`]: condition-variable style event with a generation
//!   counter. Timeouts have microsecond resolution and waits can be
//!   interrupted (the analogue of `EINTR`).
//! - [`NativeWindowsBackend`]: auto-reset event. Timeouts are rounded up to
//!   whole milliseconds and waits are never interrupted.
//!
//! # Wait protocol
//!
//! A waiter calls [`WaitPrimitive::prepare`] *before* re-checking the
//! condition it is waiting for, then passes the ticket to
//! [`WaitPrimitive::wait`]. A signal sent between the two calls is not lost:
//! the wait returns immediately.
use crate::vm::sync::Timeout;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    str::FromStr,
    thread::{self, JoinHandle},
    time::Instant,
};

mod posix;
mod windows;

pub use posix::{GenerationEvent, PosixBackend};
pub use windows::{AutoResetEvent, NativeWindowsBackend};

/// Smallest stack a runtime thread may be given (32 KiB), on every platform.
pub const THREAD_STACK_MIN: usize = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Posix,
    NativeWindows,
}

impl BackendKind {
    /// The backend native to the target being compiled for.
    pub const fn native() -> Self {
        if cfg!(windows) {
            BackendKind::NativeWindows
        } else {
            BackendKind::Posix
        }
    }

    pub fn build(self) -> Backend {
        match self {
            BackendKind::Posix => Backend::Posix(PosixBackend),
            BackendKind::NativeWindows => Backend::NativeWindows(NativeWindowsBackend),
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::native()
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Posix => write!(f, "posix"),
            BackendKind::NativeWindows => write!(f, "windows"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "posix" | "pthread" => Ok(BackendKind::Posix),
            "windows" | "nt" | "native-windows" => Ok(BackendKind::NativeWindows),
            other => Err(format!("unknown thread backend: {}", other)),
        }
    }
}

/// Result of parking on a [`WaitPrimitive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Interrupted,
}

/// Snapshot taken by [`WaitPrimitive::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitTicket {
    pub(crate) generation: u64,
    pub(crate) interrupts: u64,
}

#[enum_dispatch]
pub trait WaitPrimitive {
    fn prepare(&self) -> WaitTicket;

    /// Park until signaled, interrupted or `timeout` elapses.
    ///
    /// Spurious `Signaled` returns are allowed; callers always re-check.
    fn wait(&self, ticket: WaitTicket, timeout: Timeout) -> WaitOutcome;

    /// Wake at most one parked waiter.
    fn signal_one(&self);

    fn signal_all(&self);

    /// Deliver an interruption to every thread currently parked.
    fn interrupt(&self);
}

#[enum_dispatch(WaitPrimitive)]
#[derive(Debug)]
pub enum WaitEvent {
    Generation(GenerationEvent),
    AutoReset(AutoResetEvent),
}

#[enum_dispatch]
pub trait ThreadBackend {
    fn kind(&self) -> BackendKind;

    fn new_event(&self) -> WaitEvent;

    /// Largest stack size the platform accepts.
    fn max_stack_size(&self) -> usize;

    fn min_stack_size(&self) -> usize {
        THREAD_STACK_MIN
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Start an OS thread running `body`. A `stack_size` of 0 uses the
    /// platform default.
    fn spawn(
        &self,
        name: Option<String>,
        stack_size: usize,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        if stack_size != 0 {
            builder = builder.stack_size(stack_size);
        }
        builder.spawn(body)
    }
}

#[enum_dispatch(ThreadBackend)]
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Posix(PosixBackend),
    NativeWindows(NativeWindowsBackend),
}

impl Default for Backend {
    fn default() -> Self {
        BackendKind::default().build()
    }
}
