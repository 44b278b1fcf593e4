use super::{BackendKind, ThreadBackend, WaitEvent, WaitOutcome, WaitPrimitive, WaitTicket};
use crate::vm::sync::{Condvar, Mutex, Timeout};
use std::time::Duration;
use tracing::trace;

/// Largest finite wait `WaitForSingleObject` accepts; `u32::MAX` means INFINITE.
pub const MAX_FINITE_WAIT_MS: u32 = 0xFFFF_FFFE;

/// Largest stack `CreateThread` is asked for (256 MiB).
const THREAD_STACK_MAX: usize = 0x1000_0000;

/// Native-Windows-style backend: auto-reset events, millisecond timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeWindowsBackend;

impl ThreadBackend for NativeWindowsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeWindows
    }

    fn new_event(&self) -> WaitEvent {
        WaitEvent::AutoReset(AutoResetEvent::new())
    }

    fn max_stack_size(&self) -> usize {
        THREAD_STACK_MAX
    }
}

/// Convert a microsecond timeout to the millisecond count a native wait takes.
///
/// Rounds up so a short positive timeout never turns into a poll, and clamps to
/// [`MAX_FINITE_WAIT_MS`]. `None` means wait forever.
pub fn wait_millis(timeout: Timeout) -> Option<u32> {
    if timeout.is_infinite() {
        return None;
    }
    let micros = timeout.as_micros() as u64;
    let millis = micros.div_ceil(1_000);
    Some(millis.min(MAX_FINITE_WAIT_MS as u64) as u32)
}

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    /// Bumped by `signal_all`, which releases every parked thread at once.
    broadcasts: u64,
}

/// Auto-reset event: a signal stays pending until exactly one waiter consumes it.
///
/// Interruptions are ignored; a native wait only ends on a signal or a timeout.
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    state: Mutex<EventState>,
    condvar: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitPrimitive for AutoResetEvent {
    fn prepare(&self) -> WaitTicket {
        WaitTicket {
            generation: self.state.lock().broadcasts,
            interrupts: 0,
        }
    }

    fn wait(&self, ticket: WaitTicket, timeout: Timeout) -> WaitOutcome {
        let start = NativeWindowsBackend.now();
        let deadline =
            wait_millis(timeout).and_then(|ms| start.checked_add(Duration::from_millis(ms as u64)));
        let mut state = self.state.lock();
        loop {
            if state.signaled {
                state.signaled = false;
                return WaitOutcome::Signaled;
            }
            if state.broadcasts != ticket.generation {
                return WaitOutcome::Signaled;
            }
            if timeout.is_non_blocking() {
                return WaitOutcome::TimedOut;
            }
            match deadline {
                None => self.condvar.wait(&mut state),
                Some(deadline) => {
                    if NativeWindowsBackend.now() >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    let _ = self.condvar.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn signal_one(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.condvar.notify_one();
    }

    fn signal_all(&self) {
        let mut state = self.state.lock();
        state.broadcasts = state.broadcasts.wrapping_add(1);
        self.condvar.notify_all();
    }

    fn interrupt(&self) {
        trace!("native wait is not interruptible; ignoring interrupt");
    }
}
