use super::{BackendKind, ThreadBackend, WaitEvent, WaitOutcome, WaitPrimitive, WaitTicket};
use crate::vm::sync::{Condvar, Mutex, Timeout};
use tracing::trace;

/// pthread-style backend: mutex + condition variable events.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixBackend;

impl ThreadBackend for PosixBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Posix
    }

    fn new_event(&self) -> WaitEvent {
        WaitEvent::Generation(GenerationEvent::new())
    }

    fn max_stack_size(&self) -> usize {
        usize::MAX
    }
}

#[derive(Debug, Default)]
struct EventState {
    /// Bumped by every signal; a waiter whose ticket is older has been signaled.
    generation: u64,
    /// Bumped by every interruption.
    interrupts: u64,
}

/// Event that releases waiters by advancing a generation counter.
///
/// `signal_one` advances the generation but only unparks one condvar waiter,
/// so at most one parked thread is woken per release.
#[derive(Debug, Default)]
pub struct GenerationEvent {
    state: Mutex<EventState>,
    condvar: Condvar,
}

impl GenerationEvent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitPrimitive for GenerationEvent {
    fn prepare(&self) -> WaitTicket {
        let state = self.state.lock();
        WaitTicket {
            generation: state.generation,
            interrupts: state.interrupts,
        }
    }

    fn wait(&self, ticket: WaitTicket, timeout: Timeout) -> WaitOutcome {
        let deadline = timeout.deadline_from(PosixBackend.now());
        let mut state = self.state.lock();
        loop {
            if state.generation != ticket.generation {
                return WaitOutcome::Signaled;
            }
            if state.interrupts != ticket.interrupts {
                return WaitOutcome::Interrupted;
            }
            if timeout.is_non_blocking() {
                return WaitOutcome::TimedOut;
            }
            match deadline {
                None => self.condvar.wait(&mut state),
                Some(deadline) => {
                    if PosixBackend.now() >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    // Loop re-checks the generation before trusting a timeout.
                    let _ = self.condvar.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn signal_one(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.condvar.notify_one();
    }

    fn signal_all(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        trace!(interrupts = state.interrupts, "interrupting parked waiters");
        self.condvar.notify_all();
    }
}
