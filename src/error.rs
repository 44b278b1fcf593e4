use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("can't start new thread: limit of {limit} live threads reached")]
    ResourceExhausted { limit: usize },

    #[error("can't start new thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("invalid stack size {requested}: must be 0 or between {min} and {max} bytes")]
    InvalidStackSize {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("bad lock: release of an unlocked lock")]
    BadLock,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArrayError {
    #[error("array of shape {dims:?} with {element_size}-byte elements does not fit in memory")]
    TooLarge { dims: Vec<usize>, element_size: usize },
}

/// Report a broken runtime invariant and stop.
///
/// Debug builds panic so tests can observe the violation; release builds abort,
/// since continuing would run interpreted code without mutual exclusion.
#[cold]
#[track_caller]
pub fn contract_violation(msg: &str) -> ! {
    tracing::error!("runtime contract violation: {}", msg);
    if cfg!(debug_assertions) {
        panic!("contract violation: {}", msg);
    } else {
        std::process::abort();
    }
}
