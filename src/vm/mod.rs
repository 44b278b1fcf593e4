pub mod array;
pub mod backend;
pub mod config;
pub mod gc;
pub mod gil;
pub mod metrics;
pub mod state;
pub mod sync;
pub mod threading;

pub use array::{create_zero_filled_array, ArrayLayout, ElementType, NdArray};
pub use backend::{Backend, BackendKind, ThreadBackend};
pub use config::RuntimeConfig;
pub use gc::{CollectorHooks, CollectorRegistration, ThreadRegistry};
pub use gil::{FastGilMode, FastGilState, Gil, FASTGIL_FREE};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use state::Runtime;
pub use sync::{LockStatus, ThreadLock, Timeout};
pub use threading::{ThreadBootstrap, ThreadHandle};
