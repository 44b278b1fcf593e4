//! Utility types and functions used throughout the codebase.

pub mod sync;

pub use sync::{get_ident, ThreadIdent, ThreadLocalRef};
