//! Runtime configuration, resolved once when a [`Runtime`](crate::vm::state::Runtime)
//! is built.
//!
//! ## Environment Variables
//!
//! - `FASTGIL_MODE`: `"generic"` or `"constrained"` lock word encoding
//!   (default: `constrained` if built with the `constrained-fastgil` feature,
//!   `generic` otherwise)
//! - `FASTGIL_BACKEND`: `"posix"` or `"windows"` (default: native to the target)
//! - `FASTGIL_COLLECTOR`: `"0"`/`"false"` disables collector registration of
//!   spawned threads (default: enabled)
//! - `FASTGIL_STACK_SIZE`: stack size in bytes for spawned threads, `0` for
//!   the platform default
//! - `FASTGIL_MAX_THREADS`: limit on concurrently live spawned threads
//! - `FASTGIL_YIELD_HANDOFF_US`: how long a yielding holder waits for a waiter
//!   to take the GIL (default: 5000)
use crate::vm::{backend::BackendKind, gil::FastGilMode, gil::DEFAULT_YIELD_HANDOFF};
use std::{env, str::FromStr, time::Duration};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub fast_gil: FastGilMode,
    pub backend: BackendKind,
    /// Whether spawned threads register with the collector.
    pub collector: bool,
    pub stack_size: usize,
    pub max_threads: Option<usize>,
    pub yield_handoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fast_gil: FastGilMode::build_default(),
            backend: BackendKind::native(),
            collector: true,
            stack_size: 0,
            max_threads: None,
            yield_handoff: DEFAULT_YIELD_HANDOFF,
        }
    }
}

impl RuntimeConfig {
    /// Build defaults overridden by the `FASTGIL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`RuntimeConfig::from_env`] but reading variables through `lookup`.
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(mode) = parse_var(&lookup, "FASTGIL_MODE") {
            config.fast_gil = mode;
        }
        if let Some(backend) = parse_var(&lookup, "FASTGIL_BACKEND") {
            config.backend = backend;
        }
        if let Some(value) = lookup("FASTGIL_COLLECTOR") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "on" => config.collector = true,
                "0" | "false" | "off" => config.collector = false,
                other => warn!("ignoring FASTGIL_COLLECTOR={}", other),
            }
        }
        if let Some(size) = parse_var(&lookup, "FASTGIL_STACK_SIZE") {
            config.stack_size = size;
        }
        if let Some(limit) = parse_var(&lookup, "FASTGIL_MAX_THREADS") {
            config.max_threads = Some(limit);
        }
        if let Some(micros) = parse_var(&lookup, "FASTGIL_YIELD_HANDOFF_US") {
            config.yield_handoff = Duration::from_micros(micros);
        }
        config
    }

    pub fn with_fast_gil(mut self, mode: FastGilMode) -> Self {
        self.fast_gil = mode;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_collector(mut self, enabled: bool) -> Self {
        self.collector = enabled;
        self
    }

    pub fn with_max_threads(mut self, limit: Option<usize>) -> Self {
        self.max_threads = limit;
        self
    }

    pub fn with_yield_handoff(mut self, bound: Duration) -> Self {
        self.yield_handoff = bound;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.collector);
        assert_eq!(config.backend, BackendKind::native());
        assert_eq!(config.fast_gil, FastGilMode::build_default());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("FASTGIL_MODE", "constrained"),
            ("FASTGIL_BACKEND", "windows"),
            ("FASTGIL_COLLECTOR", "off"),
            ("FASTGIL_STACK_SIZE", "65536"),
            ("FASTGIL_MAX_THREADS", "8"),
            ("FASTGIL_YIELD_HANDOFF_US", "250"),
        ]));
        assert_eq!(config.fast_gil, FastGilMode::Constrained);
        assert_eq!(config.backend, BackendKind::NativeWindows);
        assert!(!config.collector);
        assert_eq!(config.stack_size, 65536);
        assert_eq!(config.max_threads, Some(8));
        assert_eq!(config.yield_handoff, Duration::from_micros(250));
    }

    #[test]
    fn test_bad_values_are_ignored() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("FASTGIL_MODE", "sometimes"),
            ("FASTGIL_MAX_THREADS", "lots"),
        ]));
        assert_eq!(config.fast_gil, FastGilMode::build_default());
        assert_eq!(config.max_threads, None);
    }

    #[test]
    #[cfg(feature = "constrained-fastgil")]
    fn test_feature_selects_constrained() {
        assert_eq!(RuntimeConfig::default().fast_gil, FastGilMode::Constrained);
    }

    #[test]
    #[cfg(not(feature = "constrained-fastgil"))]
    fn test_default_is_generic() {
        assert_eq!(RuntimeConfig::default().fast_gil, FastGilMode::Generic);
    }
}
