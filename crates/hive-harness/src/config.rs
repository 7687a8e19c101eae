//! Harness configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use crate::error::{HarnessError, Result};
use crate::ports::PortRange;
use crate::scope::ScopeStack;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default first port handed out to test processes.
pub const DEFAULT_PORT_BEGIN: u16 = 20_000;

/// Default end (exclusive) of the port space.
pub const DEFAULT_PORT_END: u16 = 40_000;

/// Process-wide harness settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory used by the root scope when nothing else is bound.
    pub root_directory: PathBuf,

    /// First port of the shared port space.
    pub port_begin: u16,

    /// End (exclusive) of the shared port space.
    pub port_end: u16,

    /// Index of this process among concurrently running test processes.
    pub worker_index: u16,

    /// Number of concurrently running test processes.
    pub worker_count: u16,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            root_directory: std::env::temp_dir().join("hive-harness"),
            port_begin: DEFAULT_PORT_BEGIN,
            port_end: DEFAULT_PORT_END,
            worker_index: 0,
            worker_count: 1,
        }
    }
}

impl HarnessConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `HIVE_HARNESS_ROOT` | `$TMPDIR/hive-harness` |
    /// | `HIVE_HARNESS_PORT_BEGIN` | `20000` |
    /// | `HIVE_HARNESS_PORT_END` | `40000` |
    /// | `HIVE_HARNESS_WORKER` | `0` (`gw3` and `3` both accepted) |
    /// | `HIVE_HARNESS_WORKER_COUNT` | `1` |
    ///
    /// Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let number = |key: &str, fallback: u16| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            root_directory: lookup("HIVE_HARNESS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.root_directory),
            port_begin: number("HIVE_HARNESS_PORT_BEGIN", default.port_begin),
            port_end: number("HIVE_HARNESS_PORT_END", default.port_end),
            worker_index: lookup("HIVE_HARNESS_WORKER")
                .as_deref()
                .and_then(parse_worker_id)
                .unwrap_or(default.worker_index),
            worker_count: number("HIVE_HARNESS_WORKER_COUNT", default.worker_count),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`HarnessError::InvalidPortRange`] for an unusable port space
    /// and [`HarnessError::Config`] for inconsistent worker settings.
    pub fn validate(&self) -> Result<()> {
        if self.port_begin == 0 || self.port_begin >= self.port_end {
            return Err(HarnessError::InvalidPortRange {
                begin: self.port_begin,
                end: self.port_end,
            });
        }
        if self.worker_count == 0 {
            return Err(HarnessError::Config("worker_count must be at least 1".into()));
        }
        if self.worker_index >= self.worker_count {
            return Err(HarnessError::Config(format!(
                "worker_index {} out of range for {} workers",
                self.worker_index, self.worker_count
            )));
        }
        if self.port_end - self.port_begin < self.worker_count {
            return Err(HarnessError::Config(format!(
                "{} ports cannot be split between {} workers",
                self.port_end - self.port_begin,
                self.worker_count
            )));
        }
        Ok(())
    }

    /// The port slice owned by this worker.
    pub fn port_range(&self) -> Result<PortRange> {
        self.validate()?;
        PortRange::for_worker(
            self.port_begin,
            self.port_end,
            self.worker_index,
            self.worker_count,
        )
    }

    /// Create the root directory and open a scope stack on it.
    pub fn scope_stack(&self) -> Result<ScopeStack> {
        std::fs::create_dir_all(&self.root_directory)?;
        tracing::info!(root = %self.root_directory.display(), "Opening root scope");
        Ok(ScopeStack::new(&self.root_directory))
    }
}

/// Parse a worker id such as `gw3` or `3`.
fn parse_worker_id(value: &str) -> Option<u16> {
    let value = value.trim();
    value
        .strip_prefix("gw")
        .unwrap_or(value)
        .parse()
        .ok()
}

/// Fluent builder for [`HarnessConfig`].
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    /// Set the root scope directory.
    pub fn root_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_directory = path.into();
        self
    }

    /// Set the shared port space `[begin, end)`.
    pub fn ports(mut self, begin: u16, end: u16) -> Self {
        self.config.port_begin = begin;
        self.config.port_end = end;
        self
    }

    /// Set this worker's position among `count` workers.
    pub fn worker(mut self, index: u16, count: u16) -> Self {
        self.config.worker_index = index;
        self.config.worker_count = count;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
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
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::from_lookup(lookup(&[]));
        assert_eq!(config, HarnessConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("HIVE_HARNESS_ROOT", "/tmp/run"),
            ("HIVE_HARNESS_PORT_BEGIN", "30000"),
            ("HIVE_HARNESS_PORT_END", "30400"),
            ("HIVE_HARNESS_WORKER", "gw3"),
            ("HIVE_HARNESS_WORKER_COUNT", "4"),
        ]));
        assert_eq!(config.root_directory, PathBuf::from("/tmp/run"));
        assert_eq!(config.worker_index, 3);
        let range = config.port_range().unwrap();
        assert_eq!((range.begin(), range.end()), (30300, 30400));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("HIVE_HARNESS_PORT_BEGIN", "lots"),
            ("HIVE_HARNESS_WORKER", "master"),
        ]));
        assert_eq!(config.port_begin, DEFAULT_PORT_BEGIN);
        assert_eq!(config.worker_index, 0);
    }

    #[test]
    fn test_worker_id_parsing() {
        assert_eq!(parse_worker_id("gw12"), Some(12));
        assert_eq!(parse_worker_id("5"), Some(5));
        assert_eq!(parse_worker_id("gw"), None);
    }

    #[test]
    fn test_builder_validates() {
        assert!(HarnessConfig::builder().ports(5000, 4000).build().is_err());
        assert!(HarnessConfig::builder().worker(2, 2).build().is_err());
        assert!(HarnessConfig::builder().ports(5000, 5002).worker(0, 3).build().is_err());

        let config = HarnessConfig::builder()
            .ports(5000, 5010)
            .worker(1, 2)
            .build()
            .unwrap();
        let range = config.port_range().unwrap();
        assert_eq!((range.begin(), range.end()), (5005, 5010));
    }

    #[test]
    fn test_scope_stack_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("runs");
        let config = HarnessConfig::builder().root_directory(&root).build().unwrap();
        let stack = config.scope_stack().unwrap();
        assert!(root.is_dir());
        assert_eq!(stack.get_current_directory(), root);
    }
}
