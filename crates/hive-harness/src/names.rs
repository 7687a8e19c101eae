//! Collision-free names for dynamically created test subjects.

use crate::error::{HarnessError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Base used by [`NameRegistry::create_name`] when the caller gives none.
pub const DEFAULT_BASE_NAME: &str = "Unnamed";

/// Hands out names that are never reused while the registry is alive.
///
/// Two kinds of names are tracked:
/// - unique names, registered verbatim (`"InitNode"`),
/// - numbered names, expanded from a base and a per-base counter
///   (`"Beekeeper0"`, `"Beekeeper1"`, ...).
///
/// Not `Sync`; share it behind a mutex if several callers need it.
#[derive(Debug, Default, Clone)]
pub struct NameRegistry {
    unique_names: BTreeSet<String>,
    numbered_counters: BTreeMap<String, u32>,
}

impl NameRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::NameAlreadyInUse`] if the name was already
    /// handed out, either as a unique name or as an expanded numbered name.
    pub fn register_unique_name(&mut self, name: impl Into<String>) -> Result<String> {
        let name = name.into();
        if self.is_in_use(&name) {
            tracing::debug!(name = %name, "Unique name rejected");
            return Err(HarnessError::NameAlreadyInUse(name));
        }
        self.unique_names.insert(name.clone());
        tracing::trace!(name = %name, "Registered unique name");
        Ok(name)
    }

    /// Reserve the next numeric suffix of `base` and return `"{base}{n}"`.
    ///
    /// Suffixes start at 0 and are never handed out twice for the same base.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::NameAlreadyInUse`] if the expanded name
    /// collides with a name registered some other way. The suffix stays
    /// consumed in that case.
    pub fn register_numbered_name(&mut self, base: &str) -> Result<String> {
        let candidate = format!("{base}{}", self.counter(base));
        let collides = self.is_in_use(&candidate);
        self.advance(base);
        if collides {
            tracing::debug!(name = %candidate, "Numbered name collides with registered name");
            return Err(HarnessError::NameAlreadyInUse(candidate));
        }
        Ok(candidate)
    }

    /// Create a fresh numbered name, scanning past any suffix that collides
    /// with an already registered name.
    ///
    /// Skipped suffixes are consumed, not reused later.
    pub fn create_name(&mut self, base: Option<&str>) -> String {
        let base = base.unwrap_or(DEFAULT_BASE_NAME);
        loop {
            let candidate = format!("{base}{}", self.counter(base));
            let collides = self.is_in_use(&candidate);
            self.advance(base);
            if !collides {
                tracing::trace!(name = %candidate, "Created name");
                return candidate;
            }
            tracing::trace!(name = %candidate, "Skipping name already in use");
        }
    }

    /// Every name handed out so far.
    pub fn get_names_in_use(&self) -> BTreeSet<String> {
        let mut names = self.unique_names.clone();
        for (base, counter) in &self.numbered_counters {
            names.extend((0..*counter).map(|n| format!("{base}{n}")));
        }
        names
    }

    /// Check whether `name` was already handed out.
    pub fn is_in_use(&self, name: &str) -> bool {
        if self.unique_names.contains(name) {
            return true;
        }
        self.numbered_counters.iter().any(|(base, counter)| {
            name.strip_prefix(base.as_str())
                .filter(|suffix| is_canonical_number(suffix))
                .and_then(|suffix| suffix.parse::<u32>().ok())
                .is_some_and(|n| n < *counter)
        })
    }

    fn counter(&self, base: &str) -> u32 {
        self.numbered_counters.get(base).copied().unwrap_or(0)
    }

    fn advance(&mut self, base: &str) {
        *self.numbered_counters.entry(base.to_string()).or_insert(0) += 1;
    }
}

/// `"7"` and `"10"` but not `"07"` or `""`; only these are produced by
/// `format!("{base}{n}")`.
fn is_canonical_number(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix.bytes().all(|b| b.is_ascii_digit())
        && (suffix == "0" || !suffix.starts_with('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_names_start_at_zero() {
        let mut registry = NameRegistry::new();
        assert_eq!(registry.register_numbered_name("Node").unwrap(), "Node0");
        assert_eq!(registry.register_numbered_name("Node").unwrap(), "Node1");
        assert_eq!(registry.register_numbered_name("Wallet").unwrap(), "Wallet0");
    }

    #[test]
    fn test_unique_name_rejected_twice() {
        let mut registry = NameRegistry::new();
        registry.register_unique_name("InitNode").unwrap();
        let err = registry.register_unique_name("InitNode").unwrap_err();
        assert!(matches!(err, HarnessError::NameAlreadyInUse(name) if name == "InitNode"));
    }

    #[test]
    fn test_unique_name_rejected_when_numbered_expansion_exists() {
        let mut registry = NameRegistry::new();
        registry.register_numbered_name("Node").unwrap();
        assert!(registry.register_unique_name("Node0").is_err());
        assert!(registry.register_unique_name("Node1").is_ok());
    }

    #[test]
    fn test_numbered_collision_consumes_suffix() {
        let mut registry = NameRegistry::new();
        registry.register_unique_name("Node0").unwrap();
        assert!(registry.register_numbered_name("Node").is_err());
        assert_eq!(registry.register_numbered_name("Node").unwrap(), "Node1");
    }

    #[test]
    fn test_create_name_skips_holes() {
        let mut registry = NameRegistry::new();
        registry.register_unique_name("Node1").unwrap();
        assert_eq!(registry.create_name(Some("Node")), "Node0");
        assert_eq!(registry.create_name(Some("Node")), "Node2");
        assert_eq!(registry.create_name(Some("Node")), "Node3");
    }

    #[test]
    fn test_create_name_default_base() {
        let mut registry = NameRegistry::new();
        assert_eq!(registry.create_name(None), "Unnamed0");
        assert_eq!(registry.create_name(None), "Unnamed1");
    }

    #[test]
    fn test_overlapping_bases_never_collide() {
        let mut registry = NameRegistry::new();
        let mut seen = BTreeSet::new();
        for _ in 0..12 {
            assert!(seen.insert(registry.create_name(Some("a"))));
        }
        // "a1" + "0" == "a10", already produced from base "a"
        let next = registry.create_name(Some("a1"));
        assert_ne!(next, "a10");
        assert!(seen.insert(next));
    }

    #[test]
    fn test_names_in_use_is_union() {
        let mut registry = NameRegistry::new();
        registry.register_unique_name("Init").unwrap();
        registry.create_name(Some("Node"));
        registry.create_name(Some("Node"));
        let names: Vec<_> = registry.get_names_in_use().into_iter().collect();
        assert_eq!(names, vec!["Init", "Node0", "Node1"]);
    }

    #[test]
    fn test_leading_zero_is_not_a_numbered_name() {
        let mut registry = NameRegistry::new();
        registry.create_name(Some("Node"));
        assert!(registry.is_in_use("Node0"));
        assert!(!registry.is_in_use("Node00"));
    }
}
