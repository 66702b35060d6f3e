//! Runtime configuration presets.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for a reactive [`Runtime`](crate::Runtime).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How many times one job may run within a single flush generation
    /// before the flush is aborted with `ReactiveError::RecursionLimit`.
    pub recursion_limit: u32,
    /// Warn when a mutation is attempted through a read-only view.
    pub warn_readonly_mutation: bool,
    /// Warn when a value cannot be wrapped (not a container, marked raw, frozen).
    pub warn_ineligible_wrap: bool,
    /// Warn when a map or set holds both the raw and the wrapped form of a key.
    pub warn_identity_keys: bool,
    /// Invoke `on_track` / `on_trigger` debugger hooks on effects.
    pub debugger_hooks: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuntimeConfig {
    /// Standard configuration with all diagnostics enabled.
    pub fn standard() -> Self {
        Self {
            recursion_limit: 100,
            warn_readonly_mutation: true,
            warn_ineligible_wrap: true,
            warn_identity_keys: true,
            debugger_hooks: true,
        }
    }

    /// Production configuration: no advisory diagnostics, no debugger hooks.
    pub fn production() -> Self {
        Self {
            recursion_limit: 100,
            warn_readonly_mutation: false,
            warn_ineligible_wrap: false,
            warn_identity_keys: false,
            debugger_hooks: false,
        }
    }

    /// Testing configuration: a low recursion ceiling so runaway loops fail fast.
    pub fn testing() -> Self {
        Self {
            recursion_limit: 20,
            ..Self::standard()
        }
    }

    /// Override the recursion ceiling.
    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Parse a configuration from TOML. Missing fields fall back to [`RuntimeConfig::standard`].
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(RuntimeConfig::default(), RuntimeConfig::standard());
        assert!(!RuntimeConfig::production().debugger_hooks);
        assert!(RuntimeConfig::testing().recursion_limit < RuntimeConfig::standard().recursion_limit);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RuntimeConfig::from_toml_str("recursion_limit = 7\nwarn_identity_keys = false")
            .unwrap();
        assert_eq!(config.recursion_limit, 7);
        assert!(!config.warn_identity_keys);
        assert!(config.warn_readonly_mutation);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(RuntimeConfig::from_toml_str("recursion_limit = \"many\"").is_err());
    }
}
