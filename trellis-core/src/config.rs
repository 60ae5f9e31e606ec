//! Runtime configuration.

use serde::Deserialize;

use crate::error::Result;

/// Default nesting depth the equality comparator descends before giving up.
pub const DEFAULT_COMPARE_DEPTH: usize = 32;

/// Settings for one [`Runtime`](crate::reactive::Runtime).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use trellis_core::RuntimeConfig;
///
/// let config = RuntimeConfig::from_json(r#"{ "drain_limit": 1000 }"#).unwrap();
/// assert_eq!(config.drain_limit, Some(1000));
/// assert_eq!(config.compare_depth, 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Diagnostic name attached to log events.
    pub name: String,

    /// Nesting depth past which values compare unequal.
    pub compare_depth: usize,

    /// Maximum number of deferred callbacks one `run_until_idle` call may
    /// run. `None` means unbounded, which is what mutually invalidating
    /// reactions will spin on forever.
    pub drain_limit: Option<usize>,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the diagnostic name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Bound the number of deferred callbacks per drain.
    pub fn with_drain_limit(mut self, limit: usize) -> Self {
        self.drain_limit = Some(limit);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "trellis".to_string(),
            compare_depth: DEFAULT_COMPARE_DEPTH,
            drain_limit: None,
        }
    }
}
