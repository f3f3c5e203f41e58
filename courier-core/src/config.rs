//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::StaleTime;

/// Engine-wide configuration.
///
/// Per-endpoint settings (placeholder data, value shape, lifecycle hooks) are
/// declared on the endpoint definitions; this struct only carries defaults and
/// store-level policy.
///
/// ```toml
/// namespace = "wallet"
/// default_stale_time = { after = 30000 }
/// gc_time = 300000
/// auto_fetch_on_subscribe = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Prefix for every cache key built by the facade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Staleness policy for query endpoints that do not set their own.
    pub default_stale_time: StaleTime,
    /// How long an entry without subscribers is retained before garbage
    /// collection may drop it. `None` keeps entries for the whole session.
    #[serde(
        with = "crate::duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub gc_time: Option<Duration>,
    /// Whether the first subscription to an empty query entry loads it.
    pub auto_fetch_on_subscribe: bool,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            default_stale_time: StaleTime::Infinite,
            gc_time: None,
            auto_fetch_on_subscribe: true,
        }
    }
}

impl CourierConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the default stale time.
    pub fn with_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    /// Set the garbage collection retention.
    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Enable or disable loading on first subscription.
    pub fn with_auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch_on_subscribe = enabled;
        self
    }

    /// Check the configuration for values that cannot be honored.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(namespace) = &self.namespace {
            if namespace.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "namespace".to_string(),
                    value: namespace.clone(),
                    reason: "namespace must not be blank".to_string(),
                });
            }
        }
        Ok(())
    }
}
