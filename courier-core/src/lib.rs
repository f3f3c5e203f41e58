//! COURIER Core - Shared Types
//!
//! Value types used by every other crate: the error taxonomy, cache keys,
//! staleness and merge policies, and configuration. This crate contains no
//! cache behavior.

pub mod config;
pub mod duration_ms;
pub mod error;
pub mod key;
pub mod policy;

pub use config::CourierConfig;
pub use error::{
    ConfigError, CourierError, CourierResult, EndpointError, RemoteError, StoreError,
};
pub use key::CacheKey;
pub use policy::{StaleTime, ValueShape};

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Kind of a declared endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Query,
    Mutation,
    Event,
}

impl EndpointKind {
    /// Lowercase name used in error messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Event => "event",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
