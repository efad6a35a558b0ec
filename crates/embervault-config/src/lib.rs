//! Configuration knobs for the replica manager.
//!
//! Loaded from TOML the way `kimberlite-cluster`'s `ClusterConfig` is:
//! a plain serde struct with a `validate`-on-construct discipline and a
//! `from_toml_str`/`to_toml_string` pair for round-tripping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors constructing or parsing a [`ReplicaManagerConfig`].
#[derive(Error, Debug)]
pub enum Error {
    /// TOML deserialization failed.
    #[error("invalid configuration TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("failed to serialize configuration: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// A knob held a value that can never be satisfied.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime configuration for a replica manager instance.
///
/// Production defaults to 3 replicas; test harnesses commonly run with
/// 0 (replication disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaManagerConfig {
    /// Number of replicas maintained per segment. 0 disables replication
    /// entirely (used by unit tests that don't want network fan-out).
    pub num_replicas: u32,

    /// Interval between failure-detector probe rounds, in microseconds.
    pub probe_interval_us: u64,

    /// Deadline for a single probe RPC, in microseconds.
    pub probe_timeout_us: u64,

    /// How long a suspected-stale directory view is tolerated before the
    /// detector requests a fresh push from the coordinator, in
    /// microseconds.
    pub stale_server_list_us: u64,

    /// Admission-control cap on concurrently outstanding write RPCs.
    pub max_write_rpcs_in_flight: u32,

    /// `k` in the power-of-k-choices primary placement heuristic.
    pub power_of_k_choices: u32,
}

impl Default for ReplicaManagerConfig {
    fn default() -> Self {
        Self {
            num_replicas: 3,
            probe_interval_us: 50_000,
            probe_timeout_us: 250_000,
            stale_server_list_us: 2_000_000,
            max_write_rpcs_in_flight: 2,
            power_of_k_choices: 5,
        }
    }
}

impl ReplicaManagerConfig {
    /// Configuration with replication disabled, used by segment/scheduler
    /// unit tests that only exercise local bookkeeping.
    #[must_use]
    pub fn no_replication() -> Self {
        Self {
            num_replicas: 0,
            ..Self::default()
        }
    }

    /// Validates that the knobs describe a configuration the replica
    /// manager can actually run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] if `power_of_k_choices` or
    /// `max_write_rpcs_in_flight` is zero, since both are used as
    /// divisors/bounds that must be a positive integer.
    pub fn validate(&self) -> Result<()> {
        if self.power_of_k_choices == 0 {
            return Err(Error::Invalid(
                "power_of_k_choices must be positive".to_string(),
            ));
        }
        if self.max_write_rpcs_in_flight == 0 {
            return Err(Error::Invalid(
                "max_write_rpcs_in_flight must be positive".to_string(),
            ));
        }
        if self.probe_interval_us == 0 || self.probe_timeout_us == 0 {
            return Err(Error::Invalid(
                "probe_interval_us and probe_timeout_us must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses configuration from a TOML document, then validates it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes this configuration back to a TOML document.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
