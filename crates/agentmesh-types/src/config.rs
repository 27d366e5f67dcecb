//! Configuration schema for the agentmesh kernel.
//!
//! Every field has a default, so a partial TOML file (or none at all) yields
//! a usable config.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 60;

/// Top-level mesh configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Capacity of the message bus history ring buffer.
    pub max_message_history: usize,
    /// Capacity of the event system history ring buffer.
    pub max_event_history: usize,
    /// Service registry staleness window.
    pub heartbeat_timeout_seconds: u64,
    /// Bucket width for event trend timelines.
    pub collection_interval_seconds: f64,
    /// How often the message bus runs maintenance.
    pub bus_cleanup_interval_seconds: u64,
    /// Bus-side agents silent for longer than this are evicted.
    pub bus_agent_stale_seconds: u64,
    /// How often the event system prunes expired history.
    pub event_cleanup_interval_seconds: u64,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_message_history: 1000,
            max_event_history: 1000,
            heartbeat_timeout_seconds: 300,
            collection_interval_seconds: DEFAULT_COLLECTION_INTERVAL_SECS as f64,
            bus_cleanup_interval_seconds: 60,
            bus_agent_stale_seconds: 300,
            event_cleanup_interval_seconds: 300,
            log_level: "info".to_string(),
        }
    }
}

impl MeshConfig {
    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_message_history == 0 {
            return Err(MeshError::Config(
                "max_message_history must be greater than zero".into(),
            ));
        }
        if self.max_event_history == 0 {
            return Err(MeshError::Config(
                "max_event_history must be greater than zero".into(),
            ));
        }
        if self.heartbeat_timeout_seconds == 0 {
            return Err(MeshError::Config(
                "heartbeat_timeout_seconds must be greater than zero".into(),
            ));
        }
        if !(self.collection_interval_seconds.is_finite() && self.collection_interval_seconds > 0.0)
        {
            return Err(MeshError::Config(format!(
                "collection_interval_seconds must be positive, got {}",
                self.collection_interval_seconds
            )));
        }
        if self.bus_cleanup_interval_seconds == 0 || self.event_cleanup_interval_seconds == 0 {
            return Err(MeshError::Config(
                "cleanup intervals must be greater than zero".into(),
            ));
        }
        if self.bus_agent_stale_seconds == 0 {
            return Err(MeshError::Config(
                "bus_agent_stale_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    /// Falls back to the default 60s when the value is not a positive,
    /// representable number of seconds.
    pub fn collection_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.collection_interval_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS))
    }

    pub fn bus_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.bus_cleanup_interval_seconds)
    }

    pub fn bus_agent_stale_after(&self) -> Duration {
        Duration::from_secs(self.bus_agent_stale_seconds)
    }

    pub fn event_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.event_cleanup_interval_seconds)
    }
}
