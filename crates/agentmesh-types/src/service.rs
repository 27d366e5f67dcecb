//! Service registry records.
//!
//! An [`AgentService`] describes one agent: what it can do (capabilities),
//! how healthy it is (status + heartbeat), and how to find it (tags).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Broad class of work a capability performs. Registry discovery is
/// indexed by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    DataProcessing,
    Analysis,
    Communication,
    WorkflowManagement,
    Monitoring,
    Integration,
    ContentGeneration,
    DecisionMaking,
    Storage,
    Notification,
}

/// Health/availability of a registered service.
///
/// `Active` and `Inactive` flip automatically (heartbeat timeout / refresh);
/// the other states are only ever set explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Active,
    Inactive,
    Busy,
    Error,
    Maintenance,
}

/// One thing a service can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCapability {
    /// Capability name, unique within the service.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Broad class used for indexed discovery.
    pub service_type: ServiceType,
    /// Declared parameters (name -> schema/default/whatever the caller needs).
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl ServiceCapability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        service_type: ServiceType,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            service_type,
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// A registry entry, keyed by `agent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentService {
    /// Unique key in the registry.
    pub agent_id: String,
    /// Human-readable name.
    pub name: String,
    /// What the agent is for.
    #[serde(default)]
    pub description: String,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<ServiceCapability>,
    /// Current status.
    #[serde(default)]
    pub status: ServiceStatus,
    /// Where the agent can be reached, if anywhere.
    pub endpoint: Option<String>,
    /// Free-form metadata; merged by status updates.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the service was first registered.
    pub registered_at: DateTime<Utc>,
    /// Last liveness signal.
    pub last_heartbeat: DateTime<Utc>,
    /// Labels for discovery.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl AgentService {
    /// Create an active service with no capabilities, stamped now.
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            status: ServiceStatus::Active,
            endpoint: None,
            metadata: HashMap::new(),
            registered_at: now,
            last_heartbeat: now,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: ServiceCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = at;
        self
    }

    /// True if any capability has the given type.
    pub fn has_capability_type(&self, service_type: ServiceType) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.service_type == service_type)
    }

    /// True if any capability has the given name.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// Distinct capability types this service offers.
    pub fn capability_types(&self) -> BTreeSet<ServiceType> {
        self.capabilities.iter().map(|c| c.service_type).collect()
    }

    /// Whether the last heartbeat is older than `timeout` at `now`.
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - self.last_heartbeat > timeout,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analyst() -> AgentService {
        AgentService::new("a1", "analyst")
            .with_capability(ServiceCapability::new(
                "summarize",
                "Summarize documents",
                ServiceType::Analysis,
            ))
            .with_capability(
                ServiceCapability::new("fetch", "Fetch data", ServiceType::Integration)
                    .with_parameter("timeout_secs", json!(30)),
            )
            .with_tag("nlp")
    }

    #[test]
    fn test_new_service_defaults() {
        let svc = AgentService::new("a1", "analyst");
        assert_eq!(svc.status, ServiceStatus::Active);
        assert_eq!(svc.registered_at, svc.last_heartbeat);
        assert!(svc.capabilities.is_empty());
        assert!(svc.endpoint.is_none());
    }

    #[test]
    fn test_capability_queries() {
        let svc = analyst();
        assert!(svc.has_capability_type(ServiceType::Analysis));
        assert!(svc.has_capability_type(ServiceType::Integration));
        assert!(!svc.has_capability_type(ServiceType::Storage));
        assert!(svc.has_capability("summarize"));
        assert!(!svc.has_capability("translate"));
        assert_eq!(svc.capability_types().len(), 2);
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        let svc = analyst().with_last_heartbeat(now - chrono::Duration::seconds(120));
        assert!(svc.is_stale(Duration::from_secs(60), now));
        assert!(!svc.is_stale(Duration::from_secs(300), now));
    }

    #[test]
    fn test_service_serialization() {
        let svc = analyst().with_endpoint("inproc://a1");
        let json = serde_json::to_string(&svc).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], json!("active"));
        assert_eq!(value["capabilities"][0]["service_type"], json!("analysis"));
        let back: AgentService = serde_json::from_str(&json).unwrap();
        assert_eq!(back, svc);
    }
}
