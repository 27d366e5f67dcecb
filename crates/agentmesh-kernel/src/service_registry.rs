//! Service registry: capability-indexed discovery with heartbeat liveness.
//!
//! The primary map and its two secondary indices (capability type and tag
//! to agent IDs) live behind one lock, so every mutation updates all three
//! together. Staleness is evaluated lazily: only `discover_services` (and
//! `find_best_service`, which uses it) flips silent services to inactive.

use crate::event_system::enum_label;
use agentmesh_types::config::MeshConfig;
use agentmesh_types::service::{AgentService, ServiceStatus, ServiceType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Criteria for [`ServiceRegistry::discover_services`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryQuery {
    pub service_type: Option<ServiceType>,
    pub status: Option<ServiceStatus>,
    /// The service must carry every one of these tags.
    pub tags: Option<BTreeSet<String>>,
    pub exclude: HashSet<String>,
}

impl DiscoveryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(ids.into_iter().map(Into::into));
        self
    }

    fn accepts(&self, service: &AgentService) -> bool {
        if self.exclude.contains(&service.agent_id) {
            return false;
        }
        if let Some(status) = self.status {
            if service.status != status {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.is_subset(&service.tags) {
                return false;
            }
        }
        true
    }
}

/// Counts over the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Services per capability type (index bucket sizes).
    pub by_capability_type: BTreeMap<String, usize>,
    /// Distinct tags in use.
    pub distinct_tags: usize,
    pub heartbeat_timeout_seconds: u64,
}

#[derive(Default)]
struct RegistryIndex {
    services: HashMap<String, AgentService>,
    by_type: HashMap<ServiceType, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl RegistryIndex {
    fn index(&mut self, service: &AgentService) {
        for service_type in service.capability_types() {
            self.by_type
                .entry(service_type)
                .or_default()
                .insert(service.agent_id.clone());
        }
        for tag in &service.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(service.agent_id.clone());
        }
    }

    /// Drop `service` from both indices, pruning buckets left empty.
    fn deindex(&mut self, service: &AgentService) {
        let id = &service.agent_id;
        for service_type in service.capability_types() {
            if let Some(ids) = self.by_type.get_mut(&service_type) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_type.remove(&service_type);
                }
            }
        }
        for tag in &service.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }
}

/// Directory of agent capabilities.
pub struct ServiceRegistry {
    heartbeat_timeout: Duration,
    inner: RwLock<RegistryIndex>,
}

impl ServiceRegistry {
    pub fn new(config: &MeshConfig) -> Self {
        Self::with_heartbeat_timeout(config.heartbeat_timeout())
    }

    pub fn with_heartbeat_timeout(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            inner: RwLock::new(RegistryIndex::default()),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Insert or replace a service.
    ///
    /// Replacing keeps the original `registered_at` and rebuilds the
    /// service's index membership from the new record.
    pub fn register_service(&self, mut service: AgentService) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let previous = inner.services.remove(&service.agent_id);
        if let Some(previous) = &previous {
            inner.deindex(previous);
            service.registered_at = previous.registered_at;
        }
        inner.index(&service);

        info!(
            agent = %service.agent_id,
            name = %service.name,
            capabilities = service.capabilities.len(),
            replaced = previous.is_some(),
            "Service registered"
        );
        inner.services.insert(service.agent_id.clone(), service);
        true
    }

    /// Remove a service. Unknown IDs return false.
    pub fn unregister_service(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.services.remove(agent_id) {
            Some(service) => {
                inner.deindex(&service);
                info!(agent = %agent_id, "Service unregistered");
                true
            }
            None => {
                debug!(agent = %agent_id, "Unregister ignored: unknown service");
                false
            }
        }
    }

    /// Set status explicitly, merge metadata, and count it as a heartbeat.
    pub fn update_service_status(
        &self,
        agent_id: &str,
        status: ServiceStatus,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(service) = inner.services.get_mut(agent_id) else {
            return false;
        };
        let previous = service.status;
        service.status = status;
        if let Some(metadata) = metadata {
            service.metadata.extend(metadata);
        }
        service.last_heartbeat = Utc::now();
        debug!(agent = %agent_id, from = ?previous, to = ?status, "Service status updated");
        true
    }

    /// Refresh liveness. An inactive service becomes active again.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(service) = inner.services.get_mut(agent_id) else {
            return false;
        };
        service.last_heartbeat = Utc::now();
        if service.status == ServiceStatus::Inactive {
            service.status = ServiceStatus::Active;
            info!(agent = %agent_id, "Service recovered on heartbeat");
        }
        true
    }

    /// Services matching `query`, sorted by agent ID.
    ///
    /// Any matching service whose heartbeat is older than the timeout is left
    /// out of the result. Stale active services are also marked inactive.
    pub fn discover_services(&self, query: &DiscoveryQuery) -> Vec<AgentService> {
        self.discover_services_at(query, Utc::now())
    }

    pub(crate) fn discover_services_at(
        &self,
        query: &DiscoveryQuery,
        now: DateTime<Utc>,
    ) -> Vec<AgentService> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let candidate_ids: Vec<String> = match query.service_type {
            Some(service_type) => inner
                .by_type
                .get(&service_type)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
            None => inner.services.keys().cloned().collect(),
        };

        let mut found = Vec::new();
        for id in candidate_ids {
            let Some(service) = inner.services.get_mut(&id) else {
                continue;
            };
            if !query.accepts(service) {
                continue;
            }
            if service.is_stale(self.heartbeat_timeout, now) {
                // Busy, error and maintenance only change on explicit update.
                if service.status == ServiceStatus::Active {
                    warn!(
                        agent = %service.agent_id,
                        last_heartbeat = %service.last_heartbeat,
                        "Service missed heartbeat, marking inactive"
                    );
                    service.status = ServiceStatus::Inactive;
                }
                continue;
            }
            found.push(service.clone());
        }

        found.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        found
    }

    /// The active service of `service_type` that has been idle longest.
    pub fn find_best_service(
        &self,
        service_type: ServiceType,
        exclude: &[&str],
    ) -> Option<AgentService> {
        let query = DiscoveryQuery::new()
            .service_type(service_type)
            .status(ServiceStatus::Active)
            .exclude(exclude.iter().copied());
        self.discover_services(&query)
            .into_iter()
            .min_by_key(|s| s.last_heartbeat)
    }

    pub fn get_service(&self, agent_id: &str) -> Option<AgentService> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .services
            .get(agent_id)
            .cloned()
    }

    /// All services, sorted by agent ID.
    pub fn all_services(&self) -> Vec<AgentService> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut services: Vec<_> = inner.services.values().cloned().collect();
        services.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        services
    }

    /// Services declaring a capability with this exact name.
    pub fn services_by_capability(&self, capability_name: &str) -> Vec<AgentService> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut services: Vec<_> = inner
            .services
            .values()
            .filter(|s| s.has_capability(capability_name))
            .cloned()
            .collect();
        services.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        services
    }

    /// Services carrying `tag`.
    pub fn find_services_by_tag(&self, tag: &str) -> Vec<AgentService> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut services: Vec<_> = inner
            .by_tag
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.services.get(id).cloned())
            .collect();
        services.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        services
    }

    pub fn service_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .services
            .len()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut by_status = BTreeMap::new();
        for service in inner.services.values() {
            *by_status.entry(enum_label(&service.status)).or_insert(0) += 1;
        }
        let by_capability_type = inner
            .by_type
            .iter()
            .map(|(service_type, ids)| (enum_label(service_type), ids.len()))
            .collect();
        RegistryStats {
            total_services: inner.services.len(),
            by_status,
            by_capability_type,
            distinct_tags: inner.by_tag.len(),
            heartbeat_timeout_seconds: self.heartbeat_timeout.as_secs(),
        }
    }
}
