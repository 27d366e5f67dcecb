//! AgentMesh: the application context that owns the three components.

use crate::error::{KernelError, KernelResult};
use crate::event_system::{EventStatistics, EventSystem};
use crate::message_bus::{BusStats, MessageBus};
use crate::service_registry::{RegistryStats, ServiceRegistry};
use agentmesh_types::config::MeshConfig;
use agentmesh_types::error::MeshError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Combined statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MeshSnapshot {
    pub running: bool,
    pub bus: BusStats,
    pub events: EventStatistics,
    pub registry: RegistryStats,
}

/// Owns one message bus, event system and service registry built from the
/// same config. Components are shared by `Arc`; the mesh only drives their
/// lifecycle.
pub struct AgentMesh {
    config: MeshConfig,
    bus: Arc<MessageBus>,
    events: Arc<EventSystem>,
    registry: Arc<ServiceRegistry>,
    running: AtomicBool,
}

impl AgentMesh {
    /// Build all components. Fails if the config does not validate.
    pub fn new(config: MeshConfig) -> KernelResult<Self> {
        config.validate()?;
        Ok(Self {
            bus: Arc::new(MessageBus::new(&config)),
            events: Arc::new(EventSystem::new(&config)),
            registry: Arc::new(ServiceRegistry::new(&config)),
            running: AtomicBool::new(false),
            config,
        })
    }

    /// Start the bus maintenance task and the event system.
    pub fn start(&self) -> KernelResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KernelError::AlreadyRunning("agent_mesh"));
        }
        if let Err(e) = self.events.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.bus.start();
        info!(
            max_message_history = self.config.max_message_history,
            max_event_history = self.config.max_event_history,
            heartbeat_timeout_secs = self.config.heartbeat_timeout_seconds,
            "Agent mesh started"
        );
        Ok(())
    }

    /// Stop both background components and wait for their tasks.
    pub async fn stop(&self) -> KernelResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MeshError::NotRunning("agent_mesh".into()).into());
        }
        self.events.stop().await;
        self.bus.stop().await;
        info!("Agent mesh stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn events(&self) -> &Arc<EventSystem> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            running: self.is_running(),
            bus: self.bus.stats(),
            events: self.events.statistics(),
            registry: self.registry.registry_stats(),
        }
    }
}
