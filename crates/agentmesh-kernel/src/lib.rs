//! In-process coordination for agents.
//!
//! Three independent components, usually owned together by an [`AgentMesh`]:
//! - [`MessageBus`]: directed and broadcast messages, request/response with timeouts.
//! - [`EventSystem`]: filtered, asynchronously dispatched events with history and trends.
//! - [`ServiceRegistry`]: capability-indexed discovery with heartbeat liveness.

pub mod config;
pub mod error;
pub mod event_system;
pub mod handler;
pub mod mesh;
pub mod message_bus;
pub mod service_registry;
pub mod supervisor;

pub use error::{KernelError, KernelResult};
pub use event_system::{create_agent_event, create_workflow_event, EventSystem};
pub use handler::{EventHandler, MessageHandler, SubscriptionId};
pub use mesh::AgentMesh;
pub use message_bus::MessageBus;
pub use service_registry::{DiscoveryQuery, ServiceRegistry};
