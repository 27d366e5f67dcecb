//! Demo scenario: two workers, a coordinator, and an event monitor.
//!
//! Workers register with both the bus and the registry and answer
//! `task_request` messages with a word count. The coordinator picks a worker
//! through the registry and sends it requests; every completed task is also
//! published as an agent event.

use agentmesh_kernel::{create_agent_event, AgentMesh, MessageBus};
use agentmesh_types::event::{Event, EventFilter, EventType};
use agentmesh_types::message::{Message, MessageType};
use agentmesh_types::service::{AgentService, ServiceCapability, ServiceType};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

const WORKERS: [&str; 2] = ["demo-worker-1", "demo-worker-2"];
const COORDINATOR: &str = "demo-coordinator";
const MONITOR: &str = "demo-monitor";

const TASKS: [&str; 3] = [
    "route this message to an idle worker",
    "count the words please",
    "done",
];

/// What one pass of the scenario did.
#[derive(Debug, Default)]
pub struct DemoSummary {
    pub requests: usize,
    pub responses: usize,
    pub events_seen: usize,
}

/// Register the demo workers and the event monitor.
///
/// Returns the monitor's counter of observed agent events.
pub async fn attach(mesh: &AgentMesh) -> Arc<AtomicUsize> {
    for worker in WORKERS {
        mesh.registry().register_service(
            AgentService::new(worker, "Demo worker")
                .with_description("Counts words in task text")
                .with_capability(ServiceCapability::new(
                    "word_count",
                    "Count words in the `task` field",
                    ServiceType::DataProcessing,
                ))
                .with_tag("demo"),
        );

        let mut info = HashMap::new();
        info.insert("role".to_string(), json!("worker"));
        mesh.bus().register_agent(worker, info).await;

        let bus = Arc::downgrade(mesh.bus());
        mesh.bus().subscribe(
            MessageType::TaskRequest,
            move |message: Message| answer_task(bus.clone(), worker, message),
            Some(worker),
        );
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    mesh.events().subscribe(
        move |event: Event| {
            counter.fetch_add(1, Ordering::Relaxed);
            info!(
                event_type = ?event.event_type,
                source = %event.source_id,
                payload = %json!(event.payload),
                "Monitor saw agent event"
            );
            std::future::ready(anyhow::Ok(()))
        },
        Some(EventFilter::all().tags(["agent"])),
        Some(MONITOR),
    );
    seen
}

async fn answer_task(bus: Weak<MessageBus>, worker: &'static str, message: Message) -> anyhow::Result<()> {
    let bus = bus
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("message bus dropped"))?;
    let text = message
        .payload
        .get("task")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("task request without a `task` string"))?;

    let mut payload = HashMap::new();
    payload.insert("words".to_string(), json!(text.split_whitespace().count()));
    payload.insert("worker".to_string(), json!(worker));
    bus.send_response(&message, payload, worker).await;
    Ok(())
}

/// Drive every demo task through the registry and bus once.
pub async fn drive(mesh: &AgentMesh) -> DemoSummary {
    let mut summary = DemoSummary::default();

    for task in TASKS {
        let Some(worker) = mesh
            .registry()
            .find_best_service(ServiceType::DataProcessing, &[])
        else {
            warn!("No demo worker available");
            break;
        };

        let mut payload = HashMap::new();
        payload.insert("task".to_string(), json!(task));
        summary.requests += 1;
        let response = mesh
            .bus()
            .send_request(
                &worker.agent_id,
                MessageType::TaskRequest,
                payload,
                Duration::from_secs(2),
                COORDINATOR,
            )
            .await;

        let Some(response) = response else {
            warn!(worker = %worker.agent_id, "Demo request timed out");
            continue;
        };
        summary.responses += 1;
        info!(
            worker = %worker.agent_id,
            words = %response.payload.get("words").cloned().unwrap_or_default(),
            "Demo task answered"
        );

        // Report the work and refresh the worker so the other one is picked next.
        mesh.registry().heartbeat(&worker.agent_id);
        mesh.bus().heartbeat(&worker.agent_id);
        mesh.events().publish(
            create_agent_event(EventType::TaskCompleted, &worker.agent_id, response.payload),
            None,
        );
    }
    summary
}

/// Run the whole scenario against a started mesh.
pub async fn run_once(mesh: &AgentMesh) -> DemoSummary {
    let seen = attach(mesh).await;
    let mut summary = drive(mesh).await;

    // Give the dispatcher a moment to deliver the completion events.
    for _ in 0..100 {
        if seen.load(Ordering::Relaxed) >= summary.responses {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    summary.events_seen = seen.load(Ordering::Relaxed);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_types::config::MeshConfig;

    #[tokio::test]
    async fn test_demo_round_trip() {
        let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
        mesh.start().unwrap();

        let summary = run_once(&mesh).await;
        assert_eq!(summary.requests, TASKS.len());
        assert_eq!(summary.responses, TASKS.len());
        assert_eq!(summary.events_seen, TASKS.len());

        assert_eq!(mesh.registry().service_count(), WORKERS.len());
        assert_eq!(mesh.bus().registered_agents().len(), WORKERS.len());
        assert_eq!(mesh.bus().stats().fast_path_responses, TASKS.len() as u64);

        mesh.stop().await.unwrap();
    }
}
