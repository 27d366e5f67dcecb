//! Integration tests for the agent mesh.
//!
//! These wire mock agents through a real `AgentMesh`: agents register with
//! both the bus and the registry, answer requests, and emit events, and the
//! tests check what each side observes end-to-end.

use agentmesh_kernel::{
    create_agent_event, AgentMesh, DiscoveryQuery, EventHandler, MessageHandler, MessageBus,
};
use agentmesh_types::config::MeshConfig;
use agentmesh_types::event::{Event, EventFilter, EventType};
use agentmesh_types::message::{Message, MessageType};
use agentmesh_types::service::{AgentService, ServiceCapability, ServiceStatus, ServiceType};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Mock agent: records what it receives, answers task requests
// ---------------------------------------------------------------------------

struct MockAgent {
    id: String,
    bus: Weak<MessageBus>,
    inbox: Mutex<Vec<Message>>,
}

impl MockAgent {
    fn new(id: &str, bus: &Arc<MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            bus: Arc::downgrade(bus),
            inbox: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<Message> {
        self.inbox.lock().unwrap().clone()
    }
}

/// Shared handle so one agent can hold several subscriptions.
struct AgentHandle(Arc<MockAgent>);

#[async_trait]
impl MessageHandler for AgentHandle {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let agent = &self.0;
        agent.inbox.lock().unwrap().push(message.clone());

        if message.message_type == MessageType::TaskRequest {
            let bus = agent
                .bus
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("bus dropped"))?;
            let task = message
                .payload
                .get("task")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_uppercase();
            let mut payload = HashMap::new();
            payload.insert("result".to_string(), json!(task));
            bus.send_response(&message, payload, &agent.id).await;
        }
        Ok(())
    }
}

/// Event sink collecting everything it is handed.
#[derive(Default)]
struct EventSink {
    events: Mutex<Vec<Event>>,
}

struct SinkHandle(Arc<EventSink>);

#[async_trait]
impl EventHandler for SinkHandle {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        self.0.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl EventSink {
    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn worker_service(id: &str) -> AgentService {
    AgentService::new(id, format!("worker {id}"))
        .with_capability(ServiceCapability::new(
            "shout",
            "Uppercase the task text",
            ServiceType::ContentGeneration,
        ))
        .with_tag("worker")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_directed_delivery_reaches_only_the_recipient() {
    let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
    let bus = mesh.bus().clone();

    let agents: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| MockAgent::new(id, &bus))
        .collect();
    for agent in &agents {
        bus.subscribe(
            MessageType::StatusUpdate,
            AgentHandle(agent.clone()),
            Some(agent.id.as_str()),
        );
    }
    let observer = MockAgent::new("observer", &bus);
    bus.subscribe(MessageType::StatusUpdate, AgentHandle(observer.clone()), None);

    let msg = Message::new("a", MessageType::StatusUpdate, HashMap::new()).to("b");
    assert!(bus.publish(msg).await);

    assert!(agents[0].received().is_empty());
    assert_eq!(agents[1].received().len(), 1);
    assert!(agents[2].received().is_empty());
    assert!(observer.received().is_empty());
}

#[tokio::test]
async fn test_request_response_through_registry_lookup() {
    let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
    mesh.start().unwrap();
    let bus = mesh.bus().clone();

    let worker = MockAgent::new("worker-1", &bus);
    bus.register_agent("worker-1", HashMap::new()).await;
    bus.subscribe(
        MessageType::TaskRequest,
        AgentHandle(worker.clone()),
        Some("worker-1"),
    );
    mesh.registry().register_service(worker_service("worker-1"));

    let target = mesh
        .registry()
        .find_best_service(ServiceType::ContentGeneration, &[])
        .expect("worker registered");

    let mut payload = HashMap::new();
    payload.insert("task".to_string(), json!("hello"));
    let response = bus
        .send_request(
            &target.agent_id,
            MessageType::TaskRequest,
            payload,
            Duration::from_secs(2),
            "coordinator",
        )
        .await
        .expect("response before timeout");

    assert_eq!(response.payload["result"], json!("HELLO"));
    assert_eq!(response.message_type, MessageType::TaskResponse);
    assert_eq!(bus.pending_requests(), 0);

    // The fast-path response is recorded but not dispatched.
    let responses = bus.message_history(Some(MessageType::TaskResponse), None);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].correlation_id, response.correlation_id);

    mesh.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_without_responder_times_out() {
    let bus = MessageBus::new(&MeshConfig::default());
    let started = Instant::now();
    let response = bus
        .send_request(
            "nobody",
            MessageType::TaskRequest,
            HashMap::new(),
            Duration::from_millis(200),
            "coordinator",
        )
        .await;
    let elapsed = started.elapsed();

    assert!(response.is_none());
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(350), "elapsed {elapsed:?}");
    assert_eq!(bus.pending_requests(), 0);
}

#[tokio::test]
async fn test_history_capacity_is_fifo() {
    let config = MeshConfig {
        max_message_history: 5,
        max_event_history: 5,
        ..Default::default()
    };
    let mesh = AgentMesh::new(config).unwrap();

    for i in 0..6 {
        let mut payload = HashMap::new();
        payload.insert("seq".to_string(), json!(i));
        mesh.bus()
            .broadcast("src", MessageType::ContextShare, payload.clone())
            .await;
        mesh.events()
            .publish(Event::new(EventType::StateChanged, "src", payload), None);
    }

    let messages = mesh.bus().message_history(None, None);
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0].payload["seq"], json!(1));
    assert_eq!(messages[4].payload["seq"], json!(5));

    let events = mesh.events().event_history(None, None, None);
    assert_eq!(events.len(), 5);
    assert_eq!(events[0].payload["seq"], json!(5));
    assert_eq!(events[4].payload["seq"], json!(1));
}

#[tokio::test]
async fn test_registry_register_discover_unregister() {
    let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
    let registry = mesh.registry();
    registry.register_service(worker_service("a"));

    let query = DiscoveryQuery::new().service_type(ServiceType::ContentGeneration);
    let found: Vec<_> = registry
        .discover_services(&query)
        .into_iter()
        .map(|s| s.agent_id)
        .collect();
    assert_eq!(found, vec!["a"]);

    assert!(registry.unregister_service("a"));
    assert!(registry.discover_services(&query).is_empty());
}

#[tokio::test]
async fn test_registry_staleness_with_short_timeout() {
    let config = MeshConfig {
        heartbeat_timeout_seconds: 1,
        ..Default::default()
    };
    let mesh = AgentMesh::new(config).unwrap();
    let registry = mesh.registry();
    registry.register_service(worker_service("quiet"));
    registry.register_service(worker_service("chatty"));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    registry.heartbeat("chatty");

    let found = registry.discover_services(&DiscoveryQuery::new().tags(["worker"]));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].agent_id, "chatty");
    assert_eq!(
        registry.get_service("quiet").unwrap().status,
        ServiceStatus::Inactive
    );
}

#[tokio::test]
async fn test_find_best_among_three() {
    let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
    let registry = mesh.registry();
    let now = chrono::Utc::now();
    for (id, idle_secs) in [("w1", 5), ("w2", 90), ("w3", 30)] {
        registry.register_service(
            worker_service(id).with_last_heartbeat(now - chrono::Duration::seconds(idle_secs)),
        );
    }
    let best = registry
        .find_best_service(ServiceType::ContentGeneration, &[])
        .unwrap();
    assert_eq!(best.agent_id, "w2");
}

#[tokio::test]
async fn test_event_tag_subset_scenario() {
    let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
    let events = mesh.events().clone();

    let strict = Arc::new(EventSink::default());
    let loose = Arc::new(EventSink::default());
    events.subscribe(
        SinkHandle(strict.clone()),
        Some(EventFilter::all().tags(["agent", "heartbeat"])),
        Some("strict"),
    );
    events.subscribe(
        SinkHandle(loose.clone()),
        Some(EventFilter::all().tags(["agent"])),
        Some("loose"),
    );

    mesh.start().unwrap();
    events.publish(
        Event::new(EventType::TaskCompleted, "agent-1", HashMap::new()).with_tag("agent"),
        None,
    );
    assert!(eventually(|| loose.len() == 1).await);
    mesh.stop().await.unwrap();

    assert_eq!(strict.len(), 0);
    assert_eq!(
        loose.events.lock().unwrap()[0].event_type,
        EventType::TaskCompleted
    );
}

#[tokio::test]
async fn test_agent_lifecycle_events_and_bus_registration() {
    let mesh = AgentMesh::new(MeshConfig::default()).unwrap();
    mesh.start().unwrap();

    let sink = Arc::new(EventSink::default());
    mesh.events().subscribe(
        SinkHandle(sink.clone()),
        Some(EventFilter::all().metadata("agent_id", json!("agent-9"))),
        Some("monitor"),
    );

    let announcements = MockAgent::new("monitor", mesh.bus());
    mesh.bus().subscribe(
        MessageType::Registration,
        AgentHandle(announcements.clone()),
        None,
    );

    assert!(mesh.bus().register_agent("agent-9", HashMap::new()).await);
    mesh.events().publish(
        create_agent_event(EventType::AgentRegistered, "agent-9", HashMap::new()),
        None,
    );
    assert!(eventually(|| sink.len() == 1).await);
    assert_eq!(announcements.received().len(), 1);

    assert!(mesh.bus().unregister_agent("agent-9"));
    assert_eq!(mesh.events().unsubscribe_all("monitor"), 1);

    let snapshot = mesh.snapshot();
    assert_eq!(snapshot.bus.registered_agents, 0);
    assert_eq!(snapshot.events.subscriptions, 0);

    mesh.stop().await.unwrap();
}
