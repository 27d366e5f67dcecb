//! Message bus: directed/broadcast delivery with request/response correlation.
//!
//! Subscriptions are indexed by [`MessageType`]. A message with a recipient is
//! delivered only to subscriptions owned by that recipient; a message without
//! one goes to every subscription of its type. Handlers run inline on the
//! publishing task, one after another.
//!
//! `send_request` parks a oneshot sender in a pending map keyed by the
//! correlation ID. `send_response` resolves it directly when present (the fast
//! path) and otherwise publishes the response like any other message.

use crate::handler::{run_guarded, MessageHandler, SubscriptionId};
use crate::supervisor::Supervisor;
use agentmesh_types::config::MeshConfig;
use agentmesh_types::message::{Message, MessageType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An agent known to the bus.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAgent {
    pub agent_id: String,
    /// Whatever the agent chose to announce about itself.
    pub info: HashMap<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    /// Refreshed by `heartbeat` and by publishing a heartbeat message.
    pub last_heartbeat: DateTime<Utc>,
}

/// A subscription record. The owner tags it for directed delivery.
#[derive(Clone)]
struct BusSubscription {
    id: SubscriptionId,
    owner: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

impl BusSubscription {
    fn accepts(&self, message: &Message) -> bool {
        match &message.recipient_id {
            Some(recipient) => self.owner.as_deref() == Some(recipient.as_str()),
            None => true,
        }
    }
}

/// Everything guarded by the bus lock.
#[derive(Default)]
struct BusState {
    agents: HashMap<String, RegisteredAgent>,
    subscriptions: HashMap<MessageType, Vec<BusSubscription>>,
    history: VecDeque<Message>,
}

impl BusState {
    fn record(&mut self, message: &Message, capacity: usize) {
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(message.clone());
    }

    /// Remove an agent and every subscription it owns. Returns whether the
    /// agent was registered, and how many subscriptions were dropped.
    fn remove_agent(&mut self, agent_id: &str) -> (bool, usize) {
        let existed = self.agents.remove(agent_id).is_some();
        let mut stripped = 0;
        for subs in self.subscriptions.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.owner.as_deref() != Some(agent_id));
            stripped += before - subs.len();
        }
        self.subscriptions.retain(|_, subs| !subs.is_empty());
        (existed, stripped)
    }
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Expired messages purged from history.
    pub expired_messages: usize,
    /// Agents evicted for missing heartbeats.
    pub evicted_agents: Vec<String>,
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub messages_published: u64,
    pub deliveries: u64,
    pub messages_rejected: u64,
    pub handler_failures: u64,
    pub requests_sent: u64,
    pub requests_timed_out: u64,
    pub fast_path_responses: u64,
    pub history_size: usize,
    pub registered_agents: usize,
    pub subscriptions: usize,
    pub pending_requests: usize,
    pub running: bool,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    deliveries: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
    requests_sent: AtomicU64,
    requests_timed_out: AtomicU64,
    fast_path_responses: AtomicU64,
}

/// Removes a pending-response slot when the awaiting request finishes,
/// whichever way it finishes.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Message>>,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// The in-process message bus.
pub struct MessageBus {
    max_history: usize,
    cleanup_interval: Duration,
    stale_after: Duration,
    state: RwLock<BusState>,
    /// Awaiting requests, keyed by correlation ID.
    pending: DashMap<String, oneshot::Sender<Message>>,
    counters: BusCounters,
    supervisor: Supervisor,
}

impl MessageBus {
    /// Create a bus sized and timed by `config`.
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            max_history: config.max_message_history.max(1),
            cleanup_interval: config.bus_cleanup_interval(),
            stale_after: config.bus_agent_stale_after(),
            state: RwLock::new(BusState::default()),
            pending: DashMap::new(),
            counters: BusCounters::default(),
            supervisor: Supervisor::new("message_bus"),
        }
    }

    /// Start the periodic maintenance task. Returns false if already running.
    ///
    /// The task holds only a weak reference, so dropping the last `Arc` to
    /// the bus also ends it.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.supervisor.claim() {
            return false;
        }
        let bus = Arc::downgrade(self);
        let interval = self.cleanup_interval;
        self.supervisor.spawn("cleanup", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        debug!("Message bus cleanup: shutdown signal received");
                        break;
                    }
                }
                let Some(bus) = bus.upgrade() else { break };
                let report = bus.run_maintenance();
                if report.expired_messages > 0 || !report.evicted_agents.is_empty() {
                    info!(
                        expired = report.expired_messages,
                        evicted = report.evicted_agents.len(),
                        "Message bus maintenance"
                    );
                }
            }
        });
        info!(interval_secs = interval.as_secs(), "Message bus started");
        true
    }

    /// Cancel the maintenance task and wait for it to finish.
    pub async fn stop(&self) {
        self.supervisor.shutdown().await;
        info!("Message bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    // -- Agents --

    /// Register an agent and broadcast a `Registration` message announcing it.
    ///
    /// Re-registering replaces the stored info. Returns true if the agent was new.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        info: HashMap<String, serde_json::Value>,
    ) -> bool {
        let now = Utc::now();
        let is_new = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let registered_at = state
                .agents
                .get(agent_id)
                .map(|a| a.registered_at)
                .unwrap_or(now);
            state
                .agents
                .insert(
                    agent_id.to_string(),
                    RegisteredAgent {
                        agent_id: agent_id.to_string(),
                        info: info.clone(),
                        registered_at,
                        last_heartbeat: now,
                    },
                )
                .is_none()
        };
        info!(agent = %agent_id, new = is_new, "Agent registered on bus");

        let mut payload = HashMap::new();
        payload.insert("agent_id".to_string(), serde_json::json!(agent_id));
        payload.insert("info".to_string(), serde_json::json!(info));
        self.publish(Message::new(agent_id, MessageType::Registration, payload))
            .await;

        is_new
    }

    /// Remove an agent and every subscription it owns.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let (existed, stripped) = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_agent(agent_id);
        if existed {
            info!(agent = %agent_id, subscriptions = stripped, "Agent unregistered from bus");
        } else {
            debug!(agent = %agent_id, "Unregister ignored: unknown agent");
        }
        existed
    }

    /// Refresh an agent's liveness timestamp.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .agents
            .contains_key(agent_id)
    }

    /// Snapshot of one registered agent.
    pub fn agent_info(&self, agent_id: &str) -> Option<RegisteredAgent> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .agents
            .get(agent_id)
            .cloned()
    }

    /// Snapshot of all registered agents.
    pub fn registered_agents(&self) -> Vec<RegisteredAgent> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<_> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    // -- Subscriptions --

    /// Subscribe a handler to one message type.
    ///
    /// With `owner` set, the handler also receives messages addressed to that
    /// agent. Without it, the handler only ever sees broadcasts.
    pub fn subscribe<H>(
        &self,
        message_type: MessageType,
        handler: H,
        owner: Option<&str>,
    ) -> SubscriptionId
    where
        H: MessageHandler + 'static,
    {
        let id = SubscriptionId::new();
        let subscription = BusSubscription {
            id,
            owner: owner.map(str::to_string),
            handler: Arc::new(handler),
        };
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions
            .entry(message_type)
            .or_default()
            .push(subscription);
        debug!(subscription = %id, %message_type, owner = ?owner, "Bus subscription added");
        id
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for subs in state.subscriptions.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != subscription_id);
            removed |= subs.len() != before;
        }
        state.subscriptions.retain(|_, subs| !subs.is_empty());
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions
            .values()
            .map(Vec::len)
            .sum()
    }

    // -- Delivery --

    /// Publish a message to matching subscribers.
    ///
    /// Returns false when the message is expired (rejected, not recorded) or
    /// when no subscriber matched. Handler failures are logged and do not
    /// stop delivery to the remaining subscribers.
    pub async fn publish(&self, message: Message) -> bool {
        if message.is_expired() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %message.id,
                message_type = %message.message_type,
                sender = %message.sender_id,
                "Rejected expired message"
            );
            return false;
        }

        let targets: Vec<BusSubscription> = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.record(&message, self.max_history);
            if message.message_type == MessageType::Heartbeat {
                if let Some(agent) = state.agents.get_mut(&message.sender_id) {
                    agent.last_heartbeat = message.timestamp.max(agent.last_heartbeat);
                }
            }
            state
                .subscriptions
                .get(&message.message_type)
                .map(|subs| subs.iter().filter(|s| s.accepts(&message)).cloned().collect())
                .unwrap_or_default()
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if targets.is_empty() {
            debug!(
                message_id = %message.id,
                message_type = %message.message_type,
                recipient = ?message.recipient_id,
                "No subscribers for message"
            );
            return false;
        }

        for sub in &targets {
            let delivery = sub.handler.handle(message.clone());
            if let Err(e) = run_guarded(sub.id, delivery).await {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %sub.id,
                    owner = ?sub.owner,
                    message_id = %message.id,
                    error = %e,
                    "Message handler failed"
                );
            }
        }
        self.counters
            .deliveries
            .fetch_add(targets.len() as u64, Ordering::Relaxed);

        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            receivers = targets.len(),
            "Message delivered"
        );
        true
    }

    /// Publish a broadcast message built from its parts.
    pub async fn broadcast(
        &self,
        sender_id: &str,
        message_type: MessageType,
        payload: HashMap<String, serde_json::Value>,
    ) -> bool {
        self.publish(Message::new(sender_id, message_type, payload))
            .await
    }

    /// Send a directed request and wait up to `timeout` for the response.
    ///
    /// Returns `None` on timeout. The pending slot is released on every path.
    pub async fn send_request(
        &self,
        recipient_id: &str,
        message_type: MessageType,
        payload: HashMap<String, serde_json::Value>,
        timeout: Duration,
        sender_id: &str,
    ) -> Option<Message> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        let request = Message::new(sender_id, message_type, payload)
            .to(recipient_id)
            .with_correlation(correlation_id.clone());
        self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
        if !self.publish(request).await {
            debug!(
                correlation_id = %correlation_id,
                recipient = %recipient_id,
                "Request not delivered, waiting for timeout"
            );
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                self.counters
                    .requests_timed_out
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %correlation_id,
                    recipient = %recipient_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                None
            }
        }
    }

    /// Answer a request.
    ///
    /// If the requester is still waiting, the response goes straight to it
    /// and is recorded in history without being dispatched to subscribers.
    /// Otherwise it is published like any other message.
    pub async fn send_response(
        &self,
        original: &Message,
        payload: HashMap<String, serde_json::Value>,
        sender_id: &str,
    ) -> bool {
        let response = original.reply(sender_id, payload);

        let waiter = response
            .correlation_id
            .as_ref()
            .and_then(|id| self.pending.remove(id))
            .map(|(_, tx)| tx);

        if let Some(tx) = waiter {
            self.state
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .record(&response, self.max_history);
            match tx.send(response) {
                Ok(()) => {
                    self.counters
                        .fast_path_responses
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = ?original.correlation_id, "Response resolved pending request");
                    return true;
                }
                Err(response) => {
                    debug!(
                        correlation_id = ?original.correlation_id,
                        "Requester gone, publishing response"
                    );
                    return self.publish(response).await;
                }
            }
        }

        self.publish(response).await
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // -- History & maintenance --

    /// Snapshot of history, oldest first, optionally filtered by type and
    /// a lower timestamp bound.
    pub fn message_history(
        &self,
        message_type: Option<MessageType>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<Message> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .history
            .iter()
            .filter(|m| message_type.map_or(true, |t| m.message_type == t))
            .filter(|m| since.map_or(true, |s| m.timestamp >= s))
            .cloned()
            .collect()
    }

    /// Purge expired history and evict agents whose heartbeat is stale.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(Utc::now())
    }

    pub(crate) fn run_maintenance_at(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let stale_after =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let before = state.history.len();
        state.history.retain(|m| !m.is_expired_at(now));
        let expired_messages = before - state.history.len();

        let mut evicted_agents: Vec<String> = state
            .agents
            .values()
            .filter(|a| now - a.last_heartbeat > stale_after)
            .map(|a| a.agent_id.clone())
            .collect();
        evicted_agents.sort();
        for agent_id in &evicted_agents {
            let (_, stripped) = state.remove_agent(agent_id);
            warn!(
                agent = %agent_id,
                subscriptions = stripped,
                "Evicted agent with stale heartbeat"
            );
        }

        MaintenanceReport {
            expired_messages,
            evicted_agents,
        }
    }

    pub fn stats(&self) -> BusStats {
        let (history_size, registered_agents, subscriptions) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (
                state.history.len(),
                state.agents.len(),
                state.subscriptions.values().map(Vec::len).sum(),
            )
        };
        BusStats {
            messages_published: self.counters.published.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            messages_rejected: self.counters.rejected.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            requests_sent: self.counters.requests_sent.load(Ordering::Relaxed),
            requests_timed_out: self.counters.requests_timed_out.load(Ordering::Relaxed),
            fast_path_responses: self.counters.fast_path_responses.load(Ordering::Relaxed),
            history_size,
            registered_agents,
            subscriptions,
            pending_requests: self.pending.len(),
            running: self.is_running(),
        }
    }
}
