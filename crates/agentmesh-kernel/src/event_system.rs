//! Event system: filtered pub/sub with an async dispatcher, history, and trends.
//!
//! `publish` records the event and enqueues it; a single dispatcher task
//! drains the queue in FIFO order and delivers each event to every
//! subscription whose [`EventFilter`] matches, in subscription order.
//! A second task periodically prunes expired events from history.

use crate::error::{KernelError, KernelResult};
use crate::handler::{run_guarded, EventHandler, SubscriptionId};
use crate::supervisor::Supervisor;
use agentmesh_types::config::MeshConfig;
use agentmesh_types::event::{Event, EventFilter, EventPriority, EventType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Source ID used for events the system emits about itself.
pub const EVENT_SYSTEM_SOURCE: &str = "event_system";

/// Source ID used by [`create_workflow_event`].
pub const WORKFLOW_ENGINE_SOURCE: &str = "workflow_engine";

/// How long `stop` waits for the queue to drain before cancelling the dispatcher.
const STOP_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Maximum number of sources reported in [`EventTrends::top_sources`].
const TOP_SOURCES: usize = 10;

/// Upper bound on timeline buckets, whatever the window and interval.
const MAX_TREND_BUCKETS: usize = 1440;

struct EventSubscription {
    id: SubscriptionId,
    /// Position in subscription order; dispatch follows it.
    seq: u64,
    owner: Option<String>,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

/// Event system counters and sizes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStatistics {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub subscriptions: usize,
    pub subscribers: usize,
    pub history_size: usize,
    pub queue_depth: usize,
    pub running: bool,
}

/// One timeline bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendBucket {
    pub start: DateTime<Utc>,
    pub count: usize,
}

/// Aggregates over recent history.
#[derive(Debug, Clone, Serialize)]
pub struct EventTrends {
    pub window_seconds: u64,
    pub total_events: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    /// Busiest sources, most events first (ties by name).
    pub top_sources: Vec<(String, usize)>,
    pub events_per_minute: f64,
    /// Oldest bucket first; width is the configured collection interval.
    pub timeline: Vec<TrendBucket>,
}

#[derive(Default)]
struct EventCounters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// The in-process event system.
pub struct EventSystem {
    max_history: usize,
    collection_interval: Duration,
    cleanup_interval: Duration,
    history: RwLock<VecDeque<Event>>,
    subscriptions: DashMap<SubscriptionId, EventSubscription>,
    /// Owner -> subscription IDs, for bulk removal.
    subscriber_index: DashMap<String, Vec<SubscriptionId>>,
    next_seq: AtomicU64,
    queue_tx: mpsc::UnboundedSender<Event>,
    /// Held by the dispatcher for as long as it runs.
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
    queue_depth: AtomicUsize,
    counters: EventCounters,
    supervisor: Supervisor,
}

impl EventSystem {
    pub fn new(config: &MeshConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            max_history: config.max_event_history.max(1),
            collection_interval: config.collection_interval(),
            cleanup_interval: config.event_cleanup_interval(),
            history: RwLock::new(VecDeque::new()),
            subscriptions: DashMap::new(),
            subscriber_index: DashMap::new(),
            next_seq: AtomicU64::new(0),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            queue_depth: AtomicUsize::new(0),
            counters: EventCounters::default(),
            supervisor: Supervisor::new("event_system"),
        }
    }

    // -- Lifecycle --

    /// Spawn the dispatcher and the history sweep, then announce startup.
    ///
    /// Events published while the system was stopped are delivered now.
    pub fn start(self: &Arc<Self>) -> KernelResult<()> {
        if !self.supervisor.claim() {
            return Err(KernelError::AlreadyRunning("event_system"));
        }

        let system = Arc::downgrade(self);
        let queue = self.queue_rx.clone();
        self.supervisor
            .spawn("dispatcher", move |mut shutdown| async move {
                let mut rx = queue.lock().await;
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        next = rx.recv() => match next {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    let Some(system) = system.upgrade() else { break };
                    system.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    system.dispatch(event).await;
                }
                debug!("Event dispatcher exited");
            });

        let system = Arc::downgrade(self);
        let interval = self.cleanup_interval;
        self.supervisor.spawn("history_sweep", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                let Some(system) = system.upgrade() else { break };
                let purged = system.purge_expired();
                if purged > 0 {
                    info!(purged, "Pruned expired events from history");
                }
            }
        });

        info!(
            max_history = self.max_history,
            queued = self.queue_depth(),
            "Event system started"
        );
        self.publish(
            Event::new(EventType::SystemStartup, EVENT_SYSTEM_SOURCE, HashMap::new())
                .with_tag("system"),
            None,
        );
        Ok(())
    }

    /// Announce shutdown, give the queue a short grace period to drain, then
    /// cancel both tasks. The event being delivered when the signal arrives
    /// completes first; anything still queued stays queued for the next start.
    pub async fn stop(&self) {
        if !self.supervisor.is_running() {
            return;
        }
        self.publish(
            Event::new(EventType::SystemShutdown, EVENT_SYSTEM_SOURCE, HashMap::new())
                .with_tag("system"),
            None,
        );

        let deadline = tokio::time::Instant::now() + STOP_DRAIN_GRACE;
        while self.queue_depth() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        self.supervisor.shutdown().await;
        let left = self.queue_depth();
        if left > 0 {
            warn!(queued = left, "Event system stopped with events still queued");
        } else {
            info!("Event system stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    // -- Publishing --

    /// Record an event and queue it for delivery.
    ///
    /// Returns true once the event is accepted, which says nothing about
    /// delivery. Expired events are dropped and return false.
    pub fn publish(&self, mut event: Event, priority: Option<EventPriority>) -> bool {
        if let Some(priority) = priority {
            event.priority = priority;
        }
        if event.is_expired() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %event.id,
                event_type = ?event.event_type,
                source = %event.source_id,
                "Dropped expired event at publish"
            );
            return false;
        }

        {
            let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
            while history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        debug!(
            event_id = %event.id,
            event_type = ?event.event_type,
            priority = ?event.priority,
            source = %event.source_id,
            "Publishing event"
        );
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        if self.queue_tx.send(event).is_err() {
            // The receiver lives as long as `self`, so this cannot happen.
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Deliver one dequeued event to its matching subscriptions.
    async fn dispatch(&self, event: Event) {
        if event.is_expired() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.id, "Dropped event that expired while queued");
            return;
        }

        let mut targets: Vec<(u64, SubscriptionId, Option<String>, Arc<dyn EventHandler>)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.filter.matches(&event))
            .map(|entry| {
                (
                    entry.seq,
                    entry.id,
                    entry.owner.clone(),
                    entry.handler.clone(),
                )
            })
            .collect();
        targets.sort_by_key(|(seq, ..)| *seq);

        for (_, id, owner, handler) in &targets {
            if let Err(e) = run_guarded(*id, handler.handle(event.clone())).await {
                self.counters
                    .delivery_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %id,
                    subscriber = ?owner,
                    event_id = %event.id,
                    error = %e,
                    "Event handler failed"
                );
            }
        }

        self.counters
            .deliveries
            .fetch_add(targets.len() as u64, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    // -- Subscriptions --

    /// Subscribe a handler. No filter means every event.
    pub fn subscribe<H>(
        &self,
        handler: H,
        filter: Option<EventFilter>,
        subscriber_id: Option<&str>,
    ) -> SubscriptionId
    where
        H: EventHandler + 'static,
    {
        let id = SubscriptionId::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            EventSubscription {
                id,
                seq,
                owner: subscriber_id.map(str::to_string),
                filter: filter.unwrap_or_default(),
                handler: Arc::new(handler),
            },
        );
        if let Some(owner) = subscriber_id {
            self.subscriber_index
                .entry(owner.to_string())
                .or_default()
                .push(id);
        }
        debug!(subscription = %id, subscriber = ?subscriber_id, "Event subscription added");
        id
    }

    /// Remove one subscription. When `subscriber_id` is given it must own the
    /// subscription, otherwise nothing is removed.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId, subscriber_id: Option<&str>) -> bool {
        let removed = self.subscriptions.remove_if(&subscription_id, |_, sub| {
            subscriber_id.map_or(true, |owner| sub.owner.as_deref() == Some(owner))
        });
        let Some((_, sub)) = removed else {
            return false;
        };
        if let Some(owner) = &sub.owner {
            let now_empty = match self.subscriber_index.get_mut(owner) {
                Some(mut ids) => {
                    ids.retain(|id| *id != subscription_id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.subscriber_index.remove_if(owner, |_, ids| ids.is_empty());
            }
        }
        true
    }

    /// Remove every subscription owned by `subscriber_id`.
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let Some((_, ids)) = self.subscriber_index.remove(subscriber_id) else {
            return 0;
        };
        let removed = ids
            .iter()
            .filter(|id| self.subscriptions.remove(id).is_some())
            .count();
        debug!(subscriber = %subscriber_id, removed, "Removed all event subscriptions");
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Owners with at least one subscription, sorted.
    pub fn subscriber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriber_index
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    // -- History --

    /// Matching events, newest first.
    pub fn event_history(
        &self,
        filter: Option<&EventFilter>,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .cloned()
            .collect();
        drop(history);
        // Timestamps come from construction, not publication.
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit.unwrap_or(usize::MAX));
        matching
    }

    /// Remove expired events from history.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub(crate) fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        let before = history.len();
        history.retain(|e| !e.is_expired_at(now));
        before - history.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> EventStatistics {
        EventStatistics {
            events_published: self.counters.published.load(Ordering::Relaxed),
            events_processed: self.counters.processed.load(Ordering::Relaxed),
            events_dropped: self.counters.dropped.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.len(),
            subscribers: self.subscriber_index.len(),
            history_size: self.history.read().unwrap_or_else(|e| e.into_inner()).len(),
            queue_depth: self.queue_depth(),
            running: self.is_running(),
        }
    }

    /// Aggregate the events recorded within the last `window`.
    pub fn event_trends(&self, window: Duration) -> EventTrends {
        self.event_trends_at(window, Utc::now())
    }

    pub(crate) fn event_trends_at(&self, window: Duration, now: DateTime<Utc>) -> EventTrends {
        let window_delta = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let start = now.checked_sub_signed(window_delta).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let recent: Vec<Event> = {
            let history = self.history.read().unwrap_or_else(|e| e.into_inner());
            history
                .iter()
                .filter(|e| e.timestamp >= start && e.timestamp <= now)
                .cloned()
                .collect()
        };

        let mut by_type = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        let mut by_source: HashMap<&str, usize> = HashMap::new();
        for event in &recent {
            *by_type.entry(enum_label(&event.event_type)).or_insert(0) += 1;
            *by_category
                .entry(enum_label(&event.event_type.category()))
                .or_insert(0) += 1;
            *by_priority.entry(enum_label(&event.priority)).or_insert(0) += 1;
            *by_source.entry(event.source_id.as_str()).or_insert(0) += 1;
        }

        let mut top_sources: Vec<(String, usize)> = by_source
            .into_iter()
            .map(|(source, count)| (source.to_string(), count))
            .collect();
        top_sources.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_sources.truncate(TOP_SOURCES);

        let minutes = window.as_secs_f64() / 60.0;
        let events_per_minute = if minutes > 0.0 {
            recent.len() as f64 / minutes
        } else {
            0.0
        };

        EventTrends {
            window_seconds: window.as_secs(),
            total_events: recent.len(),
            by_type,
            by_category,
            by_priority,
            top_sources,
            events_per_minute,
            timeline: self.timeline(&recent, start, window),
        }
    }

    fn timeline(&self, events: &[Event], start: DateTime<Utc>, window: Duration) -> Vec<TrendBucket> {
        let width = self.collection_interval.as_secs_f64();
        if width <= 0.0 || window.is_zero() {
            return Vec::new();
        }
        let buckets = ((window.as_secs_f64() / width).ceil() as usize).clamp(1, MAX_TREND_BUCKETS);
        let width_ms = (width * 1000.0) as i64;

        let mut timeline: Vec<TrendBucket> = (0..buckets)
            .map(|i| TrendBucket {
                start: start + chrono::Duration::milliseconds(width_ms * i as i64),
                count: 0,
            })
            .collect();
        for event in events {
            let offset_ms = (event.timestamp - start).num_milliseconds().max(0);
            let index = ((offset_ms / width_ms.max(1)) as usize).min(buckets - 1);
            timeline[index].count += 1;
        }
        timeline
    }
}

/// Serialized (snake_case) name of a unit enum variant.
pub(crate) fn enum_label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unknown".to_string(),
    }
}

/// Build an event emitted on behalf of a workflow.
pub fn create_workflow_event(
    event_type: EventType,
    workflow_id: &str,
    payload: HashMap<String, serde_json::Value>,
) -> Event {
    Event::new(event_type, WORKFLOW_ENGINE_SOURCE, payload)
        .with_tags(["workflow", workflow_id])
        .with_metadata("workflow_id", serde_json::json!(workflow_id))
}

/// Build an event emitted by an agent about itself.
pub fn create_agent_event(
    event_type: EventType,
    agent_id: &str,
    payload: HashMap<String, serde_json::Value>,
) -> Event {
    Event::new(event_type, agent_id, payload)
        .with_tags(["agent", agent_id])
        .with_metadata("agent_id", serde_json::json!(agent_id))
}
