//! Event types for the agentmesh event system.
//!
//! Events are fire-and-forget notifications. Subscribers select them with an
//! [`EventFilter`]; delivery happens asynchronously on the dispatcher task.

use crate::error::MeshResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random EventId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle family an event type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Workflow,
    Task,
    Agent,
    Message,
    State,
    System,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // -- Workflow --
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,

    // -- Task --
    TaskCreated,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,

    // -- Agent --
    AgentRegistered,
    AgentUnregistered,
    AgentStatusChanged,
    AgentHeartbeat,

    // -- Message --
    MessageSent,
    MessageReceived,

    // -- State --
    StateChanged,
    StateSnapshot,

    // -- System --
    SystemStartup,
    SystemShutdown,
    SystemError,
}

impl EventType {
    /// The lifecycle family of this event type.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::WorkflowStarted
            | Self::WorkflowCompleted
            | Self::WorkflowFailed
            | Self::WorkflowPaused
            | Self::WorkflowResumed => EventCategory::Workflow,
            Self::TaskCreated
            | Self::TaskAssigned
            | Self::TaskStarted
            | Self::TaskCompleted
            | Self::TaskFailed => EventCategory::Task,
            Self::AgentRegistered
            | Self::AgentUnregistered
            | Self::AgentStatusChanged
            | Self::AgentHeartbeat => EventCategory::Agent,
            Self::MessageSent | Self::MessageReceived => EventCategory::Message,
            Self::StateChanged | Self::StateSnapshot => EventCategory::State,
            Self::SystemStartup | Self::SystemShutdown | Self::SystemError => {
                EventCategory::System
            }
        }
    }
}

/// Urgency of an event. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A complete event in the agentmesh event system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// What happened.
    pub event_type: EventType,
    /// Which agent or component produced this event.
    pub source_id: String,
    /// The event payload.
    pub payload: HashMap<String, serde_json::Value>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Urgency.
    #[serde(default)]
    pub priority: EventPriority,
    /// Labels used for subset matching by filters.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Free-form metadata; filters compare entries by equality.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Links related events together.
    pub correlation_id: Option<String>,
    /// The event must not be delivered after this instant.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Create a new normal-priority event.
    pub fn new(
        event_type: EventType,
        source_id: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            source_id: source_id.into(),
            payload,
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            correlation_id: None,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Expire the event `ttl` after its creation timestamp. A ttl too large
    /// to represent leaves it without expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl));
        self
    }

    /// Set an absolute expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> MeshResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Selects which events a subscription receives.
///
/// Every unset field matches everything, so `EventFilter::default()` matches
/// all events. Set fields are ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Accept only these event types.
    pub event_types: Option<HashSet<EventType>>,
    /// Accept only events from these sources.
    pub source_ids: Option<HashSet<String>>,
    /// Every tag listed here must be present on the event (subset match).
    pub tags: Option<BTreeSet<String>>,
    /// Accept only events at or above this priority.
    pub min_priority: Option<EventPriority>,
    /// Every entry must be present in the event metadata with an equal value.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl EventFilter {
    /// A filter that accepts every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_types<I: IntoIterator<Item = EventType>>(mut self, types: I) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_ids = Some(sources.into_iter().map(Into::into).collect());
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

    pub fn min_priority(mut self, priority: EventPriority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }

        if let Some(sources) = &self.source_ids {
            if !sources.contains(&event.source_id) {
                return false;
            }
        }

        if let Some(tags) = &self.tags {
            if !tags.is_subset(&event.tags) {
                return false;
            }
        }

        if let Some(floor) = self.min_priority {
            if event.priority < floor {
                return false;
            }
        }

        if let Some(required) = &self.metadata {
            let all_equal = required
                .iter()
                .all(|(key, value)| event.metadata.get(key) == Some(value));
            if !all_equal {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(ty: EventType) -> Event {
        Event::new(ty, "agent-1", HashMap::new())
    }

    #[test]
    fn test_event_creation() {
        let ev = event(EventType::TaskCompleted);
        assert_eq!(ev.source_id, "agent-1");
        assert_eq!(ev.priority, EventPriority::Normal);
        assert!(ev.tags.is_empty());
        assert!(ev.correlation_id.is_none());
        assert!(!ev.is_expired());
    }

    #[test]
    fn test_categories() {
        assert_eq!(EventType::WorkflowPaused.category(), EventCategory::Workflow);
        assert_eq!(EventType::TaskAssigned.category(), EventCategory::Task);
        assert_eq!(EventType::AgentHeartbeat.category(), EventCategory::Agent);
        assert_eq!(EventType::MessageReceived.category(), EventCategory::Message);
        assert_eq!(EventType::StateSnapshot.category(), EventCategory::State);
        assert_eq!(EventType::SystemShutdown.category(), EventCategory::System);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Low < EventPriority::Normal);
        assert!(EventPriority::Normal < EventPriority::High);
        assert!(EventPriority::High < EventPriority::Critical);
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EventFilter::all();
        assert!(filter.matches(&event(EventType::SystemError)));
        assert!(filter.matches(
            &event(EventType::TaskFailed)
                .with_priority(EventPriority::Low)
                .with_tag("x")
        ));
    }

    #[test]
    fn test_filter_by_type_and_source() {
        let filter = EventFilter::all()
            .event_types([EventType::TaskCompleted, EventType::TaskFailed])
            .sources(["agent-1"]);
        assert!(filter.matches(&event(EventType::TaskCompleted)));
        assert!(!filter.matches(&event(EventType::TaskStarted)));

        let other = Event::new(EventType::TaskCompleted, "agent-2", HashMap::new());
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_tags_are_subset_matched() {
        let ev = event(EventType::TaskCompleted).with_tag("agent");

        let narrow = EventFilter::all().tags(["agent"]);
        assert!(narrow.matches(&ev));

        let wide = EventFilter::all().tags(["agent", "heartbeat"]);
        assert!(!wide.matches(&ev));

        let richer = event(EventType::TaskCompleted).with_tags(["agent", "heartbeat", "x"]);
        assert!(wide.matches(&richer));
    }

    #[test]
    fn test_priority_floor() {
        let filter = EventFilter::all().min_priority(EventPriority::High);
        assert!(!filter.matches(&event(EventType::SystemError)));
        assert!(filter.matches(&event(EventType::SystemError).with_priority(EventPriority::High)));
        assert!(
            filter.matches(&event(EventType::SystemError).with_priority(EventPriority::Critical))
        );
    }

    #[test]
    fn test_metadata_equality() {
        let filter = EventFilter::all().metadata("workflow_id", json!("wf-1"));
        let hit = event(EventType::WorkflowStarted).with_metadata("workflow_id", json!("wf-1"));
        let miss = event(EventType::WorkflowStarted).with_metadata("workflow_id", json!("wf-2"));
        let absent = event(EventType::WorkflowStarted);
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(!filter.matches(&absent));
    }

    #[test]
    fn test_matches_is_pure() {
        let filter = EventFilter::all()
            .tags(["a"])
            .min_priority(EventPriority::Normal);
        let ev = event(EventType::StateChanged).with_tag("a");
        let first = filter.matches(&ev);
        for _ in 0..10 {
            assert_eq!(filter.matches(&ev), first);
        }
        // Fields outside the filter do not affect the result.
        let mut other = ev.clone();
        other.payload.insert("noise".into(), json!(42));
        other.correlation_id = Some("c".into());
        assert_eq!(filter.matches(&other), first);
    }

    #[test]
    fn test_event_serialization() {
        let ev = event(EventType::AgentRegistered)
            .with_tags(["zeta", "alpha"])
            .with_priority(EventPriority::Critical)
            .with_correlation("c-1");
        let json = ev.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event_type"], json!("agent_registered"));
        assert_eq!(value["priority"], json!("critical"));
        // Sets become ordered lists.
        assert_eq!(value["tags"], json!(["alpha", "zeta"]));
        assert_eq!(value["expires_at"], serde_json::Value::Null);

        let back = Event::from_json(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_event_ttl() {
        let ev = event(EventType::StateChanged).with_ttl(Duration::from_secs(5));
        assert!(!ev.is_expired());
        assert!(ev.is_expired_at(ev.timestamp + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let ev = event(EventType::StateChanged).with_ttl(Duration::from_secs(9_000_000_000_000));
        assert!(ev.expires_at.is_none());
        assert!(!ev.is_expired());
    }
}
