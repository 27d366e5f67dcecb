//! Subscriber callbacks and the dispatch boundary that contains their failures.
//!
//! Handlers are async and fallible. A handler that returns `Err` or panics is
//! isolated by [`run_guarded`]: the failure is reported to the caller as a
//! [`MeshError::Handler`] and delivery to other subscribers continues.

use agentmesh_types::error::MeshError;
use agentmesh_types::event::Event;
use agentmesh_types::message::Message;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use uuid::Uuid;

/// Unique identifier for a subscription on the bus or the event system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives messages from the [`MessageBus`](crate::message_bus::MessageBus).
///
/// Implemented for any `Fn(Message) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Receives events from the [`EventSystem`](crate::event_system::EventSystem).
///
/// Implemented for any `Fn(Event) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Drive a handler future to completion, converting both `Err` returns and
/// panics into a [`MeshError::Handler`].
pub(crate) async fn run_guarded<Fut>(subscription: SubscriptionId, fut: Fut) -> Result<(), MeshError>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MeshError::Handler {
            subscription: subscription.to_string(),
            reason: format!("{e:#}"),
        }),
        Err(panic) => Err(MeshError::Handler {
            subscription: subscription.to_string(),
            reason: format!("panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
