//! Background task supervision: shared shutdown signal and cooperative join.
//!
//! Each component that owns periodic or long-running tasks (the message bus
//! cleanup loop, the event dispatcher and history sweep) holds one
//! [`Supervisor`]. Tasks watch the shutdown signal and exit at their next
//! await point; [`Supervisor::shutdown`] then awaits every handle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown signal manager for a component's background tasks.
pub struct Supervisor {
    /// Owning component, for log context.
    component: &'static str,
    /// Send side of the shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Running task handles with their names.
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    /// Set by the caller that won [`Supervisor::claim`], cleared on shutdown.
    claimed: AtomicBool,
}

impl Supervisor {
    /// Create a new supervisor for the named component.
    pub fn new(component: &'static str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            component,
            shutdown_tx: tx,
            tasks: Mutex::new(Vec::new()),
            claimed: AtomicBool::new(false),
        }
    }

    /// Reserve the right to start this component's tasks. Exactly one of any
    /// number of concurrent callers gets true until the next shutdown.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Get a receiver that will be notified on the next shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a supervised task. The closure receives a shutdown receiver and
    /// must return when it observes a change on it.
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.subscribe()));
        debug!(component = self.component, task = name, "Background task spawned");
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, handle));
    }

    /// Whether the component is claimed or any supervised task is live.
    pub fn is_running(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
            || !self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Number of supervised tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Signal shutdown, await every task, then re-arm the signal so the
    /// component can be started again.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if tasks.is_empty() {
            self.claimed.store(false, Ordering::SeqCst);
            return;
        }

        info!(component = self.component, tasks = tasks.len(), "Stopping background tasks");
        self.shutdown_tx.send_replace(true);

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(
                    component = self.component,
                    task = name,
                    error = %e,
                    "Background task ended abnormally"
                );
            }
        }

        self.shutdown_tx.send_replace(false);
        self.claimed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let supervisor = Supervisor::new("test");
        assert!(!supervisor.is_running());

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        supervisor.spawn("ticker", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        assert!(supervisor.is_running());
        assert_eq!(supervisor.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.shutdown().await;
        assert!(!supervisor.is_running());

        let after = ticks.load(Ordering::SeqCst);
        assert!(after > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let supervisor = Supervisor::new("test");
        for _ in 0..2 {
            supervisor.spawn("waiter", |mut shutdown| async move {
                let _ = shutdown.changed().await;
            });
            assert!(!*supervisor.subscribe().borrow());
            supervisor.shutdown().await;
        }
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_shutdown() {
        let supervisor = Arc::new(Supervisor::new("test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            handles.push(tokio::spawn(async move { supervisor.claim() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(supervisor.is_running());

        supervisor.shutdown().await;
        assert!(!supervisor.is_running());
        assert!(supervisor.claim());
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks_is_noop() {
        let supervisor = Supervisor::new("test");
        supervisor.shutdown().await;
        assert!(!*supervisor.subscribe().borrow());
    }
}
