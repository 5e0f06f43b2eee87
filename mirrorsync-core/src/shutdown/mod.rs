//! Graceful shutdown coordination
//!
//! A [`ShutdownTrigger`] owns a `watch` flag; every background task holds a
//! cloned [`Shutdown`] listener and selects on [`Shutdown::cancelled`]. Unlike
//! a broadcast channel, a listener created after the trigger fired still
//! observes it.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

/// Listener side of a shutdown flag
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is dropped
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Owner side of a shutdown flag
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// New listener bound to this trigger
    pub fn listener(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Process-level coordinator driven by OS signals
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    trigger: ShutdownTrigger,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            trigger: ShutdownTrigger::new(),
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> Shutdown {
        self.trigger.listener()
    }

    /// Request shutdown; repeated calls are ignored
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        if *state != ShutdownState::Running {
            warn!("Shutdown already in progress");
            return;
        }

        info!("Initiating graceful shutdown");
        *state = ShutdownState::ShuttingDown;
        drop(state);

        self.trigger.trigger();
    }

    /// Mark shutdown as finished once components have stopped
    pub async fn complete(&self) {
        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait for a shutdown request
    pub async fn wait_for_shutdown(&self) {
        self.trigger.listener().cancelled().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown().await;
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Received Ctrl+C");
        coordinator.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_listener_observes_trigger() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();

        let listener = trigger.listener();
        assert!(listener.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), listener.cancelled())
            .await
            .expect("late listener should resolve immediately");
    }

    #[tokio::test]
    async fn test_listener_wakes_task() {
        let trigger = ShutdownTrigger::new();
        let listener = trigger.listener();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = listener.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_secs(10)) => false,
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_coordinator_states() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state().await, ShutdownState::Running);

        coordinator.shutdown().await;
        assert!(coordinator.is_shutting_down().await);
        coordinator.wait_for_shutdown().await;

        coordinator.complete().await;
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }
}
