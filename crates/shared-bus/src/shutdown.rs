//! # Two-Phase Shutdown
//!
//! Phase one publishes [`ServiceEvent::Stopping`] and runs every registered
//! [`DrainHook`] concurrently, bounded by the drain timeout. Phase two runs
//! every [`StopHook`] in registration order and publishes
//! [`ServiceEvent::Stopped`].

use crate::events::ServiceEvent;
use crate::publisher::InMemoryEventBus;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default bound on phase one.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Work that should finish before children are stopped.
#[async_trait]
pub trait DrainHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Finish in-flight work. May be abandoned when the drain times out.
    async fn drain(&self);
}

/// Final teardown, run after draining.
#[async_trait]
pub trait StopHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Stop everything this hook owns.
    async fn stop(&self);
}

/// Where the service is in its shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Stopped,
}

/// Runs the two shutdown phases once.
pub struct ShutdownCoordinator {
    bus: Arc<InMemoryEventBus>,
    drain_timeout: Duration,
    drain_hooks: Mutex<Vec<Arc<dyn DrainHook>>>,
    stop_hooks: Mutex<Vec<Arc<dyn StopHook>>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl ShutdownCoordinator {
    /// Create a coordinator publishing on `bus`.
    #[must_use]
    pub fn new(bus: Arc<InMemoryEventBus>, drain_timeout: Duration) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            bus,
            drain_timeout,
            drain_hooks: Mutex::new(Vec::new()),
            stop_hooks: Mutex::new(Vec::new()),
            phase,
        }
    }

    /// Register a phase-one hook.
    pub fn add_drain_hook(&self, hook: Arc<dyn DrainHook>) {
        self.drain_hooks.lock().push(hook);
    }

    /// Register a phase-two hook.
    pub fn add_stop_hook(&self, hook: Arc<dyn StopHook>) {
        self.stop_hooks.lock().push(hook);
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// True once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Watch phase changes.
    pub fn watch(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Run both phases. A second call returns immediately.
    pub async fn shutdown(&self) {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            debug!("Shutdown already in progress");
            return;
        }

        info!("Stopping service");
        self.bus.emit(ServiceEvent::Stopping);
        self.drain().await;

        let stop_hooks: Vec<_> = self.stop_hooks.lock().clone();
        for hook in stop_hooks {
            debug!(hook = hook.name(), "Running stop hook");
            hook.stop().await;
        }

        self.phase.send_replace(ShutdownPhase::Stopped);
        self.bus.emit(ServiceEvent::Stopped);
        info!("Service stopped");
    }

    async fn drain(&self) {
        let hooks: Vec<_> = self.drain_hooks.lock().clone();
        if hooks.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for hook in hooks {
            tasks.spawn(async move {
                hook.drain().await;
                hook.name().to_string()
            });
        }

        let all_done = async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(name) => debug!(hook = %name, "Drain hook finished"),
                    Err(e) => warn!(error = %e, "Drain hook failed"),
                }
            }
        };

        if tokio::time::timeout(self.drain_timeout, all_done).await.is_err() {
            warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Timed out waiting for in-flight work; continuing shutdown"
            );
        }
        // Dropping the set aborts anything still running.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventTopic};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DrainHook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn drain(&self) {
            tokio::time::sleep(self.delay).await;
            self.log.lock().push(format!("drain:{}", self.name));
        }
    }

    #[async_trait]
    impl StopHook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn stop(&self) {
            self.log.lock().push(format!("stop:{}", self.name));
        }
    }

    fn recorder(name: &'static str, delay: Duration, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            delay,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_drain_runs_before_stop() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut events = bus.subscribe(EventFilter::topics(vec![EventTopic::Shutdown]));
        let log = Arc::new(Mutex::new(Vec::new()));

        let coordinator = ShutdownCoordinator::new(bus.clone(), Duration::from_secs(1));
        coordinator.add_drain_hook(recorder("client", Duration::from_millis(20), &log));
        coordinator.add_stop_hook(recorder("children", Duration::ZERO, &log));

        coordinator.shutdown().await;

        assert_eq!(*log.lock(), vec!["drain:client", "stop:children"]);
        assert_eq!(coordinator.phase(), ShutdownPhase::Stopped);
        assert_eq!(events.try_recv(), Ok(Some(ServiceEvent::Stopping)));
        assert_eq!(events.try_recv(), Ok(Some(ServiceEvent::Stopped)));
    }

    #[tokio::test]
    async fn test_drain_is_bounded() {
        let bus = Arc::new(InMemoryEventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let coordinator = ShutdownCoordinator::new(bus, Duration::from_millis(50));
        coordinator.add_drain_hook(recorder("stuck", Duration::from_secs(60), &log));
        coordinator.add_stop_hook(recorder("children", Duration::ZERO, &log));

        tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
            .await
            .expect("timeout");

        assert_eq!(*log.lock(), vec!["stop:children"]);
    }

    #[tokio::test]
    async fn test_second_shutdown_is_ignored() {
        struct Counter(AtomicUsize);

        #[async_trait]
        impl StopHook for Counter {
            fn name(&self) -> &str {
                "counter"
            }

            async fn stop(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = Arc::new(InMemoryEventBus::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let coordinator = ShutdownCoordinator::new(bus, DEFAULT_DRAIN_TIMEOUT);
        coordinator.add_stop_hook(counter.clone());

        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown().await;
        coordinator.shutdown().await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_shutting_down());
    }
}
