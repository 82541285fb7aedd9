//! # Process Supervisor
//!
//! Starts the configured processes in the desktop user's session, watches
//! them with the shared [`ProcessMonitor`] and restarts crashed ones under
//! the [`RestartPolicy`].
//!
//! Publishes `ProcessStarting`, `ProcessStarted`, `ProcessStopped` and
//! `ProcessAbandoned` on the bus, and reacts to `SessionChanged`: logon
//! starts every process, logoff stops them.

use crate::domain::{ChildProcessRecord, ProcessConfig, ProcessState, RestartDecision, RestartPolicy};
use crate::error::{MonitorError, SupervisorError};
use crate::liveness::{is_process_running, process_creation_time};
use crate::monitor::{FailureAttribution, MonitorOutcome, ProcessMonitor};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_bus::{EventFilter, EventTopic, InMemoryEventBus, ServiceEvent, StopHook};
use shared_types::{Pid, SessionChange, SharedPlatform};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use sv_02_secure_channel::{ChannelEstablisher, ExecuteOptions, StartOptions};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Adjusts a process's configuration right before each start, restarts
/// included. Setting `disabled` cancels that start.
pub trait StartHook: Send + Sync {
    fn starting(&self, config: &mut ProcessConfig);
}

/// Supervisor tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorConfig {
    pub restart: RestartPolicy,
    pub attribution: FailureAttribution,
}

struct Inner {
    platform: SharedPlatform,
    channels: ChannelEstablisher,
    bus: Arc<InMemoryEventBus>,
    monitor: ProcessMonitor,
    policy: RestartPolicy,
    configured: Mutex<BTreeMap<String, ProcessConfig>>,
    records: Mutex<BTreeMap<String, ChildProcessRecord>>,
    start_hooks: Mutex<Vec<Arc<dyn StartHook>>>,
}

/// Owns every supervised process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        platform: SharedPlatform,
        channels: ChannelEstablisher,
        bus: Arc<InMemoryEventBus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                monitor: ProcessMonitor::new(platform.clone(), config.attribution),
                platform,
                channels,
                bus,
                policy: config.restart,
                configured: Mutex::new(BTreeMap::new()),
                records: Mutex::new(BTreeMap::new()),
                start_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replace the configured process table. Keys override the `key` field.
    ///
    /// Failure counts start over and abandoned processes become startable
    /// again. Running processes keep going until their next exit.
    pub fn configure(&self, processes: BTreeMap<String, ProcessConfig>) {
        let processes: BTreeMap<String, ProcessConfig> = processes
            .into_iter()
            .map(|(key, mut config)| {
                config.key.clone_from(&key);
                (key, config)
            })
            .collect();

        for (key, record) in self.inner.records.lock().iter_mut() {
            record.failure_count = 0;
            if record.state == ProcessState::Abandoned {
                debug!(key = %key, "Abandoned process reconfigured");
                record.state = ProcessState::Stopped;
            }
            if let Some(config) = processes.get(key) {
                record.config = config.clone();
            }
        }
        *self.inner.configured.lock() = processes;
    }

    pub fn add_start_hook(&self, hook: Arc<dyn StartHook>) {
        self.inner.start_hooks.lock().push(hook);
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.inner.monitor
    }

    // =========================================================================
    // STARTING
    // =========================================================================

    /// Start every configured process that is not disabled, one after the
    /// other. A failure is logged and does not stop the others.
    pub async fn start_child_processes(&self) {
        let configs: Vec<ProcessConfig> = self.inner.configured.lock().values().cloned().collect();
        for config in configs {
            if config.disabled {
                debug!(key = %config.key, "Process disabled, not starting");
                continue;
            }
            let key = config.key.clone();
            match self.start_child_process(config).await {
                Ok(_) | Err(SupervisorError::Disabled { .. }) => {}
                Err(e) => error!(key = %key, error = %e, "Failed to start process"),
            }
        }
    }

    /// Start one configured process by key.
    pub async fn start_configured(&self, key: &str) -> Result<Option<Pid>, SupervisorError> {
        let config = self
            .inner
            .configured
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownProcess { key: key.to_string() })?;
        self.start_child_process(config).await
    }

    /// Start a process. Returns its PID, or `None` for a pipe-only entry.
    pub async fn start_child_process(
        &self,
        mut config: ProcessConfig,
    ) -> Result<Option<Pid>, SupervisorError> {
        let key = config.key.clone();
        if !config.is_startable() {
            return Err(SupervisorError::NothingToStart { key });
        }
        let hooks = self.inner.start_hooks.lock().clone();
        for hook in hooks {
            hook.starting(&mut config);
        }
        if config.disabled {
            info!(key = %key, "Process disabled, not starting");
            return Err(SupervisorError::Disabled { key });
        }

        self.begin_start(&config)?;
        info!(key = %key, command = ?config.command, "Starting process");
        self.inner.bus.emit(ServiceEvent::ProcessStarting { key: key.clone() });

        let launched = self.launch(&config).await;
        let pid = match launched {
            Ok(pid) => pid,
            Err(e) => {
                if let Some(record) = self.inner.records.lock().get_mut(&key) {
                    record.state = ProcessState::Stopped;
                }
                return Err(e);
            }
        };

        let watch = config.command.is_some() && config.auto_restart;
        {
            let mut records = self.inner.records.lock();
            if let Some(record) = records.get_mut(&key) {
                record.pid = pid;
                record.creation = pid.and_then(|pid| process_creation_time(&*self.inner.platform, pid));
                record.state = ProcessState::Running;
                record.watched = watch;
            }
        }

        if let Some(pid) = pid {
            self.inner.bus.emit(ServiceEvent::ProcessStarted {
                key: key.clone(),
                pid,
            });
            if watch {
                self.watch(key, pid);
            }
        }
        Ok(pid)
    }

    /// Claim the record for a start, rejecting concurrent or duplicate starts.
    fn begin_start(&self, config: &ProcessConfig) -> Result<(), SupervisorError> {
        let key = &config.key;
        let mut records = self.inner.records.lock();
        let record = records
            .entry(key.clone())
            .or_insert_with(|| ChildProcessRecord::new(config.clone()));

        if record.state == ProcessState::Starting {
            warn!(key = %key, "Process is already starting");
            return Err(SupervisorError::AlreadyStarting { key: key.clone() });
        }
        if let Some(pid) = record.pid {
            if is_process_running(&*self.inner.platform, pid, record.creation) {
                warn!(key = %key, pid = %pid, "Process is already running");
                return Err(SupervisorError::AlreadyRunning { key: key.clone() });
            }
        }

        record.config = config.clone();
        record.pid = None;
        record.creation = None;
        record.last_start = Some(Instant::now());
        record.shutdown = false;
        record.watched = false;
        record.state = ProcessState::Starting;
        Ok(())
    }

    async fn launch(&self, config: &ProcessConfig) -> Result<Option<Pid>, SupervisorError> {
        let execute = ExecuteOptions {
            env: config.env.clone(),
            current_dir: config.current_dir.clone(),
            ..ExecuteOptions::default()
        };

        if let Some(channel) = &config.ipc {
            let options = StartOptions {
                authenticate: !config.no_auth,
                admin: config.admin,
                messaging: true,
                process_key: Some(config.key.clone()),
                execute,
            };
            let started = self
                .inner
                .channels
                .start_process(config.command.as_deref(), Some(channel), options)
                .await?;
            // Connection outcome is published on the bus by the establisher.
            drop(started.connection);
            return Ok(started.pid);
        }

        match &config.command {
            Some(command) => Ok(Some(self.inner.channels.execute(command, &execute)?)),
            None => Err(SupervisorError::NothingToStart {
                key: config.key.clone(),
            }),
        }
    }

    // =========================================================================
    // WATCHING AND RESTARTING
    // =========================================================================

    fn watch(&self, key: String, pid: Pid) {
        let monitored = self.inner.monitor.monitor(pid);
        let supervisor = self.clone();
        tokio::spawn(async move {
            match monitored.await {
                Ok(MonitorOutcome::Exited(pid)) => supervisor.on_exit(&key, pid),
                Ok(MonitorOutcome::Removed) => debug!(key = %key, pid = %pid, "No longer watched"),
                Err(MonitorError::Platform(e))
                    if !is_process_running(&*supervisor.inner.platform, pid, None) =>
                {
                    // Gone before the watch was registered.
                    debug!(key = %key, pid = %pid, error = %e, "Process ended before it was watched");
                    supervisor.on_exit(&key, pid);
                }
                Err(e) => error!(key = %key, pid = %pid, error = %e, "Unable to watch process"),
            }
        });
    }

    fn on_exit(&self, key: &str, pid: Pid) {
        info!(key = %key, pid = %pid, "Child process died");
        self.inner.bus.emit(ServiceEvent::ProcessStopped {
            key: key.to_string(),
            pid,
        });

        let decision = {
            let mut records = self.inner.records.lock();
            let Some(record) = records.get_mut(key) else {
                return;
            };
            if record.pid != Some(pid) {
                debug!(key = %key, pid = %pid, "Exit of a previous instance");
                return;
            }
            record.watched = false;

            if record.shutdown || !record.config.auto_restart {
                info!(key = %key, "Not restarting process (shutting down)");
                record.state = ProcessState::Stopped;
                return;
            }

            record.state = ProcessState::Crashed;
            let uptime = record.last_start.map(|t| t.elapsed()).unwrap_or_default();
            let decision = self.inner.policy.on_exit(uptime, record.failure_count);
            match decision {
                RestartDecision::Restart { failures, .. } => {
                    if failures > 0 {
                        warn!(key = %key, failures, "Process failed at start");
                    }
                    record.failure_count = failures;
                    record.state = ProcessState::Restarting;
                }
                RestartDecision::GiveUp { failures } => {
                    record.failure_count = failures;
                    record.state = ProcessState::Abandoned;
                }
            }
            decision
        };

        match decision {
            RestartDecision::Restart { delay, .. } => {
                debug!(key = %key, delay_ms = delay.as_millis() as u64, "Restarting process");
                let supervisor = self.clone();
                let key = key.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    supervisor.restart(&key).await;
                });
            }
            RestartDecision::GiveUp { failures } => {
                error!(key = %key, failures, "Unable to start process, giving up");
                self.inner.bus.emit(ServiceEvent::ProcessAbandoned {
                    key: key.to_string(),
                    failures,
                });
            }
        }
    }

    async fn restart(&self, key: &str) {
        let config = {
            let records = self.inner.records.lock();
            match records.get(key) {
                Some(record) if record.state == ProcessState::Restarting && !record.shutdown => {
                    record.config.clone()
                }
                _ => {
                    debug!(key = %key, "Restart cancelled");
                    return;
                }
            }
        };
        match self.start_child_process(config).await {
            Ok(_) => {}
            Err(SupervisorError::Disabled { .. }) => {
                if let Some(record) = self.inner.records.lock().get_mut(key) {
                    record.state = ProcessState::Stopped;
                }
            }
            Err(e) => error!(key = %key, error = %e, "Restart failed"),
        }
    }

    // =========================================================================
    // STOPPING
    // =========================================================================

    /// Stop a process. Unless `allow_restart`, it will not be restarted.
    pub fn stop_child_process(&self, key: &str, allow_restart: bool) {
        let mut records = self.inner.records.lock();
        let Some(record) = records.get_mut(key) else {
            return;
        };
        info!(key = %key, command = ?record.config.command, "Stopping process");
        record.shutdown = !allow_restart;

        let running = record
            .pid
            .is_some_and(|pid| is_process_running(&*self.inner.platform, pid, record.creation));
        if !running {
            debug!(key = %key, "Process is not running");
            if record.state == ProcessState::Restarting && record.shutdown {
                record.state = ProcessState::Stopped;
            }
            return;
        }

        if let Some(pid) = record.pid {
            record.state = if record.watched {
                ProcessState::Stopping
            } else {
                ProcessState::Stopped
            };
            if let Err(e) = self.inner.platform.terminate_process(pid) {
                warn!(key = %key, pid = %pid, error = %e, "Failed to terminate process");
            }
        }
    }

    /// Stop every process without restarting.
    pub fn stop_child_processes(&self) {
        info!("Stopping processes");
        let keys: Vec<String> = self.inner.records.lock().keys().cloned().collect();
        for key in keys {
            self.stop_child_process(&key, false);
        }
    }

    /// Mark the next termination of a process as intentional.
    pub fn dont_restart(&self, key: &str) {
        if let Some(record) = self.inner.records.lock().get_mut(key) {
            record.shutdown = true;
        }
    }

    // =========================================================================
    // QUERIES AND EVENTS
    // =========================================================================

    pub fn record(&self, key: &str) -> Option<ChildProcessRecord> {
        self.inner.records.lock().get(key).cloned()
    }

    pub fn state(&self, key: &str) -> Option<ProcessState> {
        self.inner.records.lock().get(key).map(|record| record.state)
    }

    /// Key of the process behind a channel.
    pub fn key_for_channel(&self, channel: &str) -> Option<String> {
        self.inner
            .records
            .lock()
            .values()
            .find(|record| record.config.ipc.as_deref() == Some(channel))
            .map(|record| record.key().to_string())
    }

    /// Whether the recorded instance of `key` is alive.
    pub fn is_running(&self, key: &str) -> bool {
        let records = self.inner.records.lock();
        records.get(key).is_some_and(|record| {
            record
                .pid
                .is_some_and(|pid| is_process_running(&*self.inner.platform, pid, record.creation))
        })
    }

    /// React to an interactive session change.
    pub async fn session_change(&self, change: SessionChange) {
        debug!(change = ?change, "Session change");
        match change {
            SessionChange::SessionLogon => self.start_child_processes().await,
            SessionChange::SessionLogoff => self.stop_child_processes(),
            _ => {}
        }
    }

    /// Follow `SessionChanged` events on the bus.
    pub fn spawn_session_listener(&self) -> JoinHandle<()> {
        let mut changes = self
            .inner
            .bus
            .event_stream(EventFilter::topics(vec![EventTopic::Session]))
            .filter_map(|event| match event {
                ServiceEvent::SessionChanged(change) => Some(change),
                _ => None,
            });
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                supervisor.session_change(change).await;
            }
        })
    }
}

#[async_trait]
impl StopHook for ProcessSupervisor {
    fn name(&self) -> &str {
        "process-supervisor"
    }

    async fn stop(&self) {
        self.stop_child_processes();
        self.inner.monitor.clear();
    }
}
