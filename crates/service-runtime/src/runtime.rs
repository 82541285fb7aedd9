//! # Service Runtime
//!
//! Owns the bus, the channel establisher, the supervisor and the companion
//! client, and drives them from service control codes.
//!
//! ## Startup Sequence
//!
//! 1. Hand the configured processes to the supervisor, with the metrics
//!    switch applied before each start of the companion client
//! 2. Start the session listener and the companion client
//! 3. Register the shutdown hooks (drain the client, then stop children
//!    and close channels)
//! 4. Publish `ServiceStarted`
//! 5. If a user is already logged on, publish a synthetic `SessionLogon`
//!    so the children start without waiting for the next logon

use crate::container::ServiceConfig;
use crate::features::{CompanionClient, MetricsSwitch, SecretsFile};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_bus::{
    InMemoryEventBus, ServiceControl, ServiceEvent, ShutdownCoordinator, ShutdownPhase, StopHook,
};
use shared_types::{OwnedHandle, PlatformError, SessionChange, SharedPlatform};
use std::sync::Arc;
use sv_02_secure_channel::{ChannelEstablisher, PipeServerFactory};
use sv_03_process_supervisor::ProcessSupervisor;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Errors raised while starting the service.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("service already started")]
    AlreadyStarted,
}

/// The running service.
pub struct ServiceRuntime {
    config: ServiceConfig,
    platform: SharedPlatform,
    bus: Arc<InMemoryEventBus>,
    channels: ChannelEstablisher,
    supervisor: ProcessSupervisor,
    client: CompanionClient,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRuntime {
    pub fn new(
        config: ServiceConfig,
        platform: SharedPlatform,
        pipes: Arc<dyn PipeServerFactory>,
    ) -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        let channels = ChannelEstablisher::with_auth_timeout(
            platform.clone(),
            pipes,
            bus.clone(),
            config.ipc.auth_timeout(),
        );
        let supervisor = ProcessSupervisor::new(
            platform.clone(),
            channels.clone(),
            bus.clone(),
            config.supervisor.into(),
        );
        let client = CompanionClient::new(
            config.client.channel.clone(),
            config.client.status_timeout(),
            channels.clone(),
            supervisor.clone(),
            SecretsFile::new(config.client.secret_file.clone()),
        );
        let shutdown = Arc::new(ShutdownCoordinator::new(
            bus.clone(),
            config.shutdown.drain_timeout(),
        ));

        Self {
            config,
            platform,
            bus,
            channels,
            supervisor,
            client,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start following the bus and kick off the children if a user is
    /// logged on.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if !self.tasks.lock().is_empty() {
            return Err(RuntimeError::AlreadyStarted);
        }

        self.supervisor.add_start_hook(Arc::new(MetricsSwitch::new(
            self.config.client.channel.clone(),
            self.config.client.site_config_file.clone(),
            self.config.client.gpii_config.clone(),
        )));
        self.supervisor.configure(self.config.processes.clone());
        {
            let mut tasks = self.tasks.lock();
            tasks.push(self.supervisor.spawn_session_listener());
            tasks.push(self.client.spawn(&self.bus));
        }

        self.shutdown.add_drain_hook(Arc::new(self.client.clone()));
        self.shutdown.add_stop_hook(Arc::new(self.supervisor.clone()));
        self.shutdown.add_stop_hook(Arc::new(CloseChannels(self.channels.clone())));

        self.bus.emit(ServiceEvent::ServiceStarted);
        info!(
            processes = self.config.processes.len(),
            is_service = self.platform.is_service(),
            "Service started"
        );

        if self.is_user_logged_on()? {
            debug!("User already logged on");
            self.session_change(SessionChange::SessionLogon);
        }
        Ok(())
    }

    /// Handle a control code from the service control manager. Stop codes
    /// shut the service down before returning.
    pub async fn control(&self, control: ServiceControl) {
        debug!(control = ?control, "Service control");
        self.bus.emit(ServiceEvent::ControlReceived { control });
        if control.is_stop() {
            self.shutdown().await;
        }
    }

    /// Publish an interactive session change.
    pub fn session_change(&self, change: SessionChange) {
        debug!(change = ?change, "Session change");
        self.bus.emit(ServiceEvent::SessionChanged(change));
    }

    /// Run the two-phase shutdown. Later calls return at once.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Resolves once shutdown has finished.
    pub async fn stopped(&self) {
        let mut phase = self.shutdown.watch();
        // An error means the coordinator is gone, which only happens after
        // shutdown.
        phase
            .wait_for(|phase| *phase == ShutdownPhase::Stopped)
            .await
            .ok();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<InMemoryEventBus> {
        self.bus.clone()
    }

    pub fn channels(&self) -> &ChannelEstablisher {
        &self.channels
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn client(&self) -> &CompanionClient {
        &self.client
    }

    fn is_user_logged_on(&self) -> Result<bool, PlatformError> {
        let token = self
            .platform
            .desktop_user_token()?
            .map(|raw| OwnedHandle::new(self.platform.clone(), raw));
        Ok(token.is_some())
    }
}

/// Closes every channel once the children are stopped.
struct CloseChannels(ChannelEstablisher);

#[async_trait]
impl StopHook for CloseChannels {
    fn name(&self) -> &str {
        "channels"
    }

    async fn stop(&self) {
        self.0.close_all();
    }
}
