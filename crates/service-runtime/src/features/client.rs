//! # Companion Client
//!
//! The GPII user process connects back on its channel once started. While
//! it is connected the service:
//!
//! - answers its requests: `closing` (do not restart it when it exits),
//!   `execute`, `getClientCredentials` and `sign`
//! - polls it with `status` requests; a client that does not report
//!   `isRunning` within the status timeout is stopped (and restarted)
//! - stops it (and lets it restart) when the channel closes unexpectedly
//! - asks it to `shutdown` while the service drains
//!
//! Requests in both directions carry their arguments in `requestData`.

use crate::features::execute::{execute, ExecuteRequest};
use crate::features::secrets::{SecretsFile, SignRequest};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use shared_bus::{DrainHook, EventFilter, EventTopic, InMemoryEventBus, ServiceEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sv_01_pipe_messaging::{HandlerError, RequestHandler};
use sv_02_secure_channel::{ChannelError, ChannelEstablisher};
use sv_03_process_supervisor::ProcessSupervisor;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

struct Inner {
    channel: String,
    status_timeout: Duration,
    channels: ChannelEstablisher,
    supervisor: ProcessSupervisor,
    secrets: SecretsFile,
    in_shutdown: AtomicBool,
    /// Bumped on every connect and close; a status loop from an older
    /// connection stops when it sees a newer value.
    generation: AtomicU64,
}

/// Service side of the companion client's channel.
#[derive(Clone)]
pub struct CompanionClient {
    inner: Arc<Inner>,
}

impl CompanionClient {
    pub fn new(
        channel: impl Into<String>,
        status_timeout: Duration,
        channels: ChannelEstablisher,
        supervisor: ProcessSupervisor,
        secrets: SecretsFile,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel: channel.into(),
                status_timeout,
                channels,
                supervisor,
                secrets,
                in_shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// True after the client said it is closing, or the service asked it to
    /// shut down.
    pub fn in_shutdown(&self) -> bool {
        self.inner.in_shutdown.load(Ordering::SeqCst)
    }

    /// Follow the lifecycle events of the client's channel.
    pub fn spawn(&self, bus: &InMemoryEventBus) -> JoinHandle<()> {
        let mut subscription = bus.subscribe(
            EventFilter::topics(vec![EventTopic::Channel]).with_subject(self.inner.channel.clone()),
        );
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event {
                    ServiceEvent::ChannelConnected { .. } => client.connected(),
                    ServiceEvent::ChannelClosed { .. } => client.closed(),
                    _ => {}
                }
            }
        })
    }

    /// The client authenticated and its session is ready.
    pub fn connected(&self) {
        info!(channel = %self.inner.channel, "Established IPC channel with the GPII user process");
        self.inner.in_shutdown.store(false, Ordering::SeqCst);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.inner.channels.register_handler(
            &self.inner.channel,
            Arc::new(ClientRequests {
                client: Arc::downgrade(&self.inner),
            }),
        );

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.monitor_status(generation).await });
    }

    /// The client's session closed.
    pub fn closed(&self) {
        if self.inner.channels.session(&self.inner.channel).is_some() {
            debug!(channel = %self.inner.channel, "Replaced session closed");
            return;
        }
        info!(channel = %self.inner.channel, "Lost IPC channel with the GPII user process");
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if !self.in_shutdown() {
            self.inner.restart_process();
        }
    }

    /// Ask the client to shut down. Returns once it replied, or at once if
    /// it is not connected or already closing.
    pub async fn shutdown(&self) {
        if self.inner.channels.session(&self.inner.channel).is_none() {
            return;
        }
        if self.inner.in_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel = %self.inner.channel, "Asking the GPII user process to shut down");
        if let Err(e) = self.inner.send_request("shutdown", None).await {
            warn!(channel = %self.inner.channel, error = %e, "Shutdown request failed");
        }
    }

    /// Send a request to the client and wait for its reply.
    pub async fn send_request(
        &self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Value, ChannelError> {
        self.inner.send_request(request_type, request_data).await
    }
}

impl Inner {
    async fn send_request(
        &self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Value, ChannelError> {
        let mut request = json!({ "requestType": request_type });
        if let Some(data) = request_data {
            request["requestData"] = data;
        }
        self.channels.send_request(&self.channel, request).await
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn process_key(&self) -> Option<String> {
        self.supervisor.key_for_channel(&self.channel)
    }

    fn restart_process(&self) {
        match self.process_key() {
            Some(key) => self.supervisor.stop_child_process(&key, true),
            None => debug!(channel = %self.channel, "No process behind the channel"),
        }
    }

    /// Poll the client until it goes away or stops answering.
    async fn monitor_status(self: Arc<Self>, generation: u64) {
        loop {
            let deadline = Instant::now() + self.status_timeout;
            let running = matches!(
                timeout(self.status_timeout, self.send_request("status", None)).await,
                Ok(Ok(reply)) if reply.get("isRunning") == Some(&Value::Bool(true))
            );
            sleep_until(deadline).await;

            if self.in_shutdown.load(Ordering::SeqCst) || !self.is_current(generation) {
                return;
            }
            if !running {
                error!(channel = %self.channel, "GPII client is not responding");
                self.restart_process();
                return;
            }
        }
    }
}

/// Requests the client sends to the service.
struct ClientRequests {
    client: Weak<Inner>,
}

#[async_trait]
impl RequestHandler for ClientRequests {
    async fn handle(&self, mut request: Map<String, Value>) -> Result<Value, HandlerError> {
        let Some(client) = self.client.upgrade() else {
            return Ok(Value::Null);
        };
        let data = request.remove("requestData").unwrap_or(Value::Null);
        let request_type = request.get("requestType").and_then(Value::as_str);
        debug!(channel = %client.channel, request_type = ?request_type, "Got request");

        match request_type {
            Some("closing") => {
                info!(channel = %client.channel, "GPII client is closing itself");
                client.in_shutdown.store(true, Ordering::SeqCst);
                if let Some(key) = client.process_key() {
                    client.supervisor.dont_restart(&key);
                }
                Ok(Value::Null)
            }
            Some("execute") => {
                let request: ExecuteRequest = request_data(data)?;
                let result = execute(&request).await.map_err(|e| {
                    warn!(channel = %client.channel, error = %e, "Execute request failed");
                    HandlerError::from_error(&e).with_field("isError", Value::Bool(true))
                })?;
                serde_json::to_value(result).map_err(|e| HandlerError::from_error(&e))
            }
            Some("getClientCredentials") => Ok(client.secrets.client_credentials()),
            Some("sign") => {
                let request: SignRequest = request_data(data)?;
                Ok(client.secrets.sign(&request).map_or(Value::Null, Value::String))
            }
            _ => Ok(Value::Null),
        }
    }
}

fn request_data<T: DeserializeOwned>(data: Value) -> Result<T, HandlerError> {
    serde_json::from_value(data).map_err(|e| HandlerError::from_error(&e))
}

#[async_trait]
impl DrainHook for CompanionClient {
    fn name(&self) -> &str {
        "gpii-client"
    }

    async fn drain(&self) {
        self.shutdown().await;
    }
}
