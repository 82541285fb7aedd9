//! # GPII Service
//!
//! Runs in the service context and keeps the GPII user process running in
//! the interactive desktop session.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (`GPII_SERVICE_CONFIG`, then environment overrides)
//! 2. Install tracing at the configured level
//! 3. Build the Win32 platform and named-pipe factory
//! 4. Start the runtime; children start on the next logon, or at once if a
//!    user is already logged on
//! 5. On Ctrl+C (or a stop control code) drain the client and stop children

use anyhow::{Context, Result};
use service_runtime::container::{init_tracing, load_config};
use service_runtime::ServiceRuntime;
use shared_bus::ServiceControl;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("Failed to load the service configuration")?;
    init_tracing(&config.logging.level)?;
    info!(level = %config.logging.level, "Configuration loaded");

    let (platform, pipes) =
        service_runtime::adapters::system().context("Failed to initialise the platform")?;
    let runtime = ServiceRuntime::new(config, platform, pipes);
    runtime.start().await?;

    info!("Service is running. Press Ctrl+C to stop.");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            runtime.control(ServiceControl::Stop).await;
        }
        () = runtime.stopped() => {}
    }

    runtime.shutdown().await;
    Ok(())
}
