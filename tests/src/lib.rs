//! # GPII Service Test Suite
//!
//! Cross-crate integration flows and benchmarks.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── messaging_benchmarks.rs   # Frame codec throughput
//! └── src/integration/
//!     ├── channel_flows.rs          # Launch → pipe → challenge → session
//!     ├── supervisor_flows.rs       # Liveness, death-watch, restart throttle
//!     └── service_flows.rs          # Runtime from configuration to shutdown
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p gpii-tests
//! cargo test -p gpii-tests integration::supervisor_flows
//! cargo bench -p gpii-tests
//! ```

pub mod integration;
