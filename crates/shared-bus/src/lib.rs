//! # Shared Bus - Control/Event Bus
//!
//! One process-wide publish/subscribe hub. Channel lifecycle, interactive
//! session changes and supervisor actions are published here, so features
//! react to each other without importing each other's internals.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │  Supervisor  │                    │ Client chan. │
//! │              │    emit()          │              │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │  Event Bus   │          │
//!                  │              │ ─────────┘
//!                  └──────────────┘  subscribe()
//! ```
//!
//! The bus also owns the orderly two-phase shutdown
//! ([`ShutdownCoordinator`]).

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod events;
pub mod publisher;
pub mod shutdown;
pub mod subscriber;

pub use events::{EventFilter, EventTopic, ServiceControl, ServiceEvent};
pub use publisher::InMemoryEventBus;
pub use shutdown::{DrainHook, ShutdownCoordinator, ShutdownPhase, StopHook, DEFAULT_DRAIN_TIMEOUT};
pub use subscriber::{EventStream, Subscription, SubscriptionError};

/// Maximum events to buffer per subscriber before the slowest one lags.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
