//! Restart throttling.
//!
//! ```text
//! exit ─► uptime > reset_after ? ─yes─► failures = 0 ─► restart now
//!                               └no──► failures += 1
//!                                        ├─ failures > max_failures ─► give up
//!                                        └─ restart after failures × delay_step
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Throttle applied to auto-restarted processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Uptime after which a crash is not counted as a failure to start.
    #[serde(with = "secs")]
    pub reset_after: Duration,
    /// Delay added per consecutive early failure.
    #[serde(with = "secs")]
    pub delay_step: Duration,
    /// Consecutive early failures tolerated.
    pub max_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            reset_after: Duration::from_secs(20),
            delay_step: Duration::from_secs(10),
            max_failures: 5,
        }
    }
}

/// What to do after an auto-restart process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration, failures: u32 },
    GiveUp { failures: u32 },
}

impl RestartPolicy {
    /// Decide on a restart given the uptime of the instance that exited and
    /// the failure count before it.
    pub fn on_exit(&self, uptime: Duration, failures: u32) -> RestartDecision {
        let failures = if uptime > self.reset_after {
            0
        } else {
            failures.saturating_add(1)
        };
        if failures > self.max_failures {
            RestartDecision::GiveUp { failures }
        } else {
            RestartDecision::Restart {
                delay: self.delay_step * failures,
                failures,
            }
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
