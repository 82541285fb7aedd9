//! # Service Events
//!
//! The closed set of notifications that flow through the bus. Features
//! subscribe to the subset they care about instead of calling each other.

use serde::{Deserialize, Serialize};
use shared_types::entities::{Pid, SessionChange};

/// Control codes forwarded by the service control manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceControl {
    Stop,
    Shutdown,
    PreShutdown,
    Pause,
    Continue,
    Interrogate,
    /// Any other code, passed through unchanged.
    Other(u32),
}

impl ServiceControl {
    /// Map a raw `SERVICE_CONTROL_*` code.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x1 => Self::Stop,
            0x2 => Self::Pause,
            0x3 => Self::Continue,
            0x4 => Self::Interrogate,
            0x5 => Self::Shutdown,
            0xF => Self::PreShutdown,
            other => Self::Other(other),
        }
    }

    /// True for codes that end the service.
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop | Self::Shutdown | Self::PreShutdown)
    }
}

/// All events that can be published to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEvent {
    // =========================================================================
    // SERVICE CONTROL
    // =========================================================================
    /// The service finished starting.
    ServiceStarted,

    /// A control code arrived from the service control manager.
    ControlReceived { control: ServiceControl },

    /// The interactive session changed (logon, logoff, lock, ...).
    SessionChanged(SessionChange),

    // =========================================================================
    // CHANNELS
    // =========================================================================
    /// An authenticated session on the channel became ready.
    ChannelConnected { channel: String },

    /// The channel's session closed.
    ChannelClosed { channel: String },

    /// The channel's session failed.
    ChannelError { channel: String, reason: String },

    // =========================================================================
    // PROCESSES
    // =========================================================================
    /// A child process is about to be launched.
    ProcessStarting { key: String },

    /// A child process was launched.
    ProcessStarted { key: String, pid: Pid },

    /// A child process ended, for any reason.
    ProcessStopped { key: String, pid: Pid },

    /// A child process crashed too often and will not be restarted.
    ProcessAbandoned { key: String, failures: u32 },

    // =========================================================================
    // SHUTDOWN
    // =========================================================================
    /// Shutdown phase one: in-flight work is draining.
    Stopping,

    /// Shutdown phase two finished: every child has been stopped.
    Stopped,
}

impl ServiceEvent {
    /// Get the topic for this event.
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::ServiceStarted | Self::ControlReceived { .. } => EventTopic::Service,
            Self::SessionChanged(_) => EventTopic::Session,
            Self::ChannelConnected { .. }
            | Self::ChannelClosed { .. }
            | Self::ChannelError { .. } => EventTopic::Channel,
            Self::ProcessStarting { .. }
            | Self::ProcessStarted { .. }
            | Self::ProcessStopped { .. }
            | Self::ProcessAbandoned { .. } => EventTopic::Process,
            Self::Stopping | Self::Stopped => EventTopic::Shutdown,
        }
    }

    /// The channel name or process key the event is about, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::ChannelConnected { channel }
            | Self::ChannelClosed { channel }
            | Self::ChannelError { channel, .. } => Some(channel),
            Self::ProcessStarting { key }
            | Self::ProcessStarted { key, .. }
            | Self::ProcessStopped { key, .. }
            | Self::ProcessAbandoned { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Event topics for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Service start and control codes.
    Service,
    /// Interactive session changes.
    Session,
    /// Channel lifecycle.
    Channel,
    /// Child process lifecycle.
    Process,
    /// Shutdown phases.
    Shutdown,
    /// All events (no filtering).
    All,
}

/// Filter for subscribing to specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to include. Empty means all.
    pub topics: Vec<EventTopic>,
    /// Only events about this channel or process key.
    pub subject: Option<String>,
}

impl EventFilter {
    /// Create a filter that accepts all events.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for specific topics.
    #[must_use]
    pub fn topics(topics: Vec<EventTopic>) -> Self {
        Self {
            topics,
            subject: None,
        }
    }

    /// Restrict the filter to events about one channel or process key.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Check if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &ServiceEvent) -> bool {
        let topic_match = self.topics.is_empty()
            || self.topics.contains(&EventTopic::All)
            || self.topics.contains(&event.topic());

        let subject_match = match &self.subject {
            None => true,
            Some(subject) => event.subject() == Some(subject.as_str()),
        };

        topic_match && subject_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topic_mapping() {
        let event = ServiceEvent::ProcessStopped {
            key: "gpii".into(),
            pid: Pid(8),
        };
        assert_eq!(event.topic(), EventTopic::Process);
        assert_eq!(event.subject(), Some("gpii"));
        assert_eq!(ServiceEvent::Stopped.topic(), EventTopic::Shutdown);
    }

    #[test]
    fn test_filter_all() {
        let filter = EventFilter::all();
        assert!(filter.matches(&ServiceEvent::ServiceStarted));
        assert!(filter.matches(&ServiceEvent::SessionChanged(SessionChange::SessionLock)));
    }

    #[test]
    fn test_filter_by_subject() {
        let filter = EventFilter::topics(vec![EventTopic::Channel]).with_subject("gpii");

        assert!(filter.matches(&ServiceEvent::ChannelConnected {
            channel: "gpii".into()
        }));
        assert!(!filter.matches(&ServiceEvent::ChannelConnected {
            channel: "other".into()
        }));
        assert!(!filter.matches(&ServiceEvent::ProcessStarting { key: "gpii".into() }));
    }

    #[test]
    fn test_control_codes() {
        assert_eq!(ServiceControl::from_code(1), ServiceControl::Stop);
        assert_eq!(ServiceControl::from_code(0xF), ServiceControl::PreShutdown);
        assert_eq!(ServiceControl::from_code(0x40), ServiceControl::Other(0x40));
        assert!(ServiceControl::Shutdown.is_stop());
        assert!(!ServiceControl::Interrogate.is_stop());
    }
}
