//! # Subscriptions
//!
//! Every subscriber gets its own broadcast receiver and applies its filter
//! on receive. A subscriber that falls more than the bus capacity behind
//! skips the oldest events and carries on; a lagged listener is logged, not
//! closed.

use crate::events::{EventFilter, ServiceEvent};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("event bus closed")]
    Closed,
}

/// Filtered view of the bus. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<ServiceEvent>,
    filter: EventFilter,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<ServiceEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, topics = ?self.filter.topics, "Subscriber lagged behind the bus");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Result<Option<ServiceEvent>, SubscriptionError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Ok(Some(event)),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    #[must_use]
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Turn into a [`Stream`] for use with `StreamExt` combinators.
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.receiver),
            filter: self.filter,
        }
    }
}

/// A [`Subscription`] as a stream.
pub struct EventStream {
    inner: BroadcastStream<ServiceEvent>,
    filter: EventFilter,
}

impl Stream for EventStream {
    type Item = ServiceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) if self.filter.matches(&event) => {
                    return Poll::Ready(Some(event))
                }
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, topics = ?self.filter.topics, "Stream lagged behind the bus");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTopic;
    use crate::publisher::InMemoryEventBus;
    use shared_types::entities::Pid;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    const LIMIT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_recv_skips_other_topics() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(EventFilter::topics(vec![EventTopic::Process]));

        bus.emit(ServiceEvent::ChannelConnected {
            channel: "gpii".into(),
        });
        bus.emit(ServiceEvent::ProcessStarted {
            key: "gpii".into(),
            pid: Pid(12),
        });

        let received = timeout(LIMIT, sub.recv()).await.expect("timeout");
        assert!(matches!(received, Some(ServiceEvent::ProcessStarted { .. })));
    }

    #[tokio::test]
    async fn test_subject_narrows_to_one_channel() {
        let bus = InMemoryEventBus::new();
        let mut sub =
            bus.subscribe(EventFilter::topics(vec![EventTopic::Channel]).with_subject("gpii"));

        bus.emit(ServiceEvent::ChannelClosed {
            channel: "other".into(),
        });
        bus.emit(ServiceEvent::ChannelClosed {
            channel: "gpii".into(),
        });

        let received = timeout(LIMIT, sub.recv()).await.expect("timeout");
        assert_eq!(
            received,
            Some(ServiceEvent::ChannelClosed {
                channel: "gpii".into()
            })
        );
        assert!(matches!(sub.try_recv(), Ok(None)));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = InMemoryEventBus::with_capacity(2);
        let mut sub = bus.subscribe(EventFilter::all());

        for _ in 0..5 {
            bus.emit(ServiceEvent::ServiceStarted);
        }
        bus.emit(ServiceEvent::Stopped);

        let mut last = None;
        while let Ok(Some(event)) = sub.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(ServiceEvent::Stopped));
    }

    #[tokio::test]
    async fn test_dropped_bus_ends_subscription() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(EventFilter::all());
        drop(bus);

        assert_eq!(timeout(LIMIT, sub.recv()).await.expect("timeout"), None);
        assert_eq!(sub.try_recv(), Err(SubscriptionError::Closed));
    }

    #[tokio::test]
    async fn test_stream_yields_matching_events() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus
            .subscribe(EventFilter::topics(vec![EventTopic::Shutdown]))
            .into_stream();

        bus.emit(ServiceEvent::ServiceStarted);
        bus.emit(ServiceEvent::Stopping);
        bus.emit(ServiceEvent::Stopped);

        assert_eq!(
            timeout(LIMIT, stream.next()).await.expect("timeout"),
            Some(ServiceEvent::Stopping)
        );
        assert_eq!(
            timeout(LIMIT, stream.next()).await.expect("timeout"),
            Some(ServiceEvent::Stopped)
        );
    }
}
