//! Typed publish/subscribe hub.
//!
//! Each event type has its own tokio broadcast channel, so every subscriber of
//! a type sees every event of that type. Publishing never blocks: a subscriber
//! that falls more than `capacity` events behind loses the oldest ones.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use super::types::{Event, EventType, LogEvent, LogLevel};
use crate::config::EventBusConfig;
use crate::domain::Stage;

/// Broadcaster shared by the pipeline engine, the transfer queue and observers.
#[derive(Clone)]
pub struct EventBus {
    senders: Arc<[broadcast::Sender<Event>; 4]>,
}

impl EventBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_config(&EventBusConfig::default())
    }

    pub fn with_config(config: &EventBusConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    /// Create a new bus with the given per-type buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let senders = EventType::ALL.map(|_| broadcast::channel(capacity).0);
        Self {
            senders: Arc::new(senders),
        }
    }

    /// Subscribe to every future event of one type.
    pub fn subscribe(&self, event_type: EventType) -> EventStream {
        EventStream {
            event_type,
            receiver: self.senders[event_type.slot()].subscribe(),
            dropped: 0,
        }
    }

    /// Publish an event.
    ///
    /// Returns the number of subscribers that will receive it, 0 when nobody
    /// is listening.
    pub fn publish(&self, event: impl Into<Event>) -> usize {
        let event = event.into();
        let sender = &self.senders[event.event_type().slot()];
        // send() only fails when there are no receivers
        sender.send(event).unwrap_or(0)
    }

    /// Publish a log event without job context.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.publish(LogEvent::new(level, message));
    }

    /// Publish a log event tied to a job stage.
    pub fn job_log(
        &self,
        level: LogLevel,
        stage: Stage,
        job_name: &str,
        message: impl Into<String>,
    ) {
        self.publish(LogEvent::new(level, message).for_job(stage, job_name));
    }

    /// Number of active subscribers for an event type.
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.senders[event_type.slot()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Independent receive stream of one subscription.
pub struct EventStream {
    event_type: EventType,
    receiver: broadcast::Receiver<Event>,
    dropped: u64,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Events lost because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        if self.event_type == EventType::Progress {
            debug!(skipped = n, "Progress subscriber lagging");
        } else {
            warn!(
                event_type = %self.event_type,
                skipped = n,
                "Event subscriber lagging, events dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ProgressEvent, StateChangeEvent};
    use crate::domain::StageStatus;

    fn state_change(job: &str) -> StateChangeEvent {
        StateChangeEvent {
            job_name: job.to_string(),
            stage: Stage::Tar,
            new_status: StageStatus::Completed,
            job_id: None,
            error_message: None,
            upload_progress: None,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(state_change("a")), 0);
    }

    #[test]
    fn test_fan_out_to_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe(EventType::StateChange);
        let mut second = bus.subscribe(EventType::StateChange);

        assert_eq!(bus.publish(state_change("a")), 2);

        assert!(matches!(first.try_recv(), Some(Event::StateChange(e)) if e.job_name == "a"));
        assert!(matches!(second.try_recv(), Some(Event::StateChange(e)) if e.job_name == "a"));
    }

    #[test]
    fn test_subscription_is_per_type() {
        let bus = EventBus::new();
        let mut progress = bus.subscribe(EventType::Progress);
        let mut logs = bus.subscribe(EventType::Log);

        bus.publish(ProgressEvent::stage(Stage::Tar, "a", 0.5));

        assert!(logs.try_recv().is_none());
        assert!(matches!(progress.try_recv(), Some(Event::Progress(_))));
    }

    #[test]
    fn test_slow_subscriber_drops_oldest_without_blocking() {
        let bus = EventBus::with_capacity(4);
        let mut slow = bus.subscribe(EventType::Progress);

        for i in 0..10 {
            bus.publish(ProgressEvent::stage(Stage::Upload, "a", i as f64 / 10.0));
        }

        let received = slow.drain();
        assert_eq!(received.len(), 4);
        assert_eq!(slow.dropped(), 6);
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_bus_dropped() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(EventType::Log);
        bus.log(LogLevel::Info, "hello");
        drop(bus);

        assert!(matches!(stream.recv().await, Some(Event::Log(e)) if e.message == "hello"));
        assert!(stream.recv().await.is_none());
    }
}
