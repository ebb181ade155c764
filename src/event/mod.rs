//! Event system for async message handling.
//!
//! The event system gives async code a channel view of everything the device
//! sends, alongside the synchronous text callback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::listener::TouchPad;

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection established.
    Connected,
    /// Connection closed.
    Disconnected,
    /// One notification worth of device output.
    Text { channel: Uuid, text: String },
    /// A complete line of device output, without its separator.
    Line(String),
    /// A touch pad was tapped.
    Touch(TouchPad),
}

/// Discriminant of an [`Event`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Text,
    Line,
    Touch,
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Text { .. } => EventKind::Text,
            Self::Line(_) => EventKind::Line,
            Self::Touch(_) => EventKind::Touch,
        }
    }

    /// Returns the text carried by the event, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } | Self::Line(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once the dispatcher is gone. Events missed by a slow
    /// subscriber are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("subscriber lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific event types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter for text containing this substring.
    pub contains: Option<String>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            contains: None,
        }
    }

    /// Creates a filter for a complete line containing `needle`.
    #[must_use]
    pub fn line_containing(needle: impl Into<String>) -> Self {
        Self {
            kinds: Some(vec![EventKind::Line]),
            contains: Some(needle.into()),
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(ref needle) = self.contains {
            match event.text() {
                Some(text) if text.contains(needle.as_str()) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to all events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Waits on an existing subscription for an event matching the filter.
    pub async fn wait_on(
        subscription: &mut Subscription,
        filter: &EventFilter,
        timeout: Duration,
    ) -> Option<Event> {
        tokio::select! {
            biased;
            result = async {
                while let Some(event) = subscription.recv().await {
                    if filter.matches(&event) {
                        return Some(event);
                    }
                }
                None
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Only events dispatched after this call are considered.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let mut subscription = self.subscribe();
        Self::wait_on(&mut subscription, &filter, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Connected);

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();

        assert_eq!(event, Some(Event::Connected));
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::kinds(vec![EventKind::Line, EventKind::Touch]);

        assert!(filter.matches(&Event::Line("ok".into())));
        assert!(filter.matches(&Event::Touch(TouchPad::A)));
        assert!(!filter.matches(&Event::Connected));
    }

    #[test]
    fn test_line_filter() {
        let filter = EventFilter::line_containing("OK");

        assert!(filter.matches(&Event::Line("OK done".into())));
        assert!(!filter.matches(&Event::Line("error".into())));
        assert!(!filter.matches(&Event::Text {
            channel: Uuid::nil(),
            text: "OK".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout() {
        let dispatcher = EventDispatcher::new(16);
        let waited = dispatcher
            .wait_for(EventFilter::kinds(vec![EventKind::Touch]), Duration::from_secs(1))
            .await;
        assert_eq!(waited, None);
    }

    #[tokio::test]
    async fn test_wait_on_skips_unmatched() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Line("noise".into()));
        dispatcher.dispatch(Event::Line("ready".into()));

        let event = EventDispatcher::wait_on(
            &mut sub,
            &EventFilter::line_containing("ready"),
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(event, Some(Event::Line("ready".into())));
    }
}
