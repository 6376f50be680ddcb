//! Lifecycle events published by the handler and revalidator

use crate::cache::EntryStatus;
use crate::route::FallbackMode;
use serde::Serialize;
use tokio::sync::broadcast;

/// Something that happened while serving or regenerating a page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum IsrEvent {
    CacheHit {
        path: String,
        status: EntryStatus,
    },
    CacheMiss {
        path: String,
    },
    RevalidateStart {
        path: String,
    },
    RevalidateSuccess {
        path: String,
        duration_ms: u64,
        /// The new render hashed the same as the cached one
        unchanged: bool,
    },
    RevalidateError {
        path: String,
        error: String,
    },
    Fallback {
        path: String,
        mode: FallbackMode,
    },
    Error {
        path: String,
        message: String,
    },
}

impl IsrEvent {
    /// Wire name, e.g. `cache:hit`
    pub fn name(&self) -> &'static str {
        match self {
            IsrEvent::CacheHit { .. } => "cache:hit",
            IsrEvent::CacheMiss { .. } => "cache:miss",
            IsrEvent::RevalidateStart { .. } => "revalidate:start",
            IsrEvent::RevalidateSuccess { .. } => "revalidate:success",
            IsrEvent::RevalidateError { .. } => "revalidate:error",
            IsrEvent::Fallback { .. } => "fallback",
            IsrEvent::Error { .. } => "error",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            IsrEvent::CacheHit { path, .. }
            | IsrEvent::CacheMiss { path }
            | IsrEvent::RevalidateStart { path }
            | IsrEvent::RevalidateSuccess { path, .. }
            | IsrEvent::RevalidateError { path, .. }
            | IsrEvent::Fallback { path, .. }
            | IsrEvent::Error { path, .. } => path,
        }
    }
}

/// Fan-out of [`IsrEvent`]s to any number of subscribers.
///
/// Publishing never blocks; slow subscribers miss events instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IsrEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IsrEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: IsrEvent) {
        tracing::trace!(event = event.name(), path = event.path(), "isr event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(IsrEvent::CacheMiss {
            path: "/a".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "cache:miss");
        assert_eq!(event.path(), "/a");
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::default().emit(IsrEvent::RevalidateStart {
            path: "/".to_string(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = IsrEvent::RevalidateSuccess {
            path: "/p".to_string(),
            duration_ms: 12,
            unchanged: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "revalidateSuccess");
        assert_eq!(json["duration_ms"], 12);
    }
}
