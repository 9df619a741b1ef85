//! Structured log and lifecycle events.
//!
//! The pool reports its lifecycle through typed events on a broadcast
//! channel: `created`, `available`, `close`, `error`, `message`, plus raw
//! wire traffic when the `debug` option is set. Events are mirrored to
//! `tracing` when that feature is enabled. Dropping every receiver simply
//! discards events; emission never blocks the pool.

use tokio::sync::broadcast;

/// Category of a structured log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEventKind {
    /// A pool resource was created.
    Created,
    /// A resource finished a send and re-entered the available set.
    Available,
    /// A resource or the pool itself closed.
    Close,
    /// A resource reported a terminal error.
    Error,
    /// A message was handed to a resource for sending.
    Message,
    /// Raw client/server traffic (only with the `debug` option).
    Wire,
}

impl LogEventKind {
    /// Returns the event type name used in the log schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEventKind::Created => "created",
            LogEventKind::Available => "available",
            LogEventKind::Close => "close",
            LogEventKind::Error => "error",
            LogEventKind::Message => "message",
            LogEventKind::Wire => "wire",
        }
    }
}

/// One structured log event: `{type, message}`.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Event category.
    pub kind: LogEventKind,
    /// Human-readable detail.
    pub message: String,
}

impl LogEvent {
    /// Creates a new log event.
    pub fn new(kind: LogEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Events observable on the pool's broadcast channel.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A structured log event.
    Log(LogEvent),
    /// The pool transitioned into the idle state (edge-triggered): a send
    /// issued now would dispatch without waiting.
    Idle,
}

/// Fan-out handle for pool events.
///
/// Cheap to clone; handed to the dispatcher and to each connection for
/// wire-level logging.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PoolEvent>,
}

/// Capacity of the event channel; slow receivers observe `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

impl EventSink {
    /// Creates a sink with its own broadcast channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes a new receiver to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Emits a structured log event.
    pub fn log(&self, kind: LogEventKind, message: impl Into<String>) {
        let message = message.into();

        #[cfg(feature = "tracing")]
        match kind {
            LogEventKind::Error => tracing::warn!(kind = kind.as_str(), "{}", message),
            LogEventKind::Wire => tracing::trace!(kind = kind.as_str(), "{}", message),
            _ => tracing::debug!(kind = kind.as_str(), "{}", message),
        }

        let _ = self.tx.send(PoolEvent::Log(LogEvent::new(kind, message)));
    }

    /// Emits the edge-triggered idle notification.
    pub fn idle(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("pool idle");

        let _ = self.tx.send(PoolEvent::Idle);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();

        sink.log(LogEventKind::Created, "connection 1 created");
        sink.idle();

        match rx.recv().await.unwrap() {
            PoolEvent::Log(event) => {
                assert_eq!(event.kind, LogEventKind::Created);
                assert!(event.message.contains("connection 1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), PoolEvent::Idle));
    }

    #[test]
    fn emission_without_subscribers_is_silent() {
        let sink = EventSink::new();
        sink.log(LogEventKind::Close, "closing");
        sink.idle();
    }

    #[test]
    fn kind_names_match_schema() {
        assert_eq!(LogEventKind::Created.as_str(), "created");
        assert_eq!(LogEventKind::Available.as_str(), "available");
        assert_eq!(LogEventKind::Wire.as_str(), "wire");
    }
}
