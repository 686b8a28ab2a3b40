//! Status channel events for observers.
//!
//! Emits [`ChannelEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! loggers, notification surfaces, or tests can follow connection and
//! interrupt lifecycle without reaching into the channel's state.

use conveyor_types::ConnectionState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    ConnectionChanged {
        project: String,
        state: ConnectionState,
        attempt: u32,
    },
    SnapshotApplied {
        project: String,
        revision: u64,
        artifacts: usize,
    },
    /// An authoritative snapshot was rejected; the previous one stays visible.
    SnapshotRejected {
        project: String,
        error: String,
    },
    InterruptOpened {
        interrupt_id: String,
        artifact_id: String,
    },
    InterruptClosed {
        interrupt_id: String,
        artifact_id: String,
        /// Answers were submitted from this session before it closed.
        locally_resolved: bool,
    },
    OverlayApplied {
        interrupt_id: String,
        artifact_id: String,
    },
    OverlayRolledBack {
        interrupt_id: String,
        error: String,
    },
    StaleInterruptDiscarded {
        interrupt_id: String,
    },
    ProductionRequested {
        artifact_id: String,
    },
    ChannelClosed {
        project: String,
        session: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<ChannelEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped when nobody listens.
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(ChannelEvent::StaleInterruptDiscarded {
            interrupt_id: "int-1".into(),
        });

        let expected = ChannelEvent::StaleInterruptDiscarded {
            interrupt_id: "int-1".into(),
        };
        assert_eq!(rx1.recv().await.unwrap(), expected);
        assert_eq!(rx2.recv().await.unwrap(), expected);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::default();
        emitter.emit(ChannelEvent::ProductionRequested {
            artifact_id: "doc".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = ChannelEvent::ConnectionChanged {
            project: "p1".into(),
            state: ConnectionState::Disconnected,
            attempt: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connection_changed");
        assert_eq!(json["state"], "disconnected");
        let back: ChannelEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
