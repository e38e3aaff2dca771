//! Event bus - fire-and-forget notifications for dashboards and audit tooling
//!
//! Publishing never blocks: events go into a tokio broadcast channel and are
//! dropped for receivers that fall too far behind.

use serde::Serialize;
use tiersync_core::{AgentId, AgentStatus, MessageId, RequestId, SyncResult, SyncType};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Everything observable from outside the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    MessageQueued {
        message_id: MessageId,
    },
    MessageDelivered {
        message_id: MessageId,
        from: AgentId,
        target: AgentId,
    },
    MessageRejected {
        message_id: MessageId,
        reason: String,
    },
    ApprovalRequested {
        original_id: MessageId,
        approval_id: MessageId,
    },
    SyncQueued {
        request_id: RequestId,
    },
    SyncStarted {
        request_id: RequestId,
        source: AgentId,
        sync_type: SyncType,
    },
    SyncCompleted(SyncResult),
    StateUpdated {
        agent_id: AgentId,
        version: u64,
        checksum: String,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::MessageQueued { .. } => "message_queued",
            SyncEvent::MessageDelivered { .. } => "message_delivered",
            SyncEvent::MessageRejected { .. } => "message_rejected",
            SyncEvent::ApprovalRequested { .. } => "approval_requested",
            SyncEvent::SyncQueued { .. } => "sync_queued",
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncCompleted(_) => "sync_completed",
            SyncEvent::StateUpdated { .. } => "state_updated",
            SyncEvent::AgentStatusChanged { .. } => "agent_status_changed",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("event bus closed")]
    Closed,
    #[error("receiver lagged by {0} events")]
    Lagged(u64),
    #[error("no event available")]
    Empty,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<SyncEvent, RecvError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => RecvError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                RecvError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<SyncEvent, RecvError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => RecvError::Empty,
            broadcast::error::TryRecvError::Closed => RecvError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                RecvError::Lagged(n)
            }
        })
    }

    /// Everything currently buffered, skipping over lag gaps.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(4);
        bus.publish(SyncEvent::MessageQueued {
            message_id: "m1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SyncEvent::MessageQueued {
            message_id: "m1".into(),
        });
        bus.publish(SyncEvent::SyncQueued {
            request_id: "s1".into(),
        });
        let kinds: Vec<_> = rx.drain().iter().map(SyncEvent::kind).collect();
        assert_eq!(kinds, vec!["message_queued", "sync_queued"]);
        assert_eq!(rx.try_recv().unwrap_err(), RecvError::Empty);
    }

    #[test]
    fn slow_receiver_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(SyncEvent::MessageQueued {
                message_id: format!("m{i}"),
            });
        }
        assert!(matches!(rx.try_recv(), Err(RecvError::Lagged(_))));
        assert_eq!(rx.drain().len(), 2);
    }
}
