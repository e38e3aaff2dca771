//! Inter-layer messages

use crate::types::{AgentId, Layer, MessageId, Priority, SYSTEM_AGENT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageIntent {
    Command,
    Report,
    Request,
    Alert,
    Approval,
}

impl MessageIntent {
    pub const ALL: [MessageIntent; 5] = [
        MessageIntent::Command,
        MessageIntent::Report,
        MessageIntent::Request,
        MessageIntent::Alert,
        MessageIntent::Approval,
    ];
}

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Delivered,
    Processed,
    Rejected,
}

impl MessageStatus {
    /// A message is terminal once it leaves Pending.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

/// A routed communication between agents. `to_agent = None` broadcasts to `to_layer`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerMessage {
    pub id: MessageId,
    pub from_agent: AgentId,
    pub from_layer: Layer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<AgentId>,
    pub to_layer: Layer,
    pub intent: MessageIntent,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

impl LayerMessage {
    pub fn new(
        from_agent: impl Into<AgentId>,
        from_layer: Layer,
        to_layer: Layer,
        intent: MessageIntent,
        payload: Value,
    ) -> Self {
        Self {
            id: new_message_id(),
            from_agent: from_agent.into(),
            from_layer,
            to_agent: None,
            to_layer,
            intent,
            priority: Priority::default(),
            payload,
            requires_approval: false,
            status: MessageStatus::Pending,
            timestamp: Utc::now(),
            rejection: None,
        }
    }

    pub fn to_agent(mut self, agent: impl Into<AgentId>) -> Self {
        self.to_agent = Some(agent.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }

    /// Sender is the reserved `system` id. Only the router may originate these.
    pub fn is_system(&self) -> bool {
        self.from_agent.is_system()
    }

    /// Derived Approval message addressed to the Executive layer, embedding `original`.
    pub fn approval_request(original: &LayerMessage) -> Self {
        let embedded = serde_json::to_value(original).unwrap_or(Value::Null);
        Self {
            id: format!("approval-{}", original.id),
            from_agent: AgentId::new(SYSTEM_AGENT),
            from_layer: original.from_layer,
            to_agent: None,
            to_layer: Layer::Executive,
            intent: MessageIntent::Approval,
            priority: original.priority,
            payload: serde_json::json!({
                "original_message": embedded,
                "reason": "requires executive approval",
            }),
            requires_approval: false,
            status: MessageStatus::Pending,
            timestamp: Utc::now(),
            rejection: None,
        }
    }

    /// Id of the message embedded in an approval request, if this is one.
    pub fn approval_target(&self) -> Option<&str> {
        if self.intent != MessageIntent::Approval || !self.is_system() {
            return None;
        }
        self.payload
            .get("original_message")
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
    }
}

pub fn new_message_id() -> MessageId {
    format!("msg-{}", uuid::Uuid::new_v4())
}
