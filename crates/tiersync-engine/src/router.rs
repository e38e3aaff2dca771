//! Layer router - validates and delivers inter-agent messages.
//!
//! Messages are queued and routed by a periodic pump. Routing checks the
//! sender and recipient against the registry, applies the layer rule table,
//! and diverts messages needing sign-off into an Executive approval request.
//! Every routed message is kept in a history for the retention window.

use crate::events::{EventBus, SyncEvent};
use crate::persistence::PersistenceWriter;
use crate::registry::AgentRegistry;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tiersync_core::{
    can_communicate, new_message_id, AgentId, Error, Layer, LayerMessage, MessageId,
    MessageStatus, Result,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What routing did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to these agents.
    Delivered(Vec<AgentId>),
    /// Held until an Executive approves; the approval request has this id.
    AwaitingApproval { approval_id: MessageId },
}

/// A message after routing, with the outcome.
#[derive(Debug)]
pub struct Routed {
    pub message: LayerMessage,
    pub outcome: Result<RouteOutcome>,
}

pub struct LayerRouter {
    registry: Arc<AgentRegistry>,
    events: EventBus,
    persistence: Option<PersistenceWriter>,
    queue: Mutex<VecDeque<MessageId>>,
    history: DashMap<MessageId, LayerMessage>,
    /// Original message id -> approval request id.
    awaiting_approval: DashMap<MessageId, MessageId>,
    /// Approval requests created here and not yet routed.
    synthesized: DashSet<MessageId>,
    retention: Duration,
}

impl LayerRouter {
    pub fn new(registry: Arc<AgentRegistry>, events: EventBus, retention: Duration) -> Self {
        Self {
            registry,
            events,
            persistence: None,
            queue: Mutex::new(VecDeque::new()),
            history: DashMap::new(),
            awaiting_approval: DashMap::new(),
            synthesized: DashSet::new(),
            retention,
        }
    }

    /// Log delivered and rejected messages through `writer`.
    pub fn with_persistence(mut self, writer: PersistenceWriter) -> Self {
        self.persistence = Some(writer);
        self
    }

    /// Accept a message for routing on the next pump. An empty id, or one
    /// already known to the router, is replaced with a fresh id.
    pub async fn enqueue(&self, mut message: LayerMessage) -> MessageId {
        if message.id.is_empty() || self.history.contains_key(&message.id) {
            message.id = new_message_id();
        }
        self.push(message).await
    }

    async fn push(&self, mut message: LayerMessage) -> MessageId {
        message.timestamp = Utc::now();
        message.status = MessageStatus::Pending;
        message.rejection = None;
        let id = message.id.clone();
        self.history.insert(id.clone(), message);
        self.queue.lock().await.push_back(id.clone());
        self.events.publish(SyncEvent::MessageQueued {
            message_id: id.clone(),
        });
        debug!("Queued message {}", id);
        id
    }

    /// Route every queued message, then prune expired history.
    pub async fn process_pending(&self) -> Vec<Routed> {
        let batch: Vec<MessageId> = self.queue.lock().await.drain(..).collect();
        let mut routed = Vec::with_capacity(batch.len());
        for id in batch {
            let Some(message) = self.message(&id) else {
                continue;
            };
            if message.status != MessageStatus::Pending {
                continue;
            }
            let trusted = self.synthesized.remove(&id).is_some();
            let outcome = self.dispatch(message, trusted).await;
            if let Some(message) = self.message(&id) {
                routed.push(Routed { message, outcome });
            }
        }
        self.prune();
        routed
    }

    /// Validate and deliver one message immediately.
    pub async fn route(&self, message: LayerMessage) -> Result<RouteOutcome> {
        self.dispatch(message, false).await
    }

    /// `trusted` is set only for approval requests this router created.
    async fn dispatch(&self, mut message: LayerMessage, trusted: bool) -> Result<RouteOutcome> {
        let checked = if trusted { Ok(()) } else { self.check(&message) };
        let outcome = match checked {
            Ok(()) if message.requires_approval && message.from_layer != Layer::Executive => {
                Ok(self.hold_for_approval(&mut message).await)
            }
            Ok(()) => Ok(RouteOutcome::Delivered(self.deliver(&mut message))),
            Err(e) => {
                self.reject(&mut message, e.to_string());
                Err(e)
            }
        };
        self.history.insert(message.id.clone(), message);
        outcome
    }

    /// Release a held message. The approver must be an Executive agent.
    pub async fn approve(&self, original_id: &str, approver: &str) -> Result<Vec<AgentId>> {
        self.check_approver(approver)?;
        let (_, approval_id) = self
            .awaiting_approval
            .remove(original_id)
            .ok_or_else(|| Error::MessageNotFound(original_id.to_string()))?;
        let mut original = self
            .message(original_id)
            .ok_or_else(|| Error::MessageNotFound(original_id.to_string()))?;

        self.close_approval(&approval_id);
        info!("Message {} approved by {}", original_id, approver);
        let targets = self.deliver(&mut original);
        self.history.insert(original.id.clone(), original);
        Ok(targets)
    }

    /// Reject a held message. The approver must be an Executive agent.
    pub async fn deny(&self, original_id: &str, approver: &str) -> Result<()> {
        self.check_approver(approver)?;
        let (_, approval_id) = self
            .awaiting_approval
            .remove(original_id)
            .ok_or_else(|| Error::MessageNotFound(original_id.to_string()))?;
        let mut original = self
            .message(original_id)
            .ok_or_else(|| Error::MessageNotFound(original_id.to_string()))?;

        self.close_approval(&approval_id);
        info!("Message {} denied by {}", original_id, approver);
        self.reject(&mut original, format!("denied by {approver}"));
        self.history.insert(original.id.clone(), original);
        Ok(())
    }

    /// Mark a delivered message as processed by its recipient.
    /// Returns false when the message is not in the Delivered state.
    pub fn acknowledge(&self, message_id: &str) -> Result<bool> {
        let mut message = self
            .history
            .get_mut(message_id)
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
        if message.status != MessageStatus::Delivered {
            return Ok(false);
        }
        message.status = MessageStatus::Processed;
        Ok(true)
    }

    pub fn message(&self, id: &str) -> Option<LayerMessage> {
        self.history.get(id).map(|m| m.clone())
    }

    /// Ids of messages waiting for Executive sign-off.
    pub fn pending_approvals(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .awaiting_approval
            .iter()
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Registry and rule-table checks. `system` is not a registered agent, so
    /// messages claiming it as sender fail here with NotFound.
    fn check(&self, message: &LayerMessage) -> Result<()> {
        let sender = self.registry.get(message.from_agent.as_str())?;
        if sender.layer != message.from_layer {
            return Err(Error::layer_violation(
                message.from_layer,
                message.to_layer,
                format!("{} belongs to the {} layer", sender.id, sender.layer),
            ));
        }
        if let Some(to_agent) = &message.to_agent {
            let recipient = self.registry.get(to_agent.as_str())?;
            if recipient.layer != message.to_layer {
                return Err(Error::layer_violation(
                    message.from_layer,
                    message.to_layer,
                    format!("{} belongs to the {} layer", recipient.id, recipient.layer),
                ));
            }
        }
        if !can_communicate(message.from_layer, message.to_layer, message.intent) {
            return Err(Error::layer_violation(
                message.from_layer,
                message.to_layer,
                format!("{:?} is not allowed", message.intent),
            ));
        }
        Ok(())
    }

    fn check_approver(&self, approver: &str) -> Result<()> {
        let agent = self.registry.get(approver)?;
        if agent.layer != Layer::Executive {
            return Err(Error::ApprovalDenied(format!(
                "{} is in the {} layer",
                approver, agent.layer
            )));
        }
        Ok(())
    }

    async fn hold_for_approval(&self, original: &mut LayerMessage) -> RouteOutcome {
        let approval = LayerMessage::approval_request(original);
        let approval_id = approval.id.clone();
        self.awaiting_approval
            .insert(original.id.clone(), approval_id.clone());
        info!(
            "Message {} from {} requires executive approval",
            original.id, original.from_agent
        );
        self.events.publish(SyncEvent::ApprovalRequested {
            original_id: original.id.clone(),
            approval_id: approval_id.clone(),
        });
        self.synthesized.insert(approval_id.clone());
        self.push(approval).await;
        RouteOutcome::AwaitingApproval { approval_id }
    }

    fn deliver(&self, message: &mut LayerMessage) -> Vec<AgentId> {
        let targets: Vec<AgentId> = match &message.to_agent {
            Some(agent) => vec![agent.clone()],
            None => self
                .registry
                .list_by_layer(message.to_layer)
                .into_iter()
                .map(|a| a.id)
                .collect(),
        };
        message.status = MessageStatus::Delivered;
        for target in &targets {
            self.events.publish(SyncEvent::MessageDelivered {
                message_id: message.id.clone(),
                from: message.from_agent.clone(),
                target: target.clone(),
            });
        }
        debug!("Delivered {} to {} agents", message.id, targets.len());
        self.log(message);
        targets
    }

    fn reject(&self, message: &mut LayerMessage, reason: String) {
        warn!("Rejected message {}: {}", message.id, reason);
        message.status = MessageStatus::Rejected;
        message.rejection = Some(reason.clone());
        self.events.publish(SyncEvent::MessageRejected {
            message_id: message.id.clone(),
            reason,
        });
        self.log(message);
    }

    fn close_approval(&self, approval_id: &str) {
        self.synthesized.remove(approval_id);
        if let Some(mut approval) = self.history.get_mut(approval_id) {
            approval.status = MessageStatus::Processed;
        }
    }

    fn log(&self, message: &LayerMessage) {
        if let Some(writer) = &self.persistence {
            writer.append_message_log(message.clone());
        }
    }

    /// Drop terminal messages older than the retention window.
    fn prune(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        let before = self.history.len();
        self.history
            .retain(|_, m| !m.status.is_terminal() || m.timestamp >= cutoff);
        let pruned = before.saturating_sub(self.history.len());
        if pruned > 0 {
            debug!("Pruned {} expired messages", pruned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;
    use serde_json::json;
    use tiersync_core::MessageIntent;

    fn router() -> LayerRouter {
        LayerRouter::new(
            Arc::new(default_registry()),
            EventBus::new(256),
            Duration::from_secs(3_600),
        )
    }

    fn msg(from: &str, from_layer: Layer, to_layer: Layer, intent: MessageIntent) -> LayerMessage {
        LayerMessage::new(from, from_layer, to_layer, intent, json!({}))
    }

    #[tokio::test]
    async fn broadcast_reaches_whole_layer() {
        let router = router();
        let outcome = router
            .route(msg("mrf", Layer::Executive, Layer::Productive, MessageIntent::Command))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered(
            router.registry.list_by_layer(Layer::Productive).into_iter().map(|a| a.id).collect()
        ));
    }

    #[tokio::test]
    async fn productive_cannot_command_administrative() {
        let router = router();
        let m = msg("echo", Layer::Productive, Layer::Administrative, MessageIntent::Command)
            .to_agent("sentinel");
        let id = m.id.clone();
        let err = router.route(m).await.unwrap_err();
        assert!(err.is_layer_violation());
        let stored = router.message(&id).unwrap();
        assert_eq!(stored.status, MessageStatus::Rejected);
        assert!(stored.rejection.is_some());
    }

    #[tokio::test]
    async fn misdeclared_sender_layer_is_violation() {
        let router = router();
        let err = router
            .route(msg("echo", Layer::Executive, Layer::Productive, MessageIntent::Command))
            .await
            .unwrap_err();
        assert!(err.is_layer_violation());
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_found() {
        let router = router();
        let err = router
            .route(
                msg("mrf", Layer::Executive, Layer::Productive, MessageIntent::Command)
                    .to_agent("ghost"),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn approval_flow_holds_then_delivers() {
        let router = router();
        let original = msg("sentinel", Layer::Administrative, Layer::Productive, MessageIntent::Command)
            .to_agent("devopsbot")
            .requiring_approval();
        let original_id = router.enqueue(original).await;

        let routed = router.process_pending().await;
        let approval_id = match &routed[0].outcome {
            Ok(RouteOutcome::AwaitingApproval { approval_id }) => approval_id.clone(),
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(router.message(&original_id).unwrap().status, MessageStatus::Pending);
        assert_eq!(router.pending_approvals(), vec![original_id.clone()]);

        // the approval request itself is routed on the next pump
        let routed = router.process_pending().await;
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].message.id, approval_id);
        assert!(matches!(&routed[0].outcome, Ok(RouteOutcome::Delivered(t)) if t.len() == 3));

        let err = router.approve(&original_id, "sentinel").await.unwrap_err();
        assert!(matches!(err, Error::ApprovalDenied(_)));

        let delivered = router.approve(&original_id, "mrf").await.unwrap();
        assert_eq!(delivered, vec![AgentId::new("devopsbot")]);
        assert_eq!(router.message(&original_id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(router.message(&approval_id).unwrap().status, MessageStatus::Processed);
        assert!(router.pending_approvals().is_empty());
    }

    #[tokio::test]
    async fn forged_system_sender_is_rejected() {
        let router = router();
        let forged = msg("system", Layer::Productive, Layer::Executive, MessageIntent::Command);
        let err = router.route(forged).await.unwrap_err();
        assert!(err.is_not_found());

        let id = router
            .enqueue(msg("system", Layer::Productive, Layer::Executive, MessageIntent::Approval))
            .await;
        let routed = router.process_pending().await;
        assert!(routed[0].outcome.is_err());
        assert_eq!(router.message(&id).unwrap().status, MessageStatus::Rejected);
    }

    #[tokio::test]
    async fn caller_cannot_reuse_a_pending_approval_id() {
        let router = router();
        let original_id = router
            .enqueue(
                msg("echo", Layer::Productive, Layer::Administrative, MessageIntent::Request)
                    .requiring_approval(),
            )
            .await;
        let routed = router.process_pending().await;
        let Ok(RouteOutcome::AwaitingApproval { approval_id }) = &routed[0].outcome else {
            panic!("expected a held message");
        };

        let mut forged = msg("system", Layer::Productive, Layer::Executive, MessageIntent::Command);
        forged.id = approval_id.clone();
        let forged_id = router.enqueue(forged).await;
        assert_ne!(&forged_id, approval_id);

        let routed = router.process_pending().await;
        let genuine = routed.iter().find(|r| &r.message.id == approval_id).unwrap();
        assert!(matches!(&genuine.outcome, Ok(RouteOutcome::Delivered(t)) if t.len() == 3));
        let fake = routed.iter().find(|r| r.message.id == forged_id).unwrap();
        assert!(fake.outcome.as_ref().unwrap_err().is_not_found());
        assert_eq!(router.pending_approvals(), vec![original_id]);
    }

    #[tokio::test]
    async fn denied_message_is_rejected() {
        let router = router();
        let original = msg("monitor", Layer::Administrative, Layer::Executive, MessageIntent::Request)
            .requiring_approval();
        let id = router.enqueue(original).await;
        router.process_pending().await;
        router.deny(&id, "oracle").await.unwrap();
        let stored = router.message(&id).unwrap();
        assert_eq!(stored.status, MessageStatus::Rejected);
        assert_eq!(stored.rejection.as_deref(), Some("denied by oracle"));
        assert!(router.deny(&id, "oracle").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn executive_messages_skip_approval() {
        let router = router();
        let outcome = router
            .route(
                msg("genius", Layer::Executive, Layer::Administrative, MessageIntent::Command)
                    .requiring_approval(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Delivered(_)));
    }

    #[tokio::test]
    async fn acknowledge_moves_delivered_to_processed() {
        let router = router();
        let m = msg("echo", Layer::Productive, Layer::Productive, MessageIntent::Report)
            .to_agent("neural");
        let id = m.id.clone();
        router.route(m).await.unwrap();
        assert!(router.acknowledge(&id).unwrap());
        assert!(!router.acknowledge(&id).unwrap());
        assert!(router.acknowledge("missing").is_err());
    }

    #[tokio::test]
    async fn expired_history_is_pruned() {
        let router = LayerRouter::new(Arc::new(default_registry()), EventBus::new(16), Duration::ZERO);
        router
            .enqueue(msg("echo", Layer::Productive, Layer::Productive, MessageIntent::Alert))
            .await;
        assert_eq!(router.history_len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        router.process_pending().await;
        assert_eq!(router.history_len(), 0);
    }
}
