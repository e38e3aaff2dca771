//! Sync engine - executes one `SyncRequest` end to end.
//!
//! For each eligible target the engine takes the target's record lock, plans
//! the field updates for the request's sync type, resolves any conflicts and
//! commits the merged result through the store. Every outcome, including
//! failures, comes back as a `SyncResult`; nothing is thrown past `process`.

use crate::config::ConflictDetection;
use crate::events::{EventBus, SyncEvent};
use crate::persistence::PersistenceWriter;
use crate::registry::AgentRegistry;
use crate::resolver::ConflictResolver;
use crate::store::StateStore;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tiersync_core::{
    apply_filters, can_sync, AgentId, AgentState, Error, Provenance, Result, SkippedTarget,
    StateData, SyncConflict, SyncRequest, SyncResult, SyncStats, SyncStatus, SyncType,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Field updates and conflicts planned for one target.
#[derive(Debug, Default)]
struct Plan {
    updates: StateData,
    conflicts: Vec<SyncConflict>,
}

pub struct SyncEngine {
    registry: Arc<AgentRegistry>,
    store: Arc<StateStore>,
    resolver: Arc<ConflictResolver>,
    events: EventBus,
    persistence: Option<PersistenceWriter>,
    detection: ConflictDetection,
    default_timeout: Option<Duration>,
    /// Target version seen at the end of the last sync, per (source, target).
    watermarks: DashMap<(AgentId, AgentId), u64>,
    stats: Mutex<SyncStats>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<StateStore>,
        resolver: Arc<ConflictResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            store,
            resolver,
            events,
            persistence: None,
            detection: ConflictDetection::default(),
            default_timeout: None,
            watermarks: DashMap::new(),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn with_persistence(mut self, writer: PersistenceWriter) -> Self {
        self.persistence = Some(writer);
        self
    }

    pub fn with_conflict_detection(mut self, detection: ConflictDetection) -> Self {
        self.detection = detection;
        self
    }

    /// Deadline for requests that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Aggregate counters, including persistence write failures.
    pub async fn stats(&self) -> SyncStats {
        let mut stats = self.stats.lock().await.clone();
        stats.persistence_errors = self
            .persistence
            .as_ref()
            .map(PersistenceWriter::error_count)
            .unwrap_or(0);
        stats
    }

    /// Run `request` to completion and record the outcome.
    pub async fn process(&self, request: SyncRequest) -> SyncResult {
        let started = Instant::now();
        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout)
            .map(|timeout| started + timeout);

        let mut result = SyncResult::started(&request);
        self.events.publish(SyncEvent::SyncStarted {
            request_id: request.id.clone(),
            source: request.source_agent_id.clone(),
            sync_type: request.sync_type,
        });
        debug!(
            "Sync {} started: {:?} from {} (priority {:?})",
            request.id, request.sync_type, request.source_agent_id, request.priority
        );

        match self.execute(&request, started, deadline, &mut result).await {
            Ok(()) => {
                result.status = if result.conflicts.iter().any(|c| !c.is_resolved()) {
                    SyncStatus::Conflict
                } else {
                    SyncStatus::Success
                };
            }
            Err(e) => {
                warn!("Sync {} failed: {}", request.id, e);
                result.status = SyncStatus::Failed;
                result.error = Some(e.to_string());
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.completed_at = Utc::now();
        self.stats.lock().await.record(&result);

        info!(
            "Sync {} {:?}: {} targets, {} records, {} conflicts in {}ms",
            result.request_id,
            result.status,
            result.synced_agents.len(),
            result.records_synced,
            result.conflicts.len(),
            result.duration_ms
        );

        if let Some(writer) = &self.persistence {
            writer.append_sync_log(result.clone());
        }
        self.events.publish(SyncEvent::SyncCompleted(result.clone()));
        result
    }

    async fn execute(
        &self,
        request: &SyncRequest,
        started: Instant,
        deadline: Option<Instant>,
        result: &mut SyncResult,
    ) -> Result<()> {
        let source_id = request.source_agent_id.as_str();
        let source = self
            .store
            .get(source_id)
            .await
            .map_err(|_| Error::SourceNotFound(source_id.to_string()))?;

        for target in self.targets(request, &source, &mut result.skipped) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            let mut guard = match self.store.lock_until(target.as_str(), deadline).await {
                Ok(guard) => guard,
                Err(e @ Error::Timeout { .. }) => return Err(e),
                Err(e) => {
                    result.skipped.push(SkippedTarget {
                        agent_id: target,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut plan = self.plan(request, &source, &guard);
            let strategy = request.strategy.as_deref();
            for conflict in plan.conflicts.iter_mut() {
                if !self.resolver.resolve(conflict, strategy) {
                    warn!(
                        "Sync {}: {}",
                        request.id,
                        Error::conflict_unresolved(conflict.agent_id.as_str(), &conflict.field)
                    );
                } else if let Some(value) = &conflict.resolved_value {
                    plan.updates.insert(conflict.field.clone(), value.clone());
                }
            }

            let changed = StateStore::diff(&guard.data, &plan.updates);
            if !changed.is_empty() && guard.checksum_after(&changed) != guard.checksum {
                self.store.commit(&mut guard, &changed);
                result.records_synced += changed.len();
            }

            // an unresolved conflict must show up again on the next delta
            if plan.conflicts.iter().all(SyncConflict::is_resolved) {
                self.watermarks
                    .insert((source.agent_id.clone(), target.clone()), guard.version);
            }
            drop(guard);

            result.conflicts.extend(plan.conflicts);
            result.synced_agents.push(target);
        }
        Ok(())
    }

    /// Eligible targets for the request. Ineligible explicit targets land in `skipped`.
    fn targets(
        &self,
        request: &SyncRequest,
        source: &AgentState,
        skipped: &mut Vec<SkippedTarget>,
    ) -> Vec<AgentId> {
        let mut skip = |agent_id: &AgentId, reason: String| {
            debug!("Sync {} skipping {}: {}", request.id, agent_id, reason);
            skipped.push(SkippedTarget {
                agent_id: agent_id.clone(),
                reason,
            });
        };

        match &request.target_agent_id {
            Some(target) => {
                if *target == source.agent_id {
                    skip(target, "target is the source".into());
                    return Vec::new();
                }
                match self.registry.layer_of(target.as_str()) {
                    Err(e) => {
                        skip(target, e.to_string());
                        Vec::new()
                    }
                    Ok(layer) if !can_sync(source.layer, layer) => {
                        skip(
                            target,
                            format!("sync from {} to {} is not allowed", source.layer, layer),
                        );
                        Vec::new()
                    }
                    Ok(_) => vec![target.clone()],
                }
            }
            None => self
                .registry
                .all()
                .into_iter()
                .filter(|agent| agent.id != source.agent_id && can_sync(source.layer, agent.layer))
                .map(|agent| agent.id)
                .collect(),
        }
    }

    /// Full, Incremental and Selective leave the target's agent-owned fields alone;
    /// Delta applies exactly what the caller sent.
    fn plan(&self, request: &SyncRequest, source: &AgentState, target: &AgentState) -> Plan {
        match request.sync_type {
            SyncType::Full => Plan {
                updates: shared_fields(source.data.clone()),
                ..Plan::default()
            },
            SyncType::Incremental => Plan {
                updates: if source.version > target.version {
                    shared_fields(StateStore::diff(&target.data, &source.data))
                } else {
                    StateData::new()
                },
                ..Plan::default()
            },
            SyncType::Delta => self.plan_delta(&request.data, source, target),
            SyncType::Selective => Plan {
                updates: if request.filters.is_empty() {
                    StateData::new()
                } else {
                    shared_fields(apply_filters(&source.data, &request.filters))
                },
                ..Plan::default()
            },
        }
    }

    fn plan_delta(&self, incoming: &StateData, source: &AgentState, target: &AgentState) -> Plan {
        let mut plan = Plan::default();
        let stale = self.target_moved(source, target);
        for (field, value) in incoming {
            match target.data.get(field) {
                Some(current) if current == value => {}
                Some(current) if !current.is_null() && stale => {
                    plan.conflicts.push(SyncConflict {
                        agent_id: target.agent_id.clone(),
                        field: field.clone(),
                        local_value: current.clone(),
                        remote_value: value.clone(),
                        local: Provenance {
                            modified: target.last_modified,
                            version: target.version,
                        },
                        remote: Provenance {
                            modified: source.last_modified,
                            version: source.version,
                        },
                        resolution: None,
                        resolved_value: None,
                    });
                }
                _ => {
                    plan.updates.insert(field.clone(), value.clone());
                }
            }
        }
        plan
    }

    /// Whether the target changed in a way the source has not seen.
    fn target_moved(&self, source: &AgentState, target: &AgentState) -> bool {
        match self.detection {
            ConflictDetection::Watermark => {
                let seen = self
                    .watermarks
                    .get(&(source.agent_id.clone(), target.agent_id.clone()))
                    .map(|v| *v)
                    .unwrap_or(0);
                target.version > seen
            }
            ConflictDetection::WallClock => source.last_modified <= target.last_modified,
        }
    }
}

fn shared_fields(mut data: StateData) -> StateData {
    for field in StateStore::AGENT_OWNED_FIELDS {
        data.remove(field);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;
    use serde_json::{json, Value};
    use tiersync_core::{Agent, Layer, SyncFilter};

    fn data(v: Value) -> StateData {
        v.as_object().cloned().unwrap()
    }

    fn engine() -> SyncEngine {
        let registry = Arc::new(default_registry());
        let events = EventBus::new(256);
        let store = Arc::new(StateStore::new(events.clone()));
        for agent in registry.all() {
            store.register_agent(&agent);
        }
        SyncEngine::new(registry, store, Arc::new(ConflictResolver::default()), events)
    }

    #[tokio::test]
    async fn full_sync_reaches_only_adjacent_layers() {
        let engine = engine();
        engine.store().merge("mrf", &data(json!({"vision": "2030"}))).await.unwrap();
        let result = engine.process(SyncRequest::full("mrf")).await;

        assert_eq!(result.status, SyncStatus::Success);
        // 2 other executives + 6 administrative
        assert_eq!(result.synced_agents.len(), 8);
        assert_eq!(
            engine.store().get("sentinel").await.unwrap().data["vision"],
            json!("2030")
        );
        assert!(!engine.store().get("echo").await.unwrap().data.contains_key("vision"));
    }

    #[tokio::test]
    async fn bulk_syncs_keep_target_status_and_capabilities() {
        let engine = engine();
        engine.store().merge("monitor", &data(json!({"status": "busy"}))).await.unwrap();
        engine.store().merge("oracle", &data(json!({"trend": "up"}))).await.unwrap();
        let before = engine.store().get("monitor").await.unwrap();

        let filters = vec![SyncFilter::equals("trend", json!("up"))];
        for request in [
            SyncRequest::full("oracle").to("monitor"),
            SyncRequest::incremental("oracle").to("monitor"),
            SyncRequest::selective("oracle", filters).to("monitor"),
        ] {
            engine.process(request).await;
        }

        let monitor = engine.store().get("monitor").await.unwrap();
        assert_eq!(monitor.data["trend"], json!("up"));
        assert_eq!(monitor.data["status"], json!("busy"));
        assert_eq!(monitor.data["capabilities"], before.data["capabilities"]);
    }

    #[tokio::test]
    async fn full_sync_twice_is_idempotent() {
        let engine = engine();
        engine.store().merge("oracle", &data(json!({"trend": "up"}))).await.unwrap();
        engine.process(SyncRequest::full("oracle").to("monitor")).await;
        let first = engine.store().get("monitor").await.unwrap();
        let second_run = engine.process(SyncRequest::full("oracle").to("monitor")).await;
        let second = engine.store().get("monitor").await.unwrap();

        assert_eq!(first.data, second.data);
        assert_eq!(first.version, second.version);
        assert_eq!(second_run.records_synced, 0);
    }

    #[tokio::test]
    async fn incremental_requires_newer_source() {
        let engine = engine();
        let r = engine.process(SyncRequest::incremental("echo").to("trainer")).await;
        assert_eq!(r.records_synced, 0, "equal versions push nothing");

        engine.store().merge("echo", &data(json!({"a": 1, "b": 2}))).await.unwrap();
        let r = engine.process(SyncRequest::incremental("echo").to("trainer")).await;
        let trainer = engine.store().get("trainer").await.unwrap();
        assert_eq!(trainer.data["a"], json!(1));
        assert_eq!(trainer.data["b"], json!(2));
        assert!(r.records_synced >= 2);
    }

    #[tokio::test]
    async fn selective_without_filters_is_noop() {
        let engine = engine();
        engine.store().merge("echo", &data(json!({"zone": "eu"}))).await.unwrap();
        let before = engine.store().get("neural").await.unwrap();
        engine.process(SyncRequest::selective("echo", vec![]).to("neural")).await;
        assert_eq!(engine.store().get("neural").await.unwrap().version, before.version);
    }

    #[tokio::test]
    async fn selective_drops_failing_fields() {
        let engine = engine();
        engine
            .store()
            .merge("echo", &data(json!({"zone": "eu", "mode": "manual", "load": 3})))
            .await
            .unwrap();
        let filters = vec![
            SyncFilter::equals("mode", json!("auto")),
            SyncFilter::one_of("zone", vec![json!("eu")]),
        ];
        engine.process(SyncRequest::selective("echo", filters).to("neural")).await;
        let neural = engine.store().get("neural").await.unwrap();
        assert_eq!(neural.data["zone"], json!("eu"));
        assert_eq!(neural.data["load"], json!(3));
        assert!(!neural.data.contains_key("mode"));
    }

    #[tokio::test]
    async fn explicit_disallowed_target_is_skipped() {
        let engine = engine();
        let result = engine.process(SyncRequest::full("mrf").to("echo")).await;
        assert_eq!(result.status, SyncStatus::Success);
        assert!(result.synced_agents.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].agent_id.as_str(), "echo");

        let result = engine.process(SyncRequest::full("mrf").to("mrf")).await;
        assert_eq!(result.skipped.len(), 1);
        let result = engine.process(SyncRequest::full("mrf").to("ghost")).await;
        assert_eq!(result.skipped.len(), 1);
    }

    #[tokio::test]
    async fn missing_source_fails_request() {
        let engine = engine();
        let result = engine.process(SyncRequest::full("ghost")).await;
        assert_eq!(result.status, SyncStatus::Failed);
        assert!(result.error.unwrap().contains("ghost"));
        assert_eq!(engine.stats().await.failed_syncs, 1);
    }

    #[tokio::test]
    async fn delta_to_absent_field_applies_directly() {
        let engine = engine();
        let req = SyncRequest::delta("sentinel", data(json!({"threat": "low"}))).to("echo");
        let result = engine.process(req).await;
        assert!(result.conflicts.is_empty());
        assert_eq!(engine.store().get("echo").await.unwrap().data["threat"], json!("low"));
    }

    #[tokio::test]
    async fn watermark_clears_after_sync() {
        let engine = engine();
        engine.store().merge("echo", &data(json!({"t": 1}))).await.unwrap();
        let first = engine
            .process(SyncRequest::delta("sentinel", data(json!({"t": 2}))).to("echo"))
            .await;
        assert_eq!(first.conflicts.len(), 1);

        // echo has not moved since sentinel last saw it
        let second = engine
            .process(SyncRequest::delta("sentinel", data(json!({"t": 3}))).to("echo"))
            .await;
        assert!(second.conflicts.is_empty());
        assert_eq!(engine.store().get("echo").await.unwrap().data["t"], json!(3));
    }

    #[tokio::test]
    async fn wall_clock_detection_follows_modification_order() {
        let engine = engine().with_conflict_detection(ConflictDetection::WallClock);
        engine.store().merge("sentinel", &data(json!({"x": 0}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.store().merge("echo", &data(json!({"t": 1}))).await.unwrap();

        let result = engine
            .process(SyncRequest::delta("sentinel", data(json!({"t": 2}))).to("echo"))
            .await;
        assert_eq!(result.conflicts.len(), 1);
        // echo is newer, so newest-wins keeps its value
        assert_eq!(result.conflicts[0].resolved_value, Some(json!(1)));
        assert_eq!(engine.store().get("echo").await.unwrap().data["t"], json!(1));
    }

    #[tokio::test]
    async fn expired_deadline_fails_without_reverting() {
        let engine = engine();
        let _held = engine.store().lock("architect").await.unwrap();
        let req = SyncRequest::full("genius").to("architect").with_timeout_ms(20);
        let result = engine.process(req).await;
        assert_eq!(result.status, SyncStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn registered_agent_without_state_is_skipped() {
        let engine = engine();
        engine
            .registry
            .register(Agent::new("latecomer", Layer::Administrative))
            .unwrap();
        let result = engine.process(SyncRequest::full("mrf").to("latecomer")).await;
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.status, SyncStatus::Success);
    }
}
