//! State store - authoritative, versioned state per agent.
//!
//! Each record sits behind its own async mutex so writes to one agent are
//! serialized (version bumps never interleave) while different agents proceed
//! in parallel. The sync engine holds a record's lock across its
//! read-compare-write so a concurrent merge cannot slip between them.

use crate::events::{EventBus, SyncEvent};
use crate::persistence::PersistenceWriter;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tiersync_core::{Agent, AgentId, AgentState, Error, Layer, Result, StateData};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};

/// Exclusive access to one agent's record.
pub type StateGuard = OwnedMutexGuard<AgentState>;

pub struct StateStore {
    records: DashMap<AgentId, Arc<Mutex<AgentState>>>,
    events: EventBus,
    persistence: Option<PersistenceWriter>,
}

impl StateStore {
    pub fn new(events: EventBus) -> Self {
        Self {
            records: DashMap::new(),
            events,
            persistence: None,
        }
    }

    /// Save every committed version through `writer`.
    pub fn with_persistence(mut self, writer: PersistenceWriter) -> Self {
        self.persistence = Some(writer);
        self
    }

    /// Fields seeded from the agent itself. Bulk syncs never copy them between agents.
    pub const AGENT_OWNED_FIELDS: [&'static str; 2] = ["status", "capabilities"];

    /// Initial record for `agent`: its status and capabilities at version 1.
    pub fn initial_state(agent: &Agent) -> AgentState {
        let mut data = StateData::new();
        data.insert("status".into(), Value::from(agent.status.as_str()));
        data.insert(
            "capabilities".into(),
            Value::from(agent.capabilities.clone()),
        );
        AgentState::new(agent.id.clone(), agent.layer, data)
    }

    /// Create the record for `agent` unless one exists. Returns whether it was created.
    pub fn register_agent(&self, agent: &Agent) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(agent.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Self::initial_state(agent))));
                true
            }
        }
    }

    /// Adopt snapshots loaded from persistence. A loaded record replaces the
    /// in-memory one only for a known agent and only when its version is higher.
    pub async fn reconcile(&self, loaded: Vec<AgentState>) -> usize {
        let mut adopted = 0;
        for snapshot in loaded {
            let Some(record) = self.record(snapshot.agent_id.as_str()) else {
                debug!("Ignoring snapshot for unknown agent {}", snapshot.agent_id);
                continue;
            };
            let mut current = record.lock().await;
            if snapshot.version > current.version && snapshot.layer == current.layer {
                let mut snapshot = snapshot;
                if !snapshot.checksum_is_valid() {
                    snapshot.checksum = tiersync_core::checksum_of(&snapshot.data);
                }
                *current = snapshot;
                adopted += 1;
            }
        }
        if adopted > 0 {
            info!("StateStore: restored {} agent states from persistence", adopted);
        }
        adopted
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.records.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of one record.
    pub async fn get(&self, agent_id: &str) -> Result<AgentState> {
        let record = self
            .record(agent_id)
            .ok_or_else(|| Error::NotFound(agent_id.to_string()))?;
        let state = record.lock().await;
        Ok(state.clone())
    }

    /// Snapshot of every record, sorted by agent id.
    pub async fn all(&self) -> Vec<AgentState> {
        let mut records: Vec<(AgentId, Arc<Mutex<AgentState>>)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        let mut states = Vec::with_capacity(records.len());
        for (_, record) in records {
            states.push(record.lock().await.clone());
        }
        states
    }

    /// Snapshots for `layer` only, sorted by agent id.
    pub async fn by_layer(&self, layer: Layer) -> Vec<AgentState> {
        self.all()
            .await
            .into_iter()
            .filter(|s| s.layer == layer)
            .collect()
    }

    /// Merge `updates` into the record and commit a new version.
    pub async fn merge(&self, agent_id: &str, updates: &StateData) -> Result<AgentState> {
        let mut guard = self.lock(agent_id).await?;
        Ok(self.commit(&mut guard, updates))
    }

    /// Acquire the record lock.
    pub async fn lock(&self, agent_id: &str) -> Result<StateGuard> {
        let record = self
            .record(agent_id)
            .ok_or_else(|| Error::NotFound(agent_id.to_string()))?;
        Ok(record.lock_owned().await)
    }

    /// Acquire the record lock, giving up at `deadline`.
    pub async fn lock_until(&self, agent_id: &str, deadline: Option<Instant>) -> Result<StateGuard> {
        let Some(deadline) = deadline else {
            return self.lock(agent_id).await;
        };
        let record = self
            .record(agent_id)
            .ok_or_else(|| Error::NotFound(agent_id.to_string()))?;
        let started = Instant::now();
        tokio::time::timeout_at(deadline, record.lock_owned())
            .await
            .map_err(|_| Error::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
    }

    /// Apply `updates` to a locked record, publish and persist the new version.
    pub fn commit(&self, guard: &mut StateGuard, updates: &StateData) -> AgentState {
        guard.apply(updates);
        let state = AgentState::clone(guard);
        debug!(
            "State {} -> v{} ({} fields)",
            state.agent_id,
            state.version,
            updates.len()
        );
        self.events.publish(SyncEvent::StateUpdated {
            agent_id: state.agent_id.clone(),
            version: state.version,
            checksum: state.checksum.clone(),
        });
        if let Some(writer) = &self.persistence {
            writer.save_state(state.clone());
        }
        state
    }

    /// Fields of `new` that differ from `old`.
    pub fn diff(old: &StateData, new: &StateData) -> StateData {
        tiersync_core::diff(old, new)
    }

    fn record(&self, agent_id: &str) -> Option<Arc<Mutex<AgentState>>> {
        self.records.get(agent_id).map(|r| r.value().clone())
    }
}
