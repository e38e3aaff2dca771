//! Sync requests, conflicts, results and aggregate statistics

use crate::state::StateData;
use crate::types::{AgentId, Priority, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Overwrite targets with the whole source payload.
    Full,
    /// Push the source/target diff when the source is at a newer version.
    Incremental,
    /// Push a caller-supplied field set, detecting conflicts.
    Delta,
    /// Push source fields that pass the request filters.
    Selective,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    Contains,
    In,
}

/// Field-level predicate for Selective sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl SyncFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Equals, value)
    }

    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    /// Whether `data[field]` satisfies the predicate.
    pub fn matches(&self, data: &StateData) -> bool {
        let Some(current) = data.get(&self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::Equals => *current == self.value,
            FilterOperator::Contains => match (current, &self.value) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            FilterOperator::In => self
                .value
                .as_array()
                .is_some_and(|allowed| allowed.contains(current)),
        }
    }
}

/// Copy of `data` without the fields whose filter fails. Fields no filter names pass through.
pub fn apply_filters(data: &StateData, filters: &[SyncFilter]) -> StateData {
    let mut filtered = data.clone();
    for filter in filters {
        if !filter.matches(data) {
            filtered.remove(&filter.field);
        }
    }
    filtered
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: RequestId,
    pub source_agent_id: AgentId,
    /// `None` targets every other eligible agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<AgentId>,
    pub sync_type: SyncType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<SyncFilter>,
    #[serde(default)]
    pub data: StateData,
    /// Resolver strategy name; the resolver default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl SyncRequest {
    pub fn new(source: impl Into<AgentId>, sync_type: SyncType) -> Self {
        Self {
            id: new_request_id(),
            source_agent_id: source.into(),
            target_agent_id: None,
            sync_type,
            priority: Priority::default(),
            filters: Vec::new(),
            data: StateData::new(),
            strategy: None,
            timeout_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn full(source: impl Into<AgentId>) -> Self {
        Self::new(source, SyncType::Full)
    }

    pub fn incremental(source: impl Into<AgentId>) -> Self {
        Self::new(source, SyncType::Incremental)
    }

    pub fn delta(source: impl Into<AgentId>, data: StateData) -> Self {
        Self::new(source, SyncType::Delta).with_data(data)
    }

    pub fn selective(source: impl Into<AgentId>, filters: Vec<SyncFilter>) -> Self {
        Self::new(source, SyncType::Selective).with_filters(filters)
    }

    pub fn to(mut self, target: impl Into<AgentId>) -> Self {
        self.target_agent_id = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: StateData) -> Self {
        self.data = data;
        self
    }

    pub fn with_filters(mut self, filters: Vec<SyncFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

pub fn new_request_id() -> RequestId {
    format!("sync-{}", uuid::Uuid::new_v4())
}

/// When and at which version one side of a conflict last changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub modified: DateTime<Utc>,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    NewestWins,
    LocalWins,
    RemoteWins,
    Merge,
    Custom(String),
}

/// A field disagreement between a target (local) and the incoming value (remote).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub agent_id: AgentId,
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local: Provenance,
    pub remote: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<Value>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Syncing,
    Success,
    Conflict,
    Failed,
}

/// A target left out of a sync pass, with the reason.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedTarget {
    pub agent_id: AgentId,
    pub reason: String,
}

/// Terminal outcome of one sync request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub request_id: RequestId,
    pub source_agent_id: AgentId,
    pub status: SyncStatus,
    pub synced_agents: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedTarget>,
    pub conflicts: Vec<SyncConflict>,
    pub records_synced: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn started(request: &SyncRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            source_agent_id: request.source_agent_id.clone(),
            status: SyncStatus::Syncing,
            synced_agents: Vec::new(),
            skipped: Vec::new(),
            conflicts: Vec::new(),
            records_synced: 0,
            duration_ms: 0,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn resolved_conflicts(&self) -> usize {
        self.conflicts.iter().filter(|c| c.is_resolved()).count()
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }
}

/// Aggregate counters over every processed sync.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_resolved: u64,
    pub average_duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub persistence_errors: u64,
}

impl SyncStats {
    /// Fold one finished result into the counters. Conflict outcomes count as successful.
    pub fn record(&mut self, result: &SyncResult) {
        self.total_syncs += 1;
        match result.status {
            SyncStatus::Failed => self.failed_syncs += 1,
            _ => self.successful_syncs += 1,
        }
        self.conflicts_resolved += result.resolved_conflicts() as u64;
        let n = self.total_syncs as f64;
        self.average_duration_ms += (result.duration_ms as f64 - self.average_duration_ms) / n;
        self.last_sync_time = Some(result.completed_at);
    }
}
