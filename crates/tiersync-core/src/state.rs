//! Versioned, checksummed agent state records

use crate::types::{AgentId, Layer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Open field map held for each agent. Keys are kept sorted, so its JSON form is canonical.
pub type StateData = Map<String, Value>;

/// Authoritative state record for one agent.
///
/// `version` only moves forward and `checksum` always matches `data`;
/// both are maintained by [`AgentState::apply`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub layer: Layer,
    pub version: u64,
    pub data: StateData,
    pub last_modified: DateTime<Utc>,
    pub checksum: String,
}

impl AgentState {
    /// Fresh record at version 1.
    pub fn new(agent_id: impl Into<AgentId>, layer: Layer, data: StateData) -> Self {
        let checksum = checksum_of(&data);
        Self {
            agent_id: agent_id.into(),
            layer,
            version: 1,
            data,
            last_modified: Utc::now(),
            checksum,
        }
    }

    /// Shallow-merge `updates` into `data`, bump the version, refresh timestamp and checksum.
    pub fn apply(&mut self, updates: &StateData) {
        for (key, value) in updates {
            self.data.insert(key.clone(), value.clone());
        }
        self.version += 1;
        let now = Utc::now();
        // keep last_modified monotonic even if the wall clock steps back
        self.last_modified = if now > self.last_modified {
            now
        } else {
            self.last_modified
        };
        self.checksum = checksum_of(&self.data);
    }

    /// Checksum `data` would have after merging `updates`, without mutating.
    pub fn checksum_after(&self, updates: &StateData) -> String {
        let mut merged = self.data.clone();
        for (key, value) in updates {
            merged.insert(key.clone(), value.clone());
        }
        checksum_of(&merged)
    }

    pub fn checksum_is_valid(&self) -> bool {
        self.checksum == checksum_of(&self.data)
    }
}

/// SHA-256 over the canonical JSON encoding of `data`, hex encoded.
pub fn checksum_of(data: &StateData) -> String {
    let canonical = serde_json::to_vec(data).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Keys of `new` whose value differs from `old` (absent in `old` counts as different).
pub fn diff(old: &StateData, new: &StateData) -> StateData {
    new.iter()
        .filter(|(key, value)| old.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
