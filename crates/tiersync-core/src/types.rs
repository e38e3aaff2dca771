//! Core types for Tiersync: agent identity, layers, permissions, priorities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;

/// Sender id used for messages the router synthesizes itself (approval requests).
pub const SYSTEM_AGENT: &str = "system";

pub type MessageId = String;
pub type RequestId = String;

/// Stable agent identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_AGENT
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The three organizational tiers, ordered from the top.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Executive,
    Administrative,
    Productive,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Executive, Layer::Administrative, Layer::Productive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Executive => "executive",
            Layer::Administrative => "administrative",
            Layer::Productive => "productive",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission levels, ordered None < Read < Write < Execute < Approve < Full.
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    Execute = 3,
    Approve = 4,
    Full = 5,
}

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    #[default]
    Idle,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

/// Message and sync priority. Ordering follows urgency: Low < Medium < High < Critical.
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Resources covered by the default permission matrix.
pub const RESOURCES: [&str; 8] = [
    "agents",
    "tasks",
    "governance",
    "archives",
    "settings",
    "integrations",
    "users",
    "analytics",
];

/// Default permission matrix for a layer.
pub fn default_permissions(layer: Layer) -> BTreeMap<String, PermissionLevel> {
    use PermissionLevel::*;
    let levels: [PermissionLevel; 8] = match layer {
        Layer::Executive => [Full; 8],
        Layer::Administrative => [Execute, Write, Read, Write, Read, Write, Read, Write],
        Layer::Productive => [Read, Execute, None, Read, None, Execute, None, Read],
    };
    RESOURCES
        .iter()
        .zip(levels)
        .map(|(resource, level)| (resource.to_string(), level))
        .collect()
}

/// A registered participant. Layer membership is fixed once registered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: String,
    pub layer: Layer,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionLevel>,
    #[serde(default)]
    pub status: AgentStatus,
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    /// New idle agent with its layer's default permissions.
    pub fn new(id: impl Into<AgentId>, layer: Layer) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            role: String::new(),
            layer,
            capabilities: Vec::new(),
            permissions: default_permissions(layer),
            status: AgentStatus::Idle,
            last_activity: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permission(mut self, resource: impl Into<String>, level: PermissionLevel) -> Self {
        self.permissions.insert(resource.into(), level);
        self
    }

    /// Level held on `resource`; unknown resources are `None`.
    pub fn permission(&self, resource: &str) -> PermissionLevel {
        self.permissions.get(resource).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::None < PermissionLevel::Read);
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Execute);
        assert!(PermissionLevel::Execute < PermissionLevel::Approve);
        assert!(PermissionLevel::Approve < PermissionLevel::Full);
    }

    #[test]
    fn priority_order_matches_urgency() {
        let mut p = vec![Priority::Critical, Priority::Low, Priority::High, Priority::Medium];
        p.sort();
        assert_eq!(
            p,
            vec![Priority::Low, Priority::Medium, Priority::High, Priority::Critical]
        );
    }

    #[test]
    fn productive_defaults_have_no_governance() {
        let perms = default_permissions(Layer::Productive);
        assert_eq!(perms["governance"], PermissionLevel::None);
        assert_eq!(perms["tasks"], PermissionLevel::Execute);
        assert_eq!(perms.len(), RESOURCES.len());
    }

    #[test]
    fn agent_unknown_resource_is_none() {
        let agent = Agent::new("echo", Layer::Productive);
        assert_eq!(agent.permission("security"), PermissionLevel::None);
        let agent = agent.with_permission("security", PermissionLevel::Full);
        assert_eq!(agent.permission("security"), PermissionLevel::Full);
    }

    #[test]
    fn agent_id_serializes_as_plain_string() {
        let id = AgentId::new("mrf");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""mrf""#);
        assert!(AgentId::new(SYSTEM_AGENT).is_system());
    }
}
