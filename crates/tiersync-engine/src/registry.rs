//! Agent registry - the stable identity source for routing and sync.
//!
//! Agents are registered once with a fixed layer and never removed. Only the
//! status (and its activity timestamp) changes at runtime.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tiersync_core::{
    Agent, AgentId, AgentStatus, Error, Layer, PermissionLevel, Result,
};
use tracing::{info, warn};

/// Per-layer headcount. Idle agents count as active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
    pub total: usize,
    pub active: usize,
    pub busy: usize,
}

pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Registry pre-filled with `agents`.
    pub fn with_agents(agents: impl IntoIterator<Item = Agent>) -> Result<Self> {
        let registry = Self::new();
        for agent in agents {
            registry.register(agent)?;
        }
        Ok(registry)
    }

    /// Add an agent. Ids are unique for the process lifetime; `system` is reserved
    /// for router-generated messages.
    pub fn register(&self, agent: Agent) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        if agent.id.is_system() {
            return Err(Error::Config(format!("agent id '{}' is reserved", agent.id)));
        }
        match self.agents.entry(agent.id.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(agent.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(agent);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Agent> {
        self.agents
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn layer_of(&self, id: &str) -> Result<Layer> {
        self.agents
            .get(id)
            .map(|a| a.layer)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Agents in `layer`, sorted by id.
    pub fn list_by_layer(&self, layer: Layer) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|a| a.layer == layer)
            .map(|a| a.clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Every agent, sorted by id.
    pub fn all(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|a| a.clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Set the status and touch `last_activity`. Setting the current status again is a no-op
    /// apart from the timestamp. Returns whether the status changed.
    pub fn set_status(&self, id: &str, status: AgentStatus) -> Result<bool> {
        let mut agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let changed = agent.status != status;
        agent.status = status;
        agent.last_activity = Utc::now();
        Ok(changed)
    }

    /// Whether `id` holds at least `required` on `resource`. Unknown agents hold nothing.
    pub fn check_permission(&self, id: &str, resource: &str, required: PermissionLevel) -> bool {
        self.agents
            .get(id)
            .map(|a| a.permission(resource) >= required)
            .unwrap_or(false)
    }

    pub fn layer_stats(&self) -> BTreeMap<Layer, LayerStats> {
        let mut stats: BTreeMap<Layer, LayerStats> =
            Layer::ALL.iter().map(|l| (*l, LayerStats::default())).collect();
        for agent in self.agents.iter() {
            let entry = stats.entry(agent.layer).or_default();
            entry.total += 1;
            match agent.status {
                AgentStatus::Active | AgentStatus::Idle => entry.active += 1,
                AgentStatus::Busy => entry.busy += 1,
                AgentStatus::Offline => {}
            }
        }
        stats
    }
}

struct RosterEntry {
    id: &'static str,
    name: &'static str,
    layer: Layer,
    role: &'static str,
    capabilities: &'static [&'static str],
}

const ROSTER: &[RosterEntry] = &[
    // ─── Executive ───
    RosterEntry {
        id: "mrf",
        name: "Mr.F",
        layer: Layer::Executive,
        role: "CEO & Strategic Commander",
        capabilities: &["strategic_planning", "decision_making", "crisis_management", "approval"],
    },
    RosterEntry {
        id: "genius",
        name: "Dr. Genius",
        layer: Layer::Executive,
        role: "Chief Innovation Officer",
        capabilities: &["innovation", "research", "product_design", "strategy"],
    },
    RosterEntry {
        id: "oracle",
        name: "Oracle",
        layer: Layer::Executive,
        role: "Data Prophet & Predictive Analyst",
        capabilities: &["prediction", "trend_analysis", "forecasting", "insights"],
    },
    // ─── Administrative ───
    RosterEntry {
        id: "sentinel",
        name: "Sentinel",
        layer: Layer::Administrative,
        role: "Security Guardian",
        capabilities: &["security_monitoring", "threat_detection", "access_control", "audit"],
    },
    RosterEntry {
        id: "architect",
        name: "Architect",
        layer: Layer::Administrative,
        role: "System Designer",
        capabilities: &["system_design", "architecture", "planning", "optimization"],
    },
    RosterEntry {
        id: "phoenix",
        name: "Phoenix",
        layer: Layer::Administrative,
        role: "Recovery & Resilience Manager",
        capabilities: &["disaster_recovery", "backup", "restoration", "resilience"],
    },
    RosterEntry {
        id: "guardian",
        name: "Guardian",
        layer: Layer::Administrative,
        role: "Compliance Officer",
        capabilities: &["compliance", "gdpr", "privacy", "legal_audit"],
    },
    RosterEntry {
        id: "orchestrator",
        name: "Orchestrator",
        layer: Layer::Administrative,
        role: "Task Coordinator",
        capabilities: &["task_scheduling", "load_balancing", "priority_management", "coordination"],
    },
    RosterEntry {
        id: "monitor",
        name: "Monitor",
        layer: Layer::Administrative,
        role: "Performance Monitor",
        capabilities: &["performance_monitoring", "alerting", "metrics", "health_check"],
    },
    // ─── Productive ───
    RosterEntry {
        id: "neural",
        name: "Neural",
        layer: Layer::Productive,
        role: "Neural Network Specialist",
        capabilities: &["ml_training", "model_optimization", "neural_networks", "deep_learning"],
    },
    RosterEntry {
        id: "quantum",
        name: "Quantum",
        layer: Layer::Productive,
        role: "Quantum Computing Specialist",
        capabilities: &["complex_calculations", "simulation", "optimization_algorithms"],
    },
    RosterEntry {
        id: "catalyst",
        name: "Catalyst",
        layer: Layer::Productive,
        role: "Growth Accelerator",
        capabilities: &["performance_optimization", "acceleration", "efficiency"],
    },
    RosterEntry {
        id: "echo",
        name: "Echo",
        layer: Layer::Productive,
        role: "Communication Hub",
        capabilities: &["messaging", "api_integration", "websocket", "routing"],
    },
    RosterEntry {
        id: "dataminer",
        name: "DataMiner",
        layer: Layer::Productive,
        role: "Data Analyst",
        capabilities: &["data_extraction", "analytics", "sql", "visualization"],
    },
    RosterEntry {
        id: "devopsbot",
        name: "DevOpsBot",
        layer: Layer::Productive,
        role: "DevOps Automation",
        capabilities: &["cicd", "deployment", "infrastructure", "automation"],
    },
    RosterEntry {
        id: "trainer",
        name: "Trainer",
        layer: Layer::Productive,
        role: "Learning System",
        capabilities: &["training", "feedback_loop", "model_improvement", "evaluation"],
    },
];

/// The standard 16-agent catalogue: 3 executive, 6 administrative, 7 productive.
pub fn default_roster() -> Vec<Agent> {
    ROSTER
        .iter()
        .map(|entry| {
            let agent = Agent::new(entry.id, entry.layer)
                .with_name(entry.name)
                .with_role(entry.role)
                .with_capabilities(entry.capabilities.iter().copied());
            if entry.id == "sentinel" {
                agent.with_permission("security", PermissionLevel::Full)
            } else {
                agent
            }
        })
        .collect()
}

/// Registry holding [`default_roster`].
pub fn default_registry() -> AgentRegistry {
    let registry = AgentRegistry::new();
    for agent in default_roster() {
        if let Err(e) = registry.register(agent) {
            warn!("AgentRegistry: skipping roster entry: {}", e);
        }
    }
    info!("AgentRegistry: initialized {} agents across 3 layers", registry.len());
    registry
}
