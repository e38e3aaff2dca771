//! Conflict resolver - a table of named strategies
//!
//! Strategies are pure functions of the conflict: the same input always
//! yields the same decision. A strategy may decline (return `None`), which
//! leaves the conflict unresolved and the target untouched.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tiersync_core::{Provenance, ResolutionKind, SyncConflict};
use tracing::{debug, warn};

pub const NEWEST_WINS: &str = "newest_wins";
pub const LOCAL_WINS: &str = "local_wins";
pub const REMOTE_WINS: &str = "remote_wins";
pub const MERGE: &str = "merge";

/// A conflict-resolution policy.
pub trait ResolutionStrategy: Send + Sync {
    /// Name used to select the strategy on a request.
    fn name(&self) -> &str;

    /// Decided value, or `None` to leave the conflict unresolved.
    fn resolve(&self, conflict: &SyncConflict) -> Option<Value>;

    /// Tag recorded on the conflict when this strategy decides it.
    fn kind(&self) -> ResolutionKind {
        ResolutionKind::Custom(self.name().to_string())
    }
}

/// Later provenance wins; the local value keeps a full tie.
pub struct NewestWins;

impl NewestWins {
    fn key(p: &Provenance) -> (chrono::DateTime<chrono::Utc>, u64) {
        (p.modified, p.version)
    }
}

impl ResolutionStrategy for NewestWins {
    fn name(&self) -> &str {
        NEWEST_WINS
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<Value> {
        if Self::key(&conflict.remote) > Self::key(&conflict.local) {
            Some(conflict.remote_value.clone())
        } else {
            Some(conflict.local_value.clone())
        }
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::NewestWins
    }
}

pub struct LocalWins;

impl ResolutionStrategy for LocalWins {
    fn name(&self) -> &str {
        LOCAL_WINS
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<Value> {
        Some(conflict.local_value.clone())
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::LocalWins
    }
}

pub struct RemoteWins;

impl ResolutionStrategy for RemoteWins {
    fn name(&self) -> &str {
        REMOTE_WINS
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<Value> {
        Some(conflict.remote_value.clone())
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::RemoteWins
    }
}

/// Shallow union of two objects, local keys taking precedence.
/// Anything other than two objects keeps the local value.
pub struct MergeObjects;

impl ResolutionStrategy for MergeObjects {
    fn name(&self) -> &str {
        MERGE
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<Value> {
        match (&conflict.local_value, &conflict.remote_value) {
            (Value::Object(local), Value::Object(remote)) => {
                let mut merged = remote.clone();
                for (key, value) in local {
                    merged.insert(key.clone(), value.clone());
                }
                Some(Value::Object(merged))
            }
            (local, _) => Some(local.clone()),
        }
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::Merge
    }
}

pub struct ConflictResolver {
    strategies: HashMap<String, Arc<dyn ResolutionStrategy>>,
    default_strategy: String,
    fallback: Arc<dyn ResolutionStrategy>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(NEWEST_WINS)
    }
}

impl ConflictResolver {
    /// Resolver with the four built-in strategies and `default_strategy` as fallback.
    pub fn new(default_strategy: impl Into<String>) -> Self {
        let mut resolver = Self {
            strategies: HashMap::new(),
            default_strategy: NEWEST_WINS.to_string(),
            fallback: Arc::new(NewestWins),
        };
        resolver.register(Arc::new(NewestWins));
        resolver.register(Arc::new(LocalWins));
        resolver.register(Arc::new(RemoteWins));
        resolver.register(Arc::new(MergeObjects));

        let default_strategy = default_strategy.into();
        if resolver.strategies.contains_key(&default_strategy) {
            resolver.default_strategy = default_strategy;
        } else {
            warn!(
                "Unknown default strategy '{}', using {}",
                default_strategy, NEWEST_WINS
            );
        }
        resolver
    }

    /// Add or replace a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn ResolutionStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    /// Make a registered strategy the default. Returns false for unknown names.
    pub fn set_default(&mut self, name: &str) -> bool {
        if self.strategies.contains_key(name) {
            self.default_strategy = name.to_string();
            true
        } else {
            false
        }
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Decide `conflict` with the named strategy (or the default). Unknown names
    /// fall back to the default. Returns whether the conflict is now resolved.
    pub fn resolve(&self, conflict: &mut SyncConflict, strategy: Option<&str>) -> bool {
        let strategy = self.pick(strategy);
        match strategy.resolve(conflict) {
            Some(value) => {
                debug!(
                    "Conflict {}.{} resolved by {}",
                    conflict.agent_id,
                    conflict.field,
                    strategy.name()
                );
                conflict.resolution = Some(strategy.kind());
                conflict.resolved_value = Some(value);
                true
            }
            None => {
                debug!(
                    "Strategy {} left conflict {}.{} unresolved",
                    strategy.name(),
                    conflict.agent_id,
                    conflict.field
                );
                conflict.resolution = None;
                conflict.resolved_value = None;
                false
            }
        }
    }

    fn pick(&self, requested: Option<&str>) -> &Arc<dyn ResolutionStrategy> {
        if let Some(name) = requested {
            if let Some(strategy) = self.strategies.get(name) {
                return strategy;
            }
            warn!("Unknown strategy '{}', using {}", name, self.default_strategy);
        }
        self.strategies
            .get(&self.default_strategy)
            .unwrap_or(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn conflict(local: Value, remote: Value, local_newer: bool) -> SyncConflict {
        let now = Utc::now();
        let earlier = now - Duration::seconds(5);
        let (lm, rm) = if local_newer { (now, earlier) } else { (earlier, now) };
        SyncConflict {
            agent_id: "b".into(),
            field: "temperature".into(),
            local_value: local,
            remote_value: remote,
            local: Provenance { modified: lm, version: 2 },
            remote: Provenance { modified: rm, version: 3 },
            resolution: None,
            resolved_value: None,
        }
    }

    struct Abstain;

    impl ResolutionStrategy for Abstain {
        fn name(&self) -> &str {
            "abstain"
        }

        fn resolve(&self, _conflict: &SyncConflict) -> Option<Value> {
            None
        }
    }

    #[test]
    fn newest_wins_picks_later_side() {
        let resolver = ConflictResolver::default();
        let mut c = conflict(json!(25), json!(20), false);
        assert!(resolver.resolve(&mut c, None));
        assert_eq!(c.resolved_value, Some(json!(20)));
        assert_eq!(c.resolution, Some(ResolutionKind::NewestWins));

        let mut c = conflict(json!(25), json!(20), true);
        resolver.resolve(&mut c, None);
        assert_eq!(c.resolved_value, Some(json!(25)));
    }

    #[test]
    fn newest_wins_tie_keeps_local() {
        let resolver = ConflictResolver::default();
        let mut c = conflict(json!("l"), json!("r"), false);
        c.remote = c.local;
        resolver.resolve(&mut c, None);
        assert_eq!(c.resolved_value, Some(json!("l")));
    }

    #[test]
    fn version_breaks_timestamp_tie() {
        let resolver = ConflictResolver::default();
        let mut c = conflict(json!("l"), json!("r"), false);
        c.remote.modified = c.local.modified;
        assert!(c.remote.version > c.local.version);
        resolver.resolve(&mut c, None);
        assert_eq!(c.resolved_value, Some(json!("r")));
    }

    #[test]
    fn local_and_remote_wins() {
        let resolver = ConflictResolver::default();
        let mut c = conflict(json!(1), json!(2), false);
        resolver.resolve(&mut c, Some(LOCAL_WINS));
        assert_eq!(c.resolved_value, Some(json!(1)));
        resolver.resolve(&mut c, Some(REMOTE_WINS));
        assert_eq!(c.resolved_value, Some(json!(2)));
        assert_eq!(c.resolution, Some(ResolutionKind::RemoteWins));
    }

    #[test]
    fn merge_unions_objects_local_first() {
        let resolver = ConflictResolver::default();
        let mut c = conflict(json!({"a": 1, "b": 1}), json!({"b": 2, "c": 3}), false);
        resolver.resolve(&mut c, Some(MERGE));
        assert_eq!(c.resolved_value, Some(json!({"a": 1, "b": 1, "c": 3})));

        let mut c = conflict(json!([1]), json!({"x": 1}), false);
        resolver.resolve(&mut c, Some(MERGE));
        assert_eq!(c.resolved_value, Some(json!([1])));
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = ConflictResolver::default();
        let base = conflict(json!({"k": 1}), json!({"k": 2, "z": 0}), false);
        for name in [NEWEST_WINS, LOCAL_WINS, REMOTE_WINS, MERGE] {
            let mut first = base.clone();
            resolver.resolve(&mut first, Some(name));
            for _ in 0..10 {
                let mut again = base.clone();
                resolver.resolve(&mut again, Some(name));
                assert_eq!(again, first);
            }
        }
    }

    #[test]
    fn abstaining_strategy_leaves_conflict_unresolved() {
        let mut resolver = ConflictResolver::default();
        resolver.register(Arc::new(Abstain));
        let mut c = conflict(json!(1), json!(2), false);
        assert!(!resolver.resolve(&mut c, Some("abstain")));
        assert!(!c.is_resolved());
        assert!(c.resolved_value.is_none());
    }

    #[test]
    fn unknown_strategy_falls_back_to_default() {
        let resolver = ConflictResolver::new(REMOTE_WINS);
        assert_eq!(resolver.default_strategy(), REMOTE_WINS);
        let mut c = conflict(json!(1), json!(2), true);
        resolver.resolve(&mut c, Some("coin_flip"));
        assert_eq!(c.resolved_value, Some(json!(2)));

        let resolver = ConflictResolver::new("coin_flip");
        assert_eq!(resolver.default_strategy(), NEWEST_WINS);
    }
}
