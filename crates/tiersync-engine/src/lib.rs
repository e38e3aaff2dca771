//! Tiersync Engine - Registry, routing, versioned state and the sync pipeline

pub mod config;
pub mod engine;
pub mod events;
pub mod hub;
pub mod persistence;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod scheduler;
pub mod store;

pub use config::{ConflictDetection, PersistenceBackend, TiersyncConfig};
pub use engine::SyncEngine;
pub use events::{EventBus, EventReceiver, RecvError, SyncEvent};
pub use hub::{Hub, HubBuilder};
pub use persistence::{
    InMemoryPersistence, JsonFilePersistence, PersistenceAdapter, PersistenceWriter,
};
pub use registry::{default_registry, default_roster, AgentRegistry, LayerStats};
pub use resolver::{ConflictResolver, ResolutionStrategy};
pub use router::{LayerRouter, RouteOutcome, Routed};
pub use scheduler::{Submission, SyncQueue, SyncScheduler};
pub use store::{StateGuard, StateStore};
