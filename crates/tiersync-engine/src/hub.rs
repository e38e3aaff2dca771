//! Hub - one process-scoped instance of the whole core.
//!
//! Owns the registry, store, router, engine and scheduler and wires them to a
//! shared event bus and persistence writer. Several hubs can live in one
//! process; nothing here is global.

use crate::config::TiersyncConfig;
use crate::engine::SyncEngine;
use crate::events::{EventBus, EventReceiver, SyncEvent};
use crate::persistence::{adapter_from_config, PersistenceAdapter, PersistenceWriter};
use crate::registry::{default_roster, AgentRegistry, LayerStats};
use crate::resolver::{ConflictResolver, ResolutionStrategy, REMOTE_WINS};
use crate::router::{LayerRouter, RouteOutcome, Routed};
use crate::scheduler::{Submission, SyncScheduler};
use crate::store::StateStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tiersync_core::{
    Agent, AgentId, AgentState, AgentStatus, Layer, LayerMessage, MessageId, Priority, Result,
    StateData, SyncRequest, SyncResult, SyncStats,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HubBuilder {
    config: TiersyncConfig,
    agents: Option<Vec<Agent>>,
    adapter: Option<Arc<dyn PersistenceAdapter>>,
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
}

impl HubBuilder {
    /// Agents to register instead of the default roster.
    pub fn agents(mut self, agents: Vec<Agent>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Persistence backend to use instead of the one named in the config.
    pub fn persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Extra conflict-resolution strategy, selectable by name on requests.
    pub fn strategy(mut self, strategy: Arc<dyn ResolutionStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Wire the components and seed state from persistence.
    /// Must run inside a tokio runtime.
    pub async fn build(self) -> Result<Hub> {
        let config = self.config;
        let events = EventBus::new(config.events.capacity);

        let registry = Arc::new(AgentRegistry::with_agents(
            self.agents.unwrap_or_else(default_roster),
        )?);
        info!("Hub: {} agents registered", registry.len());

        let adapter = self
            .adapter
            .unwrap_or_else(|| adapter_from_config(&config.persistence));
        let writer = PersistenceWriter::spawn(adapter.clone(), &config.persistence);

        let store = Arc::new(StateStore::new(events.clone()).with_persistence(writer.clone()));
        for agent in registry.all() {
            store.register_agent(&agent);
        }
        match adapter.load_agent_states().await {
            Ok(loaded) => {
                store.reconcile(loaded).await;
            }
            Err(e) => warn!("Could not load persisted states ({}): starting fresh", e),
        }

        let mut resolver = ConflictResolver::default();
        for strategy in self.strategies {
            resolver.register(strategy);
        }
        if !resolver.set_default(&config.resolver.default_strategy) {
            warn!(
                "Unknown default strategy '{}', using {}",
                config.resolver.default_strategy,
                resolver.default_strategy()
            );
        }
        info!(
            "Resolver: strategies {:?}, default {}",
            resolver.names(),
            resolver.default_strategy()
        );

        let engine = Arc::new(
            SyncEngine::new(
                registry.clone(),
                store.clone(),
                Arc::new(resolver),
                events.clone(),
            )
            .with_persistence(writer.clone())
            .with_conflict_detection(config.resolver.conflict_detection)
            .with_default_timeout(
                config
                    .scheduler
                    .default_timeout_ms
                    .map(std::time::Duration::from_millis),
            ),
        );
        let scheduler = Arc::new(SyncScheduler::new(
            engine.clone(),
            events.clone(),
            &config.scheduler,
        ));
        let router = Arc::new(
            LayerRouter::new(registry.clone(), events.clone(), config.router.retention())
                .with_persistence(writer.clone()),
        );

        Ok(Hub {
            config,
            registry,
            store,
            router,
            engine,
            scheduler,
            events,
            writer,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct Hub {
    config: TiersyncConfig,
    registry: Arc<AgentRegistry>,
    store: Arc<StateStore>,
    router: Arc<LayerRouter>,
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
    events: EventBus,
    writer: PersistenceWriter,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn builder(config: TiersyncConfig) -> HubBuilder {
        HubBuilder {
            config,
            agents: None,
            adapter: None,
            strategies: Vec::new(),
        }
    }

    pub fn config(&self) -> &TiersyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<LayerRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the scheduler driver and the message pump. Calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            debug!("Hub already started");
            return;
        }
        tasks.push(self.scheduler.clone().spawn(self.cancel.child_token()));

        let hub = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.router.tick());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Message pump started (tick {:?})", hub.config.router.tick());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        hub.pump_messages().await;
                    }
                }
            }
            info!("Message pump stopped");
        }));
        info!("Hub started");
    }

    /// Stop background tasks, run what is still queued and flush persistence.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.pump_messages().await;
        let remaining = self.scheduler.drain().await;
        if !remaining.is_empty() {
            info!("Ran {} queued syncs during shutdown", remaining.len());
        }
        self.writer.flush().await;
        info!("Hub stopped");
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub async fn enqueue_message(&self, message: LayerMessage) -> MessageId {
        self.router.enqueue(message).await
    }

    /// Route everything queued so far, relaying directed deliveries when enabled.
    pub async fn pump_messages(&self) -> Vec<Routed> {
        let routed = self.router.process_pending().await;
        if self.config.router.relay_deliveries {
            for entry in &routed {
                if let Ok(RouteOutcome::Delivered(_)) = entry.outcome {
                    self.relay(&entry.message).await;
                }
            }
        }
        routed
    }

    pub async fn approve(&self, original_id: &str, approver: &str) -> Result<Vec<AgentId>> {
        let targets = self.router.approve(original_id, approver).await?;
        if self.config.router.relay_deliveries {
            if let Some(message) = self.router.message(original_id) {
                self.relay(&message).await;
            }
        }
        Ok(targets)
    }

    pub async fn deny(&self, original_id: &str, approver: &str) -> Result<()> {
        self.router.deny(original_id, approver).await
    }

    pub fn acknowledge(&self, message_id: &str) -> Result<bool> {
        self.router.acknowledge(message_id)
    }

    /// The latest delivery always lands, whatever the sender's own state age.
    async fn relay(&self, message: &LayerMessage) {
        let Some(target) = &message.to_agent else {
            return;
        };
        if message.is_system() {
            return;
        }
        let request = SyncRequest::delta(message.from_agent.clone(), relay_payload(message))
            .to(target.clone())
            .with_priority(message.priority)
            .with_strategy(REMOTE_WINS);
        debug!("Relaying message {} as sync {}", message.id, request.id);
        self.scheduler.submit(request).await;
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Critical requests run before this returns; others wait for the driver.
    pub async fn enqueue_sync(&self, request: SyncRequest) -> Submission {
        self.scheduler.submit(request).await
    }

    /// Execute a request now, bypassing the queue.
    pub async fn process_sync_now(&self, request: SyncRequest) -> SyncResult {
        self.engine.process(request).await
    }

    /// Immediate High-priority Full sync from `source` to every eligible agent.
    pub async fn sync_all(&self, source: &str) -> SyncResult {
        let request = SyncRequest::full(source).with_priority(Priority::High);
        self.engine.process(request).await
    }

    // -----------------------------------------------------------------------
    // State and queries
    // -----------------------------------------------------------------------

    pub async fn get_agent_state(&self, agent_id: &str) -> Result<AgentState> {
        self.store.get(agent_id).await
    }

    pub async fn get_all_states(&self) -> Vec<AgentState> {
        self.store.all().await
    }

    /// Merge `updates` into an agent's own state.
    pub async fn update_agent_state(&self, agent_id: &str, updates: StateData) -> Result<AgentState> {
        self.store.merge(agent_id, &updates).await
    }

    pub async fn get_queue_length(&self) -> usize {
        self.scheduler.len().await
    }

    pub async fn get_stats(&self) -> SyncStats {
        self.engine.stats().await
    }

    pub fn layer_stats(&self) -> BTreeMap<Layer, LayerStats> {
        self.registry.layer_stats()
    }

    /// Update an agent's status in the registry and mirror it into its state.
    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        if !self.registry.set_status(agent_id, status)? {
            return Ok(());
        }
        self.events.publish(SyncEvent::AgentStatusChanged {
            agent_id: AgentId::new(agent_id),
            status,
        });
        let mut updates = StateData::new();
        updates.insert("status".into(), Value::from(status.as_str()));
        self.store.merge(agent_id, &updates).await?;
        Ok(())
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Wait until every persistence write issued so far has been attempted.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

fn relay_payload(message: &LayerMessage) -> StateData {
    let mut data = StateData::new();
    data.insert(
        "last_message".into(),
        serde_json::json!({
            "id": message.id,
            "intent": message.intent,
            "payload": message.payload,
        }),
    );
    data
}
