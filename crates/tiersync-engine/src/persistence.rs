//! Persistence - durable storage for state snapshots and audit logs.
//!
//! The core only talks to [`PersistenceAdapter`]. Writes go through a
//! [`PersistenceWriter`], a background worker that retries with backoff and
//! never blocks the caller: a write that still fails is logged and counted,
//! the in-memory outcome stands.

use crate::config::{PersistenceBackend, PersistenceConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiersync_core::{AgentId, AgentState, Error, LayerMessage, Result, SyncResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn save_agent_state(&self, state: &AgentState) -> Result<()>;

    async fn append_sync_log(&self, result: &SyncResult) -> Result<()>;

    async fn append_message_log(&self, _message: &LayerMessage) -> Result<()> {
        Ok(())
    }

    /// Every stored snapshot; used once at startup.
    async fn load_agent_states(&self) -> Result<Vec<AgentState>>;
}

/// Build the adapter selected by `config.backend`.
pub fn adapter_from_config(config: &PersistenceConfig) -> Arc<dyn PersistenceAdapter> {
    match config.backend {
        PersistenceBackend::Memory => Arc::new(InMemoryPersistence::new()),
        PersistenceBackend::Json => Arc::new(JsonFilePersistence::new(&config.dir)),
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local backend. Can be told to fail writes to exercise error paths.
#[derive(Default)]
pub struct InMemoryPersistence {
    states: RwLock<HashMap<AgentId, AgentState>>,
    sync_log: RwLock<Vec<SyncResult>>,
    message_log: RwLock<Vec<LayerMessage>>,
    failures_remaining: AtomicU32,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that already holds `states`, as if written by a previous run.
    pub fn with_states(states: impl IntoIterator<Item = AgentState>) -> Self {
        let map = states
            .into_iter()
            .map(|s| (s.agent_id.clone(), s))
            .collect();
        Self {
            states: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Make the next `n` writes fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn saved_state(&self, agent_id: &str) -> Option<AgentState> {
        self.states.read().await.get(agent_id).cloned()
    }

    pub async fn sync_log(&self) -> Vec<SyncResult> {
        self.sync_log.read().await.clone()
    }

    pub async fn message_log(&self) -> Vec<LayerMessage> {
        self.message_log.read().await.clone()
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(Error::persistence("injected write failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<()> {
        self.check_failure()?;
        self.states
            .write()
            .await
            .insert(state.agent_id.clone(), state.clone());
        Ok(())
    }

    async fn append_sync_log(&self, result: &SyncResult) -> Result<()> {
        self.check_failure()?;
        self.sync_log.write().await.push(result.clone());
        Ok(())
    }

    async fn append_message_log(&self, message: &LayerMessage) -> Result<()> {
        self.check_failure()?;
        self.message_log.write().await.push(message.clone());
        Ok(())
    }

    async fn load_agent_states(&self) -> Result<Vec<AgentState>> {
        Ok(self.states.read().await.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// JSON file backend
// ---------------------------------------------------------------------------

/// Directory layout:
///
/// ```text
/// <dir>/states/<agent>.json   latest snapshot per agent (atomic replace)
/// <dir>/sync_log.jsonl        one SyncResult per line
/// <dir>/message_log.jsonl     one LayerMessage per line
/// ```
pub struct JsonFilePersistence {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonFilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            append_lock: Mutex::new(()),
        }
    }

    fn states_dir(&self) -> PathBuf {
        self.dir.join("states")
    }

    fn state_path(&self, agent_id: &AgentId) -> PathBuf {
        let file: String = agent_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.states_dir().join(format!("{file}.json"))
    }

    async fn append_line(&self, name: &str, line: String) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for JsonFilePersistence {
    fn name(&self) -> &str {
        "json"
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<()> {
        tokio::fs::create_dir_all(self.states_dir()).await?;
        let path = self.state_path(&state.agent_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append_sync_log(&self, result: &SyncResult) -> Result<()> {
        self.append_line("sync_log.jsonl", serde_json::to_string(result)?)
            .await
    }

    async fn append_message_log(&self, message: &LayerMessage) -> Result<()> {
        self.append_line("message_log.jsonl", serde_json::to_string(message)?)
            .await
    }

    async fn load_agent_states(&self) -> Result<Vec<AgentState>> {
        let mut entries = match tokio::fs::read_dir(self.states_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<AgentState>(&content) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", path.display(), e),
            }
        }
        Ok(states)
    }
}

// ---------------------------------------------------------------------------
// Background writer
// ---------------------------------------------------------------------------

enum WriteOp {
    State(AgentState),
    SyncLog(SyncResult),
    MessageLog(LayerMessage),
    Flush(oneshot::Sender<()>),
}

impl WriteOp {
    fn describe(&self) -> String {
        match self {
            WriteOp::State(s) => format!("state {}@v{}", s.agent_id, s.version),
            WriteOp::SyncLog(r) => format!("sync log {}", r.request_id),
            WriteOp::MessageLog(m) => format!("message log {}", m.id),
            WriteOp::Flush(_) => "flush".to_string(),
        }
    }

    async fn run(&self, adapter: &dyn PersistenceAdapter) -> Result<()> {
        match self {
            WriteOp::State(s) => adapter.save_agent_state(s).await,
            WriteOp::SyncLog(r) => adapter.append_sync_log(r).await,
            WriteOp::MessageLog(m) => adapter.append_message_log(m).await,
            WriteOp::Flush(_) => Ok(()),
        }
    }
}

/// Fire-and-forget front for a [`PersistenceAdapter`].
///
/// Writes are applied in submission order by a single worker task.
#[derive(Clone)]
pub struct PersistenceWriter {
    adapter: Arc<dyn PersistenceAdapter>,
    tx: mpsc::Sender<WriteOp>,
    errors: Arc<AtomicU64>,
}

impl PersistenceWriter {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(adapter: Arc<dyn PersistenceAdapter>, config: &PersistenceConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let errors = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_worker(
            adapter.clone(),
            rx,
            errors.clone(),
            config.max_retries,
            config.retry_backoff(),
        ));
        info!("PersistenceWriter started (backend: {})", adapter.name());
        Self {
            adapter,
            tx,
            errors,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.adapter
    }

    pub fn save_state(&self, state: AgentState) {
        self.submit(WriteOp::State(state));
    }

    pub fn append_sync_log(&self, result: SyncResult) {
        self.submit(WriteOp::SyncLog(result));
    }

    pub fn append_message_log(&self, message: LayerMessage) {
        self.submit(WriteOp::MessageLog(message));
    }

    /// Wait until every write submitted before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Writes that were dropped or failed after all retries.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn submit(&self, op: WriteOp) {
        if let Err(e) = self.tx.try_send(op) {
            let op = match e {
                mpsc::error::TrySendError::Full(op) | mpsc::error::TrySendError::Closed(op) => op,
            };
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Persistence queue unavailable, dropping {}", op.describe());
        }
    }
}

async fn run_worker(
    adapter: Arc<dyn PersistenceAdapter>,
    mut rx: mpsc::Receiver<WriteOp>,
    errors: Arc<AtomicU64>,
    max_retries: u32,
    backoff: Duration,
) {
    while let Some(op) = rx.recv().await {
        if let WriteOp::Flush(done) = op {
            let _ = done.send(());
            continue;
        }
        let mut attempt = 0u32;
        loop {
            match op.run(adapter.as_ref()).await {
                Ok(()) => {
                    debug!("Persisted {}", op.describe());
                    break;
                }
                Err(e) if attempt < max_retries => {
                    let delay = backoff.saturating_mul(1u32 << attempt.min(16));
                    warn!(
                        "Persisting {} failed (attempt {}): {}, retrying in {:?}",
                        op.describe(),
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!("Giving up on {}: {}", op.describe(), e);
                    break;
                }
            }
        }
    }
    debug!("PersistenceWriter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiersync_core::{Layer, StateData, SyncRequest};

    fn config(max_retries: u32) -> PersistenceConfig {
        PersistenceConfig {
            max_retries,
            retry_backoff_ms: 1,
            ..PersistenceConfig::default()
        }
    }

    #[tokio::test]
    async fn writer_retries_transient_failures() {
        let backend = Arc::new(InMemoryPersistence::new());
        backend.fail_next(2);
        let writer = PersistenceWriter::spawn(backend.clone(), &config(3));
        writer.save_state(AgentState::new("echo", Layer::Productive, StateData::new()));
        writer.flush().await;
        assert!(backend.saved_state("echo").await.is_some());
        assert_eq!(writer.error_count(), 0);
    }

    #[tokio::test]
    async fn writer_counts_exhausted_retries() {
        let backend = Arc::new(InMemoryPersistence::new());
        backend.fail_next(2);
        let writer = PersistenceWriter::spawn(backend.clone(), &config(1));
        writer.append_sync_log(tiersync_core::SyncResult::started(&SyncRequest::full("a")));
        writer.flush().await;
        assert!(backend.sync_log().await.is_empty());
        assert_eq!(writer.error_count(), 1);
    }

    #[tokio::test]
    async fn json_backend_roundtrips_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFilePersistence::new(dir.path());
        let mut state = AgentState::new("data/miner", Layer::Productive, StateData::new());
        state.apply(&serde_json::json!({"rows": 12}).as_object().cloned().unwrap());
        backend.save_agent_state(&state).await.unwrap();

        assert!(dir.path().join("states/data_miner.json").exists());
        let loaded = backend.load_agent_states().await.unwrap();
        assert_eq!(loaded, vec![state]);
    }

    #[tokio::test]
    async fn json_backend_appends_sync_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFilePersistence::new(dir.path());
        for _ in 0..3 {
            let result = tiersync_core::SyncResult::started(&SyncRequest::full("a"));
            backend.append_sync_log(&result).await.unwrap();
        }
        let log = std::fs::read_to_string(dir.path().join("sync_log.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[tokio::test]
    async fn json_backend_missing_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFilePersistence::new(dir.path().join("fresh"));
        assert!(backend.load_agent_states().await.unwrap().is_empty());
    }
}
