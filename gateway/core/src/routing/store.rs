//! Shared Breaker State
//!
//! Optional mirroring of breaker phases between gateway instances.
//!
//! Local transitions are published to a [`BreakerStateStore`]; remote state is
//! pulled on an interval. A remote OPEN that is newer than the local breaker's
//! last transition forces the local breaker OPEN. A remote CLOSED never closes
//! a local breaker; each instance rediscovers recovery through its own probes.
//!
//! The store is best-effort. Every error is logged and skipped, and the
//! engine keeps serving from in-memory state.
//!
//! [`FileStateStore`] shares state between processes on one host through a
//! directory; [`InMemoryStateStore`] shares it between engines in one process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::breaker::{BreakerObserver, BreakerPhase, BreakerTransition, CircuitBreakerBank};

// ============================================================================
// Store Contract
// ============================================================================

/// Errors from a shared state store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Shared state store unavailable: {0}")]
    Unavailable(String),

    /// A stored entry could not be encoded or decoded
    #[error("Shared state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Reading or writing the store directory failed
    #[error("Shared state I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Breaker state as published by one instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBreakerState {
    pub phase: BreakerPhase,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Publishing instance
    pub instance_id: Uuid,
}

/// External store for breaker state
#[async_trait]
pub trait BreakerStateStore: Send + Sync {
    /// Publish one provider's state
    async fn publish(&self, provider: &str, state: SharedBreakerState) -> Result<(), StoreError>;

    /// Fetch every provider's latest state
    async fn fetch_all(&self) -> Result<HashMap<String, SharedBreakerState>, StoreError>;
}

// ============================================================================
// In-memory Store
// ============================================================================

/// Process-local store holding JSON-encoded entries
///
/// Share one instance between several engines to mirror state on one host.
/// Keeps the newest entry per provider by `updated_at`.
#[derive(Debug)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, String>>,
    available: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BreakerStateStore for InMemoryStateStore {
    async fn publish(&self, provider: &str, state: SharedBreakerState) -> Result<(), StoreError> {
        self.check_available()?;
        let encoded = serde_json::to_string(&state)?;

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(provider) {
            let existing: SharedBreakerState = serde_json::from_str(existing)?;
            if existing.updated_at > state.updated_at {
                return Ok(());
            }
        }
        entries.insert(provider.to_string(), encoded);
        Ok(())
    }

    async fn fetch_all(&self) -> Result<HashMap<String, SharedBreakerState>, StoreError> {
        self.check_available()?;
        self.entries
            .read()
            .iter()
            .map(|(provider, raw)| -> Result<(String, SharedBreakerState), StoreError> {
                Ok((provider.clone(), serde_json::from_str(raw)?))
            })
            .collect()
    }
}

// ============================================================================
// File Store
// ============================================================================

/// One file in a [`FileStateStore`] directory
#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    provider: String,
    #[serde(flatten)]
    state: SharedBreakerState,
}

/// Directory-backed store, one JSON file per provider
///
/// Files are written to a temporary name and renamed into place, so readers
/// never see a partial entry. Keeps the newest entry per provider by
/// `updated_at`; concurrent writers race last-rename-wins.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_stem(provider)))
    }

    async fn read_entry(path: &Path) -> Result<Option<FileEntry>, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Provider name as a file stem; bytes outside `[A-Za-z0-9_-]` become `%XX`
fn encode_file_stem(provider: &str) -> String {
    let mut stem = String::with_capacity(provider.len());
    for byte in provider.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl BreakerStateStore for FileStateStore {
    async fn publish(&self, provider: &str, state: SharedBreakerState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let path = self.entry_path(provider);
        if let Some(existing) = Self::read_entry(&path).await? {
            if existing.state.updated_at > state.updated_at {
                return Ok(());
            }
        }

        let encoded = serde_json::to_vec_pretty(&FileEntry {
            provider: provider.to_string(),
            state,
        })?;
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, encoded).await.map_err(io_error(&tmp))?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io { path, source });
        }
        Ok(())
    }

    async fn fetch_all(&self) -> Result<HashMap<String, SharedBreakerState>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // Nothing published yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut states = HashMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(file)) => {
                    states.insert(file.provider, file.state);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable shared state entry");
                }
            }
        }
        Ok(states)
    }
}

// ============================================================================
// Mirror
// ============================================================================

/// Forwards local transitions to the mirror task
struct TransitionForwarder {
    tx: mpsc::UnboundedSender<BreakerTransition>,
}

impl BreakerObserver for TransitionForwarder {
    fn on_transition(&self, transition: &BreakerTransition) {
        // Closed receiver means the mirror stopped; nothing to do
        let _ = self.tx.send(transition.clone());
    }
}

/// Keeps one bank in sync with a shared store
pub struct BreakerMirror {
    bank: Arc<CircuitBreakerBank>,
    store: Arc<dyn BreakerStateStore>,
    instance_id: Uuid,
    sync_interval: Duration,
}

impl BreakerMirror {
    pub fn new(
        bank: Arc<CircuitBreakerBank>,
        store: Arc<dyn BreakerStateStore>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            bank,
            store,
            instance_id: Uuid::new_v4(),
            sync_interval: sync_interval.max(Duration::from_millis(100)),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Publish one local transition; errors are logged
    pub async fn publish(&self, transition: &BreakerTransition) -> bool {
        let state = SharedBreakerState {
            phase: transition.to,
            opened_at: (transition.to == BreakerPhase::Open).then_some(transition.at),
            updated_at: transition.at,
            instance_id: self.instance_id,
        };

        match self.store.publish(&transition.provider, state).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    provider = %transition.provider,
                    error = %e,
                    "Failed to publish breaker state, continuing with local state"
                );
                false
            }
        }
    }

    /// Pull remote state and adopt newer OPEN phases; returns how many were adopted
    pub async fn pull(&self) -> usize {
        let remote = match self.store.fetch_all().await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch shared breaker state, continuing with local state");
                return 0;
            }
        };

        let mut adopted = 0;
        for (provider, state) in remote {
            if state.instance_id == self.instance_id || state.phase != BreakerPhase::Open {
                continue;
            }
            if let Some(opened_at) = state.opened_at {
                if self.bank.adopt_open(&provider, opened_at) {
                    adopted += 1;
                }
            }
        }
        adopted
    }

    /// Start mirroring in a background task until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bank.add_observer(Arc::new(TransitionForwarder { tx }));
        tokio::spawn(self.run(rx, shutdown))
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<BreakerTransition>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            instance = %self.instance_id,
            interval_ms = self.sync_interval.as_millis() as u64,
            "Breaker mirror started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(transition) = rx.recv() => {
                    self.publish(&transition).await;
                }
                _ = ticker.tick() => {
                    let adopted = self.pull().await;
                    if adopted > 0 {
                        tracing::info!(adopted, "Adopted open breakers from shared state");
                    }
                }
            }
        }

        tracing::info!(instance = %self.instance_id, "Breaker mirror stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::breaker::BreakerConfig;
    use crate::routing::clock::{Clock, ManualClock};

    fn bank() -> (Arc<ManualClock>, Arc<CircuitBreakerBank>) {
        let (clock, shared) = ManualClock::shared();
        (clock, Arc::new(CircuitBreakerBank::with_clock(BreakerConfig::default(), shared)))
    }

    fn open_transition(provider: &str, at: DateTime<Utc>) -> BreakerTransition {
        BreakerTransition {
            provider: provider.into(),
            from: BreakerPhase::Closed,
            to: BreakerPhase::Open,
            at,
        }
    }

    #[tokio::test]
    async fn test_remote_open_is_adopted() {
        let store: Arc<InMemoryStateStore> = Arc::new(InMemoryStateStore::new());
        let (clock_a, bank_a) = bank();
        let (_, bank_b) = bank();
        let mirror_a = BreakerMirror::new(bank_a, store.clone(), Duration::from_secs(1));
        let mirror_b = BreakerMirror::new(bank_b.clone(), store.clone(), Duration::from_secs(1));

        assert!(mirror_a.publish(&open_transition("openai", clock_a.wall())).await);
        assert_eq!(store.len(), 1);

        assert_eq!(mirror_b.pull().await, 1);
        assert_eq!(bank_b.phase("openai"), BreakerPhase::Open);
        assert!(!bank_b.allow("openai"));

        // Already open: nothing more to adopt
        assert_eq!(mirror_b.pull().await, 0);
    }

    #[tokio::test]
    async fn test_own_entries_ignored() {
        let store = Arc::new(InMemoryStateStore::new());
        let (clock, bank) = bank();
        let mirror = BreakerMirror::new(bank.clone(), store, Duration::from_secs(1));

        mirror.publish(&open_transition("openai", clock.wall())).await;
        assert_eq!(mirror.pull().await, 0);
        assert_eq!(bank.phase("openai"), BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn test_remote_closed_never_closes_local() {
        let store = Arc::new(InMemoryStateStore::new());
        let (_, remote_bank) = bank();
        let (clock, local_bank) = bank();
        for _ in 0..5 {
            local_bank.record_failure("openai");
        }
        let remote = BreakerMirror::new(remote_bank, store.clone(), Duration::from_secs(1));
        let local = BreakerMirror::new(local_bank.clone(), store, Duration::from_secs(1));

        remote
            .publish(&BreakerTransition {
                provider: "openai".into(),
                from: BreakerPhase::HalfOpen,
                to: BreakerPhase::Closed,
                at: clock.wall(),
            })
            .await;

        assert_eq!(local.pull().await, 0);
        assert_eq!(local_bank.phase("openai"), BreakerPhase::Open);
    }

    #[tokio::test]
    async fn test_store_outage_falls_back_to_local() {
        let store = Arc::new(InMemoryStateStore::new());
        store.set_available(false);
        let (clock, bank) = bank();
        let mirror = BreakerMirror::new(bank.clone(), store.clone(), Duration::from_secs(1));

        assert!(!mirror.publish(&open_transition("openai", clock.wall())).await);
        assert_eq!(mirror.pull().await, 0);
        assert!(bank.allow("openai"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_keeps_newest_entry() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();
        let older = now - chrono::Duration::seconds(10);
        let id = Uuid::new_v4();

        store
            .publish(
                "p",
                SharedBreakerState {
                    phase: BreakerPhase::Closed,
                    opened_at: None,
                    updated_at: now,
                    instance_id: id,
                },
            )
            .await
            .unwrap();
        store
            .publish(
                "p",
                SharedBreakerState {
                    phase: BreakerPhase::Open,
                    opened_at: Some(older),
                    updated_at: older,
                    instance_id: id,
                },
            )
            .await
            .unwrap();

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all["p"].phase, BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn test_spawned_mirror_publishes_transitions() {
        let store = Arc::new(InMemoryStateStore::new());
        let (_, bank) = bank();
        let shutdown = CancellationToken::new();
        let handle = BreakerMirror::new(bank.clone(), store.clone(), Duration::from_secs(60))
            .spawn(shutdown.clone());

        for _ in 0..5 {
            bank.record_failure("anthropic");
        }
        for _ in 0..100 {
            if !store.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all["anthropic"].phase, BreakerPhase::Open);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_remote_open_is_ignored() {
        let store = Arc::new(InMemoryStateStore::new());
        let (clock, bank) = bank();
        let mirror = BreakerMirror::new(bank.clone(), store.clone(), Duration::from_secs(1));
        let opened_at = clock.wall() - chrono::Duration::hours(2);

        store
            .publish(
                "openai",
                SharedBreakerState {
                    phase: BreakerPhase::Open,
                    opened_at: Some(opened_at),
                    updated_at: opened_at,
                    instance_id: Uuid::new_v4(),
                },
            )
            .await
            .unwrap();

        assert_eq!(mirror.pull().await, 0);
        assert_eq!(bank.phase("openai"), BreakerPhase::Closed);
        assert!(bank.allow("openai"));
    }

    #[tokio::test]
    async fn test_file_store_shares_state_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileStateStore::new(dir.path().join("state"));
        let reader = FileStateStore::new(dir.path().join("state"));
        assert!(reader.fetch_all().await.unwrap().is_empty());

        let now = Utc::now();
        let state = SharedBreakerState {
            phase: BreakerPhase::Open,
            opened_at: Some(now),
            updated_at: now,
            instance_id: Uuid::new_v4(),
        };
        writer.publish("azure/openai", state.clone()).await.unwrap();
        writer
            .publish(
                "azure/openai",
                SharedBreakerState {
                    phase: BreakerPhase::Closed,
                    opened_at: None,
                    updated_at: now - chrono::Duration::seconds(5),
                    instance_id: state.instance_id,
                },
            )
            .await
            .unwrap();

        let all = reader.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["azure/openai"], state);
        assert!(writer.dir().join("azure%2Fopenai.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_mirrors_across_banks() {
        let dir = tempfile::tempdir().unwrap();
        let (clock_a, bank_a) = bank();
        let (_, bank_b) = bank();
        let mirror_a = BreakerMirror::new(bank_a, Arc::new(FileStateStore::new(dir.path())), Duration::from_secs(1));
        let mirror_b =
            BreakerMirror::new(bank_b.clone(), Arc::new(FileStateStore::new(dir.path())), Duration::from_secs(1));

        assert!(mirror_a.publish(&open_transition("anthropic", clock_a.wall())).await);
        assert_eq!(mirror_b.pull().await, 1);
        assert_eq!(bank_b.phase("anthropic"), BreakerPhase::Open);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileStateStore::new(dir.path());
        assert!(store.fetch_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_file_stem_encoding() {
        assert_eq!(encode_file_stem("openai"), "openai");
        assert_eq!(encode_file_stem("local-llama_2"), "local-llama_2");
        assert_eq!(encode_file_stem("a.b/c"), "a%2Eb%2Fc");
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = InMemoryStateStore::new();
        store.set_available(false);
        let state = SharedBreakerState {
            phase: BreakerPhase::Open,
            opened_at: Some(Utc::now()),
            updated_at: Utc::now(),
            instance_id: Uuid::new_v4(),
        };

        let published = tokio_test::block_on(store.publish("openai", state));
        assert!(matches!(published, Err(StoreError::Unavailable(_))));
        assert!(tokio_test::block_on(store.fetch_all()).is_err());
        assert!(store.is_empty());
    }
}
