//! Per-client rate limiting of speculative work.
//!
//! Counters are keyed by [`ClientIdentity`], so every session opened by the
//! same client shares one budget. State lives in memory behind a single lock;
//! a dedicated `throttle-io` thread loads the persisted blob at startup and
//! writes every change back, so callers never wait on storage.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::metrics::THROTTLE_DECISIONS;
use crate::session::ClientIdentity;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerState {
    pub window_started_at_ms: u64,
    /// Attempts inside the current window. Only grows until the window rolls.
    pub attempts: u32,
    pub banned: bool,
    pub bad_streak: u32,
    pub successes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    FirstCall,
    Throttled,
    Banned,
}

impl ThrottleDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, ThrottleDecision::Allowed | ThrottleDecision::FirstCall)
    }

    fn as_str(self) -> &'static str {
        match self {
            ThrottleDecision::Allowed => "allowed",
            ThrottleDecision::FirstCall => "first_call",
            ThrottleDecision::Throttled => "throttled",
            ThrottleDecision::Banned => "banned",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottleSettings {
    pub capacity: u32,
    pub window: Duration,
    pub ban_after_bad_predictions: Option<u32>,
}

impl From<&ServiceConfig> for ThrottleSettings {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            capacity: cfg.throttle_capacity,
            window: cfg.throttle_window,
            ban_after_bad_predictions: cfg.ban_after_bad_predictions,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleStoreError {
    #[error("throttle store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("throttle store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persistence for throttling counters. Called only from the `throttle-io` thread.
pub trait ThrottleStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<(ClientIdentity, ThrottlerState)>, ThrottleStoreError>;
    fn persist(
        &self,
        identity: ClientIdentity,
        state: &ThrottlerState,
    ) -> Result<(), ThrottleStoreError>;
}

/// In-memory adapter for tests and early wiring.
#[derive(Debug, Default)]
pub struct InMemoryThrottleStore {
    states: Mutex<HashMap<ClientIdentity, ThrottlerState>>,
}

impl InMemoryThrottleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_states(states: impl IntoIterator<Item = (ClientIdentity, ThrottlerState)>) -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(states.into_iter().collect()),
        })
    }

    pub fn get(&self, identity: ClientIdentity) -> Option<ThrottlerState> {
        self.states.lock().get(&identity).cloned()
    }
}

impl ThrottleStore for InMemoryThrottleStore {
    fn load_all(&self) -> Result<Vec<(ClientIdentity, ThrottlerState)>, ThrottleStoreError> {
        Ok(self
            .states
            .lock()
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect())
    }

    fn persist(
        &self,
        identity: ClientIdentity,
        state: &ThrottlerState,
    ) -> Result<(), ThrottleStoreError> {
        self.states.lock().insert(identity, state.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    identity: ClientIdentity,
    state: ThrottlerState,
}

/// Stores every identity's counters in one JSON file, rewritten atomically.
#[derive(Debug)]
pub struct JsonFileThrottleStore {
    path: PathBuf,
    cache: Mutex<HashMap<ClientIdentity, ThrottlerState>>,
}

impl JsonFileThrottleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<HashMap<ClientIdentity, ThrottlerState>, ThrottleStoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };
        let entries: Vec<PersistedEntry> = serde_json::from_slice(&bytes)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.identity, entry.state))
            .collect())
    }

    fn write_file(
        &self,
        states: &HashMap<ClientIdentity, ThrottlerState>,
    ) -> Result<(), ThrottleStoreError> {
        let mut entries: Vec<PersistedEntry> = states
            .iter()
            .map(|(identity, state)| PersistedEntry {
                identity: *identity,
                state: state.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.identity);
        let encoded = serde_json::to_vec_pretty(&entries)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ThrottleStore for JsonFileThrottleStore {
    fn load_all(&self) -> Result<Vec<(ClientIdentity, ThrottlerState)>, ThrottleStoreError> {
        let states = self.read_file()?;
        let mut cache = self.cache.lock();
        *cache = states;
        Ok(cache.iter().map(|(id, s)| (*id, s.clone())).collect())
    }

    fn persist(
        &self,
        identity: ClientIdentity,
        state: &ThrottlerState,
    ) -> Result<(), ThrottleStoreError> {
        let mut cache = self.cache.lock();
        cache.insert(identity, state.clone());
        self.write_file(&cache)
    }
}

enum IoCommand {
    Persist(ClientIdentity, ThrottlerState),
    Flush(Sender<()>),
    Shutdown,
}

struct Shared {
    states: Mutex<HashMap<ClientIdentity, ThrottlerState>>,
    loaded: Mutex<bool>,
    loaded_cv: Condvar,
}

#[derive(Clone)]
pub struct Throttler {
    inner: Arc<ThrottlerInner>,
}

struct ThrottlerInner {
    shared: Arc<Shared>,
    settings: ThrottleSettings,
    clock: Arc<dyn Clock>,
    io_tx: Sender<IoCommand>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Throttler {
    /// Creates the throttler and starts loading persisted state in the background.
    pub fn start(
        store: Arc<dyn ThrottleStore>,
        settings: ThrottleSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new(Shared {
            states: Mutex::new(HashMap::new()),
            loaded: Mutex::new(false),
            loaded_cv: Condvar::new(),
        });
        let (io_tx, io_rx) = unbounded();
        let thread_shared = Arc::clone(&shared);
        let io_thread = std::thread::Builder::new()
            .name("throttle-io".into())
            .spawn(move || run_io(store, thread_shared, io_rx));
        let io_thread = match io_thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to spawn throttle-io thread; counters stay in memory");
                mark_loaded(&shared);
                None
            }
        };
        Self {
            inner: Arc::new(ThrottlerInner {
                shared,
                settings,
                clock,
                io_tx,
                io_thread: Mutex::new(io_thread),
            }),
        }
    }

    pub fn decide(&self, identity: ClientIdentity, first_low_confidence: bool) -> ThrottleDecision {
        let now = self.inner.clock.now_millis();
        let window_ms = self.inner.settings.window.as_millis() as u64;
        let mut states = self.inner.shared.states.lock();
        let state = states.entry(identity).or_default();

        let decision = if state.banned {
            ThrottleDecision::Banned
        } else if first_low_confidence {
            ThrottleDecision::FirstCall
        } else {
            if state.attempts == 0 || now.saturating_sub(state.window_started_at_ms) >= window_ms {
                state.window_started_at_ms = now;
                state.attempts = 0;
            }
            if state.attempts >= self.inner.settings.capacity {
                ThrottleDecision::Throttled
            } else {
                state.attempts += 1;
                ThrottleDecision::Allowed
            }
        };

        if decision == ThrottleDecision::Allowed {
            self.persist(identity, state.clone());
        }
        drop(states);

        THROTTLE_DECISIONS.with_label_values(&[decision.as_str()]).inc();
        debug!(%identity, decision = decision.as_str(), "throttle decision");
        decision
    }

    pub fn allow(&self, identity: ClientIdentity, first_low_confidence: bool) -> bool {
        self.decide(identity, first_low_confidence).is_allowed()
    }

    pub fn record_outcome(&self, identity: ClientIdentity, success: bool) {
        let mut states = self.inner.shared.states.lock();
        let state = states.entry(identity).or_default();
        if success {
            state.successes += 1;
            state.bad_streak = 0;
        } else {
            state.bad_streak += 1;
            if let Some(limit) = self.inner.settings.ban_after_bad_predictions {
                if state.bad_streak >= limit && !state.banned {
                    warn!(%identity, bad_streak = state.bad_streak, "banning client after repeated bad predictions");
                    state.banned = true;
                }
            }
        }
        let snapshot = state.clone();
        drop(states);
        self.persist(identity, snapshot);
    }

    pub fn reset(&self, identity: ClientIdentity) {
        let fresh = ThrottlerState::default();
        self.inner
            .shared
            .states
            .lock()
            .insert(identity, fresh.clone());
        self.persist(identity, fresh);
    }

    pub fn ban(&self, identity: ClientIdentity) {
        let mut states = self.inner.shared.states.lock();
        let state = states.entry(identity).or_default();
        state.banned = true;
        let snapshot = state.clone();
        drop(states);
        self.persist(identity, snapshot);
    }

    pub fn state(&self, identity: ClientIdentity) -> Option<ThrottlerState> {
        self.inner.shared.states.lock().get(&identity).cloned()
    }

    pub fn is_loaded(&self) -> bool {
        *self.inner.shared.loaded.lock()
    }

    pub fn wait_until_loaded(&self, timeout: Duration) -> bool {
        let mut loaded = self.inner.shared.loaded.lock();
        if !*loaded {
            self.inner
                .shared
                .loaded_cv
                .wait_while_for(&mut loaded, |loaded| !*loaded, timeout);
        }
        *loaded
    }

    /// Blocks until every write queued so far has reached the store.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.inner.io_tx.send(IoCommand::Flush(tx)).is_err() {
            return false;
        }
        rx.recv_timeout(timeout).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.inner.io_tx.send(IoCommand::Shutdown);
        if let Some(handle) = self.inner.io_thread.lock().take() {
            if handle.join().is_err() {
                warn!("throttle-io thread panicked during shutdown");
            }
        }
    }

    fn persist(&self, identity: ClientIdentity, state: ThrottlerState) {
        if self
            .inner
            .io_tx
            .send(IoCommand::Persist(identity, state))
            .is_err()
        {
            debug!(%identity, "throttle-io stopped; state kept in memory only");
        }
    }
}

impl Drop for ThrottlerInner {
    fn drop(&mut self) {
        let _ = self.io_tx.send(IoCommand::Shutdown);
    }
}

fn mark_loaded(shared: &Shared) {
    *shared.loaded.lock() = true;
    shared.loaded_cv.notify_all();
}

fn run_io(store: Arc<dyn ThrottleStore>, shared: Arc<Shared>, rx: Receiver<IoCommand>) {
    match store.load_all() {
        Ok(entries) => {
            let count = entries.len();
            let mut states = shared.states.lock();
            for (identity, state) in entries {
                states.entry(identity).or_insert(state);
            }
            drop(states);
            debug!(count, "loaded persisted throttle state");
        }
        Err(err) => warn!(error = %err, "failed to load throttle state; starting empty"),
    }
    mark_loaded(&shared);

    for command in rx {
        match command {
            IoCommand::Persist(identity, state) => {
                if let Err(err) = store.persist(identity, &state) {
                    warn!(%identity, error = %err, "failed to persist throttle state");
                }
            }
            IoCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            IoCommand::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WAIT: Duration = Duration::from_secs(5);

    fn throttler(capacity: u32, ban_after: Option<u32>) -> (Throttler, ManualClock, Arc<InMemoryThrottleStore>) {
        let clock = ManualClock::new(1_000);
        let store = InMemoryThrottleStore::new();
        let throttler = Throttler::start(
            store.clone(),
            ThrottleSettings {
                capacity,
                window: Duration::from_secs(10),
                ban_after_bad_predictions: ban_after,
            },
            Arc::new(clock.clone()),
        );
        assert!(throttler.wait_until_loaded(WAIT));
        (throttler, clock, store)
    }

    #[test_timeout::timeout]
    fn capacity_is_enforced_until_the_window_rolls() {
        let (throttler, clock, _) = throttler(2, None);
        let uid = ClientIdentity(10_001);
        assert!(throttler.allow(uid, false));
        assert!(throttler.allow(uid, false));
        assert_eq!(throttler.decide(uid, false), ThrottleDecision::Throttled);

        clock.advance(Duration::from_secs(9));
        assert!(!throttler.allow(uid, false));

        clock.advance(Duration::from_secs(1));
        assert!(throttler.allow(uid, false));
        assert_eq!(throttler.state(uid).map(|s| s.attempts), Some(1));
    }

    #[test_timeout::timeout]
    fn first_low_confidence_call_skips_the_counter() {
        let (throttler, _, _) = throttler(1, None);
        let uid = ClientIdentity(10_002);
        assert!(throttler.allow(uid, false));
        assert_eq!(throttler.decide(uid, true), ThrottleDecision::FirstCall);
        assert_eq!(throttler.decide(uid, false), ThrottleDecision::Throttled);
    }

    #[test_timeout::timeout]
    fn ban_is_sticky_until_reset() {
        let (throttler, clock, _) = throttler(5, None);
        let uid = ClientIdentity(10_003);
        throttler.ban(uid);
        assert_eq!(throttler.decide(uid, true), ThrottleDecision::Banned);
        clock.advance(Duration::from_secs(3_600));
        assert!(!throttler.allow(uid, false));
        throttler.reset(uid);
        assert!(throttler.allow(uid, false));
    }

    #[test_timeout::timeout]
    fn repeated_bad_predictions_ban_when_configured() {
        let (throttler, _, _) = throttler(5, Some(2));
        let uid = ClientIdentity(10_004);
        throttler.record_outcome(uid, false);
        throttler.record_outcome(uid, true);
        throttler.record_outcome(uid, false);
        assert!(throttler.allow(uid, false));
        throttler.record_outcome(uid, false);
        assert!(!throttler.allow(uid, false));
        assert_eq!(throttler.state(uid).map(|s| s.successes), Some(1));
    }

    #[test_timeout::timeout]
    fn changes_reach_the_store_in_the_background() {
        let (throttler, _, store) = throttler(5, None);
        let uid = ClientIdentity(10_005);
        throttler.allow(uid, false);
        throttler.ban(uid);
        assert!(throttler.flush(WAIT));
        let persisted = store.get(uid).expect("persisted state");
        assert!(persisted.banned);
        assert_eq!(persisted.attempts, 1);
    }

    #[test_timeout::timeout]
    fn persisted_ban_is_restored_on_start() {
        let uid = ClientIdentity(10_006);
        let store = InMemoryThrottleStore::with_states([(
            uid,
            ThrottlerState {
                banned: true,
                ..ThrottlerState::default()
            },
        )]);
        let throttler = Throttler::start(
            store,
            ThrottleSettings {
                capacity: 3,
                window: Duration::from_secs(10),
                ban_after_bad_predictions: None,
            },
            Arc::new(ManualClock::new(5)),
        );
        assert!(throttler.wait_until_loaded(WAIT));
        assert!(!throttler.allow(uid, false));
        throttler.shutdown();
    }

    #[test_timeout::timeout]
    fn json_file_store_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("throttle").join("state.json");
        let uid = ClientIdentity(10_007);
        let settings = ThrottleSettings {
            capacity: 1,
            window: Duration::from_secs(60),
            ban_after_bad_predictions: None,
        };
        let clock = Arc::new(ManualClock::new(100));

        let first = Throttler::start(
            Arc::new(JsonFileThrottleStore::new(&path)),
            settings,
            clock.clone(),
        );
        assert!(first.wait_until_loaded(WAIT));
        assert!(first.allow(uid, false));
        assert!(first.flush(WAIT));
        first.shutdown();

        let second = Throttler::start(
            Arc::new(JsonFileThrottleStore::new(&path)),
            settings,
            clock,
        );
        assert!(second.wait_until_loaded(WAIT));
        assert!(!second.allow(uid, false));
        second.shutdown();
    }
}
