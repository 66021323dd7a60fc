//! Session registry: one record per client connection.
//!
//! The map sits behind a single lock that is independent of the owner thread,
//! so accessors answer on the calling thread. Only origin verification hops
//! onto the owner thread. Collaborator calls and client callbacks always run
//! with the lock released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::callback::deliver;
use crate::clock::Clock;
use crate::collab::{
    IdentityResolver, KeepAliveConnection, KeepAliveConnector, KeepAliveTarget, OriginVerifier,
    Relation, SessionCallback, VerifyCallback, VerifyError,
};
use crate::metrics::{ACTIVE_SESSIONS, PREDICTION_OUTCOMES, VERIFICATION_RESULTS};
use crate::origin::{urls_match, Origin};
use crate::owner::Executor;
use crate::session::{
    CallerInfo, ClientIdentity, PackageIdentity, PredictionOutcome, SessionHandle, SessionPolicy,
    WarmupState,
};
use crate::throttle::Throttler;

/// Fired once per disconnect, with the registry lock released.
pub type DisconnectHook = Arc<dyn Fn(SessionHandle) + Send + Sync>;

enum KeepAliveSlot {
    Unbound,
    /// A bind call is in flight; a death notice seen now marks the slot dead.
    Binding,
    Bound(Box<dyn KeepAliveConnection>),
    /// The remote process died while bound. Never rebound.
    Dead,
}

struct SessionRecord {
    uid: ClientIdentity,
    package: Option<PackageIdentity>,
    callback: Option<Arc<dyn SessionCallback>>,
    verified_origins: Vec<Origin>,
    verification_ticket: Option<u64>,
    last_predicted_url: Option<String>,
    last_prediction_at_ms: Option<u64>,
    low_confidence: bool,
    high_confidence: bool,
    first_may_launch_call: bool,
    policy: SessionPolicy,
    keep_alive: KeepAliveSlot,
    foreground: bool,
    disconnect_logged: bool,
    on_disconnect: Option<DisconnectHook>,
}

impl SessionRecord {
    fn new(
        uid: ClientIdentity,
        package: Option<PackageIdentity>,
        callback: Arc<dyn SessionCallback>,
        on_disconnect: Option<DisconnectHook>,
    ) -> Self {
        Self {
            uid,
            package,
            callback: Some(callback),
            verified_origins: Vec::new(),
            verification_ticket: None,
            last_predicted_url: None,
            last_prediction_at_ms: None,
            low_confidence: false,
            high_confidence: false,
            first_may_launch_call: true,
            policy: SessionPolicy::default(),
            keep_alive: KeepAliveSlot::Unbound,
            foreground: false,
            disconnect_logged: false,
            on_disconnect,
        }
    }

    fn clear_prediction(&mut self) {
        self.last_predicted_url = None;
        self.last_prediction_at_ms = None;
        self.low_confidence = false;
        self.high_confidence = false;
    }

    /// Marks the disconnect as logged and returns the hook if it has not fired yet.
    fn take_disconnect(&mut self) -> Option<DisconnectHook> {
        if self.disconnect_logged {
            return None;
        }
        self.disconnect_logged = true;
        self.on_disconnect.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionSnapshot {
    pub url: Option<String>,
    pub at_ms: u64,
    pub low_confidence: bool,
    pub high_confidence: bool,
}

/// Collaborators the registry needs, bundled for construction.
pub struct RegistryParts {
    pub throttler: Throttler,
    pub identities: Arc<dyn IdentityResolver>,
    pub verifier: Arc<dyn OriginVerifier>,
    pub keep_alive: Arc<dyn KeepAliveConnector>,
    pub executor: Arc<dyn Executor>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct WarmupLog {
    any: bool,
    uids: HashSet<ClientIdentity>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<SessionHandle, SessionRecord>>,
    warmups: Mutex<WarmupLog>,
    next_ticket: AtomicU64,
    throttler: Throttler,
    identities: Arc<dyn IdentityResolver>,
    verifier: Arc<dyn OriginVerifier>,
    keep_alive: Arc<dyn KeepAliveConnector>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientRegistry {
    pub fn new(parts: RegistryParts) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                warmups: Mutex::new(WarmupLog::default()),
                next_ticket: AtomicU64::new(1),
                throttler: parts.throttler,
                identities: parts.identities,
                verifier: parts.verifier,
                keep_alive: parts.keep_alive,
                executor: parts.executor,
                clock: parts.clock,
            }),
        }
    }

    pub fn throttler(&self) -> &Throttler {
        &self.inner.throttler
    }

    pub fn register(
        &self,
        handle: SessionHandle,
        caller: CallerInfo,
        sink: Option<Arc<dyn SessionCallback>>,
        on_disconnect: Option<DisconnectHook>,
    ) -> bool {
        if handle.is_nil() {
            return false;
        }
        let Some(sink) = sink else {
            return false;
        };

        // Resolution runs without the lock; the record may appear or vanish
        // meanwhile, so the map is re-examined after every lookup.
        let mut resolved: Option<Option<PackageIdentity>> = None;
        loop {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(&handle) {
                Some(record) if record.uid != caller.uid => {
                    warn!(session = %handle, uid = %record.uid, caller = %caller.uid, "session handle reused by another uid");
                    return false;
                }
                Some(record) => {
                    record.callback = Some(sink);
                    record.disconnect_logged = false;
                    if on_disconnect.is_some() {
                        record.on_disconnect = on_disconnect;
                    }
                    debug!(session = %handle, "session re-registered");
                }
                None => {
                    let Some(package) = resolved.take() else {
                        drop(sessions);
                        resolved = Some(self.inner.identities.resolve_identity(caller.uid));
                        continue;
                    };
                    if package.is_none() {
                        debug!(session = %handle, uid = %caller.uid, "no unique package for uid");
                    }
                    sessions.insert(
                        handle,
                        SessionRecord::new(caller.uid, package, sink, on_disconnect),
                    );
                    info!(session = %handle, uid = %caller.uid, "session registered");
                }
            }
            ACTIVE_SESSIONS.set(sessions.len() as i64);
            return true;
        }
    }

    /// Decides whether a launch hint may proceed and records it as the
    /// session's current prediction.
    pub fn update_prediction(
        &self,
        handle: SessionHandle,
        uid: ClientIdentity,
        url: Option<&str>,
        low_confidence: bool,
    ) -> bool {
        let url = url.filter(|u| !u.is_empty());
        let first_low_confidence = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return false;
            };
            if record.uid != uid {
                warn!(session = %handle, %uid, "prediction from a uid that does not own the session");
                return false;
            }
            let first = record.first_may_launch_call && low_confidence && url.is_none();
            record.first_may_launch_call = false;
            first
        };

        if !self.inner.throttler.allow(uid, first_low_confidence) {
            return false;
        }

        let now = self.inner.clock.now_millis();
        let mut sessions = self.inner.sessions.lock();
        let Some(record) = sessions.get_mut(&handle) else {
            return false;
        };
        record.last_predicted_url = url.map(str::to_string);
        record.last_prediction_at_ms = Some(now);
        record.low_confidence = low_confidence;
        record.high_confidence = !low_confidence;
        true
    }

    /// Classifies a real launch against the last prediction, then forgets the prediction.
    pub fn record_launch(&self, handle: SessionHandle, url: &str) -> PredictionOutcome {
        let (outcome, uid) = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return PredictionOutcome::None;
            };
            let outcome = match record.last_predicted_url.as_deref() {
                None => PredictionOutcome::None,
                Some(predicted) if urls_match(predicted, url, record.policy.ignore_fragments) => {
                    PredictionOutcome::Good
                }
                Some(_) => PredictionOutcome::Bad,
            };
            record.clear_prediction();
            (outcome, record.uid)
        };

        match outcome {
            PredictionOutcome::Good => self.inner.throttler.record_outcome(uid, true),
            PredictionOutcome::Bad => self.inner.throttler.record_outcome(uid, false),
            PredictionOutcome::None => {}
        }
        PREDICTION_OUTCOMES
            .with_label_values(&[outcome.as_str()])
            .inc();
        debug!(session = %handle, url, outcome = outcome.as_str(), "launch recorded");
        outcome
    }

    /// Starts verifying `origin` for the session. The result arrives through the
    /// session's callback; the return value only says whether work was started.
    pub fn verify_relationship(
        &self,
        handle: SessionHandle,
        relation: Relation,
        origin: Origin,
        use_cached: bool,
    ) -> bool {
        let (package, ticket, cached_sink) = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return false;
            };
            let Some(package) = record.package.clone() else {
                debug!(session = %handle, "cannot verify without a package identity");
                return false;
            };
            if use_cached && record.verified_origins.contains(&origin) {
                (package, None, record.callback.clone())
            } else {
                let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
                record.verification_ticket = Some(ticket);
                (package, Some(ticket), None)
            }
        };

        let Some(ticket) = ticket else {
            VERIFICATION_RESULTS.with_label_values(&["cached"]).inc();
            if let Some(sink) = cached_sink {
                deliver("relationship_validation", || {
                    sink.on_relationship_validation_result(relation, &origin, true)
                });
            }
            return true;
        };

        let registry = self.clone();
        let verifier = Arc::clone(&self.inner.verifier);
        let posted = self.inner.executor.execute(Box::new(move || {
            let once = OnceResult::new({
                let registry = registry.clone();
                let origin = origin.clone();
                move |result| registry.finish_verification(handle, ticket, relation, origin, result)
            });
            let relay = once.clone();
            let callback: VerifyCallback = Box::new(move |result| relay.fire(result));
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                verifier.verify_origin(&package, &origin, relation, callback)
            }));
            if outcome.is_err() {
                warn!(session = %handle, "origin verifier panicked");
                once.fire(Err(VerifyError::Unavailable("verifier panicked".into())));
            }
        }));

        if !posted {
            let mut sessions = self.inner.sessions.lock();
            if let Some(record) = sessions.get_mut(&handle) {
                if record.verification_ticket == Some(ticket) {
                    record.verification_ticket = None;
                }
            }
            return false;
        }
        true
    }

    fn finish_verification(
        &self,
        handle: SessionHandle,
        ticket: u64,
        relation: Relation,
        origin: Origin,
        result: Result<(), VerifyError>,
    ) {
        let sink = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return;
            };
            if record.verification_ticket != Some(ticket) {
                debug!(session = %handle, ticket, "dropping superseded verification result");
                VERIFICATION_RESULTS.with_label_values(&["stale"]).inc();
                return;
            }
            record.verification_ticket = None;
            if result.is_ok() && !record.verified_origins.contains(&origin) {
                record.verified_origins.push(origin.clone());
            }
            record.callback.clone()
        };

        let ok = result.is_ok();
        match &result {
            Ok(()) => info!(session = %handle, %origin, relation = relation.as_str(), "origin verified"),
            Err(err) => info!(session = %handle, %origin, error = %err, "origin not verified"),
        }
        VERIFICATION_RESULTS
            .with_label_values(&[if ok { "verified" } else { "rejected" }])
            .inc();
        if let Some(sink) = sink {
            deliver("relationship_validation", || {
                sink.on_relationship_validation_result(relation, &origin, ok)
            });
        }
    }

    pub fn is_first_party_origin(&self, handle: SessionHandle, origin: &Origin) -> bool {
        self.inner
            .sessions
            .lock()
            .get(&handle)
            .is_some_and(|record| record.verified_origins.contains(origin))
    }

    /// Removes the session. Returns false when it was not registered.
    pub fn evict(&self, handle: SessionHandle) -> bool {
        let removed = {
            let mut sessions = self.inner.sessions.lock();
            let removed = sessions.remove(&handle);
            ACTIVE_SESSIONS.set(sessions.len() as i64);
            removed
        };
        let Some(mut record) = removed else {
            return false;
        };
        if let KeepAliveSlot::Bound(connection) =
            std::mem::replace(&mut record.keep_alive, KeepAliveSlot::Unbound)
        {
            connection.release();
        }
        if let Some(hook) = record.take_disconnect() {
            hook(handle);
        }
        info!(session = %handle, "session evicted");
        true
    }

    /// Lazy disconnect: drops the client sink but keeps the record until a
    /// memory sweep or an explicit eviction.
    pub fn release(&self, handle: SessionHandle) -> bool {
        let hook = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return false;
            };
            record.callback = None;
            record.take_disconnect()
        };
        if let Some(hook) = hook {
            hook(handle);
        }
        debug!(session = %handle, "session released");
        true
    }

    /// Evicts every session whose client sink is gone.
    pub fn evict_unused(&self) -> Vec<SessionHandle> {
        let unused: Vec<SessionHandle> = self
            .inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, record)| record.callback.is_none())
            .map(|(handle, _)| *handle)
            .collect();
        unused
            .into_iter()
            .filter(|handle| self.evict(*handle))
            .collect()
    }

    pub fn bind_keep_alive(&self, handle: SessionHandle, target: &KeepAliveTarget) -> bool {
        let package = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return false;
            };
            let Some(package) = record.package.clone() else {
                return false;
            };
            if package.as_str() != target.package {
                warn!(session = %handle, target = %target.package, "keep-alive target is not the session's package");
                return false;
            }
            match record.keep_alive {
                KeepAliveSlot::Dead | KeepAliveSlot::Binding => return false,
                KeepAliveSlot::Bound(_) => return true,
                KeepAliveSlot::Unbound => {}
            }
            record.keep_alive = KeepAliveSlot::Binding;
            package
        };

        let weak = Arc::downgrade(&self.inner);
        let on_death = Box::new(move || on_keep_alive_death(weak, handle));
        let bound = self.inner.keep_alive.bind(&package, target, on_death);

        let mut sessions = self.inner.sessions.lock();
        let record = sessions.get_mut(&handle);
        let connection = match bound {
            Ok(connection) => connection,
            Err(err) => {
                if let Some(record) = record {
                    if matches!(record.keep_alive, KeepAliveSlot::Binding) {
                        record.keep_alive = KeepAliveSlot::Unbound;
                    }
                }
                drop(sessions);
                warn!(session = %handle, error = %err, "keep-alive bind failed");
                return false;
            }
        };
        match record {
            Some(record) if matches!(record.keep_alive, KeepAliveSlot::Binding) => {
                record.keep_alive = KeepAliveSlot::Bound(connection);
                debug!(session = %handle, "keep-alive bound");
                true
            }
            _ => {
                drop(sessions);
                debug!(session = %handle, "keep-alive target died or session left during bind");
                connection.release();
                false
            }
        }
    }

    pub fn unbind_keep_alive(&self, handle: SessionHandle) -> bool {
        let connection = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.get_mut(&handle) else {
                return false;
            };
            match std::mem::replace(&mut record.keep_alive, KeepAliveSlot::Unbound) {
                KeepAliveSlot::Bound(connection) => connection,
                KeepAliveSlot::Dead => {
                    record.keep_alive = KeepAliveSlot::Dead;
                    return false;
                }
                KeepAliveSlot::Binding => {
                    record.keep_alive = KeepAliveSlot::Binding;
                    return false;
                }
                KeepAliveSlot::Unbound => return false,
            }
        };
        connection.release();
        true
    }

    pub fn is_keep_alive_dead(&self, handle: SessionHandle) -> bool {
        self.inner
            .sessions
            .lock()
            .get(&handle)
            .is_some_and(|record| matches!(record.keep_alive, KeepAliveSlot::Dead))
    }

    pub fn is_registered(&self, handle: SessionHandle) -> bool {
        self.inner.sessions.lock().contains_key(&handle)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn uid_of(&self, handle: SessionHandle) -> Option<ClientIdentity> {
        self.inner.sessions.lock().get(&handle).map(|r| r.uid)
    }

    pub fn package_name(&self, handle: SessionHandle) -> Option<PackageIdentity> {
        self.inner
            .sessions
            .lock()
            .get(&handle)
            .and_then(|r| r.package.clone())
    }

    pub fn callback(&self, handle: SessionHandle) -> Option<Arc<dyn SessionCallback>> {
        self.inner
            .sessions
            .lock()
            .get(&handle)
            .and_then(|r| r.callback.clone())
    }

    pub fn policy(&self, handle: SessionHandle) -> Option<SessionPolicy> {
        self.inner.sessions.lock().get(&handle).map(|r| r.policy)
    }

    pub fn set_policy(&self, handle: SessionHandle, policy: SessionPolicy) -> bool {
        match self.inner.sessions.lock().get_mut(&handle) {
            Some(record) => {
                record.policy = policy;
                true
            }
            None => false,
        }
    }

    pub fn set_foreground(&self, handle: SessionHandle, foreground: bool) -> bool {
        match self.inner.sessions.lock().get_mut(&handle) {
            Some(record) => {
                record.foreground = foreground;
                true
            }
            None => false,
        }
    }

    pub fn is_foreground(&self, handle: SessionHandle) -> bool {
        self.inner
            .sessions
            .lock()
            .get(&handle)
            .is_some_and(|r| r.foreground)
    }

    pub fn sessions_for_uid(&self, uid: ClientIdentity) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, record)| record.uid == uid)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn record_warmup(&self, uid: ClientIdentity) {
        let mut warmups = self.inner.warmups.lock();
        warmups.any = true;
        warmups.uids.insert(uid);
    }

    pub fn warmup_state(&self, handle: Option<SessionHandle>) -> WarmupState {
        let uid = handle.and_then(|h| self.uid_of(h));
        let warmups = self.inner.warmups.lock();
        match uid {
            None if warmups.any => WarmupState::NoSessionWarmup,
            None => WarmupState::NoSessionNoWarmup,
            Some(uid) if warmups.uids.contains(&uid) => WarmupState::SessionWarmup,
            Some(_) if warmups.any => WarmupState::SessionNoWarmupAlreadyCalled,
            Some(_) => WarmupState::SessionNoWarmupNotCalled,
        }
    }

    /// Last prediction stored for the session, if any.
    pub fn last_prediction(&self, handle: SessionHandle) -> Option<PredictionSnapshot> {
        let sessions = self.inner.sessions.lock();
        let record = sessions.get(&handle)?;
        let at_ms = record.last_prediction_at_ms?;
        Some(PredictionSnapshot {
            url: record.last_predicted_url.clone(),
            at_ms,
            low_confidence: record.low_confidence,
            high_confidence: record.high_confidence,
        })
    }
}

fn on_keep_alive_death(registry: Weak<RegistryInner>, handle: SessionHandle) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let previous = {
        let mut sessions = inner.sessions.lock();
        match sessions.get_mut(&handle) {
            Some(record)
                if matches!(
                    record.keep_alive,
                    KeepAliveSlot::Binding | KeepAliveSlot::Bound(_)
                ) =>
            {
                Some(std::mem::replace(&mut record.keep_alive, KeepAliveSlot::Dead))
            }
            _ => None,
        }
    };
    let Some(previous) = previous else {
        return;
    };
    warn!(session = %handle, "keep-alive target died; binding disabled");
    if let KeepAliveSlot::Bound(connection) = previous {
        connection.release();
    }
}

/// Verification result that can be reported at most once, by the verifier or
/// by the panic fallback, whichever comes first.
struct OnceResult {
    deliver: Mutex<Option<Box<dyn FnOnce(Result<(), VerifyError>) + Send>>>,
}

impl OnceResult {
    fn new(f: impl FnOnce(Result<(), VerifyError>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            deliver: Mutex::new(Some(Box::new(f))),
        })
    }

    fn fire(&self, result: Result<(), VerifyError>) {
        let f = self.deliver.lock().take();
        if let Some(f) = f {
            f(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::memory::{
        CallbackEvent, FakeKeepAlive, InMemoryThrottleStore, RecordingCallback, ScriptedVerifier,
        StaticIdentities,
    };
    use crate::throttle::ThrottleSettings;

    /// Runs tasks inline on the calling thread.
    struct InlineExecutor;

    impl Executor for InlineExecutor {
        fn execute(&self, task: Box<dyn FnOnce() + Send>) -> bool {
            task();
            true
        }
    }

    struct Fixture {
        registry: ClientRegistry,
        verifier: Arc<ScriptedVerifier>,
        keep_alive: Arc<FakeKeepAlive>,
    }

    fn fixture_with(verifier: Arc<ScriptedVerifier>, capacity: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let throttler = Throttler::start(
            InMemoryThrottleStore::new(),
            ThrottleSettings {
                capacity,
                window: Duration::from_secs(60),
                ban_after_bad_predictions: None,
            },
            clock.clone(),
        );
        let keep_alive = FakeKeepAlive::new();
        let registry = ClientRegistry::new(RegistryParts {
            throttler,
            identities: StaticIdentities::with([(10_001, "com.example.app"), (10_002, "org.other")]),
            verifier: verifier.clone(),
            keep_alive: keep_alive.clone(),
            executor: Arc::new(InlineExecutor),
            clock,
        });
        Fixture {
            registry,
            verifier,
            keep_alive,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedVerifier::new(), 10)
    }

    fn register(registry: &ClientRegistry, uid: u32) -> (SessionHandle, Arc<RecordingCallback>) {
        let handle = SessionHandle::new();
        let sink = RecordingCallback::new();
        assert!(registry.register(handle, CallerInfo::new(uid), Some(sink.clone()), None));
        (handle, sink)
    }

    #[test_timeout::timeout]
    fn register_rejects_nil_handle_and_missing_sink() {
        let f = fixture();
        let sink: Arc<dyn SessionCallback> = RecordingCallback::new();
        assert!(!f.registry.register(SessionHandle::nil(), CallerInfo::new(10_001), Some(sink), None));
        assert!(!f.registry.register(SessionHandle::new(), CallerInfo::new(10_001), None, None));
        assert_eq!(f.registry.session_count(), 0);
    }

    #[test_timeout::timeout]
    fn reregistration_from_another_uid_is_refused() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 10_001);
        let sink: Arc<dyn SessionCallback> = RecordingCallback::new();
        assert!(!f.registry.register(handle, CallerInfo::new(10_002), Some(sink.clone()), None));
        assert_eq!(f.registry.uid_of(handle), Some(ClientIdentity(10_001)));
        assert!(f.registry.register(handle, CallerInfo::new(10_001), Some(sink), None));
    }

    /// Runs a one-shot hook before resolving, while the registry lock is free.
    struct HookedIdentities {
        table: Arc<StaticIdentities>,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl IdentityResolver for HookedIdentities {
        fn resolve_identity(&self, uid: ClientIdentity) -> Option<PackageIdentity> {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            self.table.resolve_identity(uid)
        }
    }

    #[test_timeout::timeout]
    fn registration_rechecks_the_map_after_resolving() {
        let identities = Arc::new(HookedIdentities {
            table: StaticIdentities::with([(10_001, "com.example.app"), (10_002, "org.other")]),
            hook: Mutex::new(None),
        });
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = ClientRegistry::new(RegistryParts {
            throttler: Throttler::start(
                InMemoryThrottleStore::new(),
                ThrottleSettings {
                    capacity: 10,
                    window: Duration::from_secs(60),
                    ban_after_bad_predictions: None,
                },
                clock.clone(),
            ),
            identities: identities.clone(),
            verifier: ScriptedVerifier::new(),
            keep_alive: FakeKeepAlive::new(),
            executor: Arc::new(InlineExecutor),
            clock,
        });

        let contested = SessionHandle::new();
        let racer = registry.clone();
        *identities.hook.lock() = Some(Box::new(move || {
            let sink: Arc<dyn SessionCallback> = RecordingCallback::new();
            assert!(racer.register(contested, CallerInfo::new(10_002), Some(sink), None));
        }));
        let sink: Arc<dyn SessionCallback> = RecordingCallback::new();
        assert!(!registry.register(contested, CallerInfo::new(10_001), Some(sink), None));
        assert_eq!(registry.uid_of(contested), Some(ClientIdentity(10_002)));
        assert_eq!(
            registry.package_name(contested).map(|p| p.as_str().to_string()),
            Some("org.other".to_string())
        );

        let (handle, _) = register(&registry, 10_001);
        assert!(registry.evict(handle));
        let sink: Arc<dyn SessionCallback> = RecordingCallback::new();
        assert!(registry.register(handle, CallerInfo::new(10_001), Some(sink), None));
        assert_eq!(
            registry.package_name(handle).map(|p| p.as_str().to_string()),
            Some("com.example.app".to_string())
        );
    }

    #[test_timeout::timeout]
    fn unknown_uid_registers_without_package() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 99_999);
        assert!(f.registry.package_name(handle).is_none());
        let origin = Origin::parse("https://a.example").expect("origin");
        assert!(!f.registry.verify_relationship(handle, Relation::UseAsOrigin, origin, false));
    }

    #[test_timeout::timeout]
    fn first_empty_low_confidence_prediction_bypasses_throttle() {
        let f = fixture_with(ScriptedVerifier::new(), 1);
        let (handle, _) = register(&f.registry, 10_001);
        let uid = ClientIdentity(10_001);
        assert!(f.registry.update_prediction(handle, uid, Some("https://a.example/"), false));
        assert!(!f.registry.update_prediction(handle, uid, None, true));

        let (fresh, _) = register(&f.registry, 10_002);
        let other = ClientIdentity(10_002);
        assert!(f.registry.update_prediction(fresh, other, None, true));
        assert!(f.registry.update_prediction(fresh, other, None, true));
        assert!(!f.registry.update_prediction(fresh, other, None, true));
    }

    #[test_timeout::timeout]
    fn prediction_from_wrong_uid_is_rejected() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 10_001);
        assert!(!f.registry.update_prediction(handle, ClientIdentity(10_002), Some("https://a.example/"), false));
        assert!(f.registry.last_prediction(handle).is_none());
    }

    #[test_timeout::timeout]
    fn launch_classification_respects_fragment_policy() {
        let f = fixture();
        let uid = ClientIdentity(10_001);
        let (handle, _) = register(&f.registry, 10_001);

        assert_eq!(f.registry.record_launch(handle, "https://a.example/"), PredictionOutcome::None);

        f.registry.update_prediction(handle, uid, Some("https://a.example/x#a"), false);
        assert_eq!(f.registry.record_launch(handle, "https://a.example/x#b"), PredictionOutcome::Bad);
        assert!(f.registry.last_prediction(handle).is_none());

        f.registry.set_policy(
            handle,
            SessionPolicy {
                ignore_fragments: true,
                ..SessionPolicy::default()
            },
        );
        f.registry.update_prediction(handle, uid, Some("https://a.example/x#a"), false);
        assert_eq!(f.registry.record_launch(handle, "https://a.example/x#b"), PredictionOutcome::Good);
        assert_eq!(f.registry.throttler().state(uid).map(|s| s.successes), Some(1));
    }

    #[test_timeout::timeout]
    fn verified_origin_lands_in_the_first_party_set() {
        let f = fixture();
        f.verifier.approve("com.example.app", "https://a.example");
        let (handle, sink) = register(&f.registry, 10_001);
        let origin = Origin::parse("https://a.example/page").expect("origin");
        assert!(!f.registry.is_first_party_origin(handle, &origin));

        assert!(f.registry.verify_relationship(handle, Relation::UseAsOrigin, origin.clone(), false));
        assert!(f.registry.is_first_party_origin(handle, &origin));
        assert_eq!(
            sink.events(),
            vec![CallbackEvent::Validation {
                relation: Relation::UseAsOrigin,
                origin: "https://a.example".into(),
                ok: true,
            }]
        );

        assert!(f.registry.verify_relationship(handle, Relation::UseAsOrigin, origin, true));
        assert_eq!(f.verifier.calls(), 1);
        assert_eq!(sink.events().len(), 2);
    }

    #[test_timeout::timeout]
    fn newer_verification_supersedes_in_flight_one() {
        let f = fixture_with(ScriptedVerifier::deferred(), 10);
        let (handle, sink) = register(&f.registry, 10_001);
        let first = Origin::parse("https://a.example").expect("origin");
        let second = Origin::parse("https://b.example").expect("origin");
        assert!(f.registry.verify_relationship(handle, Relation::UseAsOrigin, first.clone(), false));
        assert!(f.registry.verify_relationship(handle, Relation::UseAsOrigin, second.clone(), false));
        assert_eq!(f.verifier.pending_count(), 2);

        f.verifier.take_pending().expect("first").complete(Ok(()));
        assert!(!f.registry.is_first_party_origin(handle, &first));
        assert!(sink.events().is_empty());

        f.verifier.take_pending().expect("second").complete(Ok(()));
        assert!(f.registry.is_first_party_origin(handle, &second));
        assert_eq!(sink.events().len(), 1);
    }

    #[test_timeout::timeout]
    fn disconnect_fires_once_across_release_and_evict() {
        let f = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let hook: DisconnectHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = SessionHandle::new();
        let sink: Arc<dyn SessionCallback> = RecordingCallback::new();
        assert!(f.registry.register(handle, CallerInfo::new(10_001), Some(sink), Some(hook)));

        assert!(f.registry.release(handle));
        assert!(f.registry.is_registered(handle));
        assert!(f.registry.evict(handle));
        assert!(!f.registry.evict(handle));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::timeout]
    fn memory_sweep_evicts_only_released_sessions() {
        let f = fixture();
        let (kept, _) = register(&f.registry, 10_001);
        let (released, _) = register(&f.registry, 10_001);
        f.registry.release(released);
        assert_eq!(f.registry.evict_unused(), vec![released]);
        assert!(f.registry.is_registered(kept));
        assert!(!f.registry.is_registered(released));
    }

    #[test_timeout::timeout]
    fn keep_alive_requires_matching_package_and_dies_permanently() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 10_001);
        let wrong = KeepAliveTarget {
            package: "org.other".into(),
            service: "KeepAlive".into(),
            pid: None,
        };
        assert!(!f.registry.bind_keep_alive(handle, &wrong));

        let target = KeepAliveTarget {
            package: "com.example.app".into(),
            ..wrong
        };
        assert!(f.registry.bind_keep_alive(handle, &target));
        f.keep_alive.kill_all();
        assert!(f.registry.is_keep_alive_dead(handle));
        assert!(!f.registry.bind_keep_alive(handle, &target));
        assert_eq!(f.keep_alive.bind_count(), 1);
    }

    #[test_timeout::timeout]
    fn death_during_bind_leaves_the_binding_dead() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 10_001);
        let target = KeepAliveTarget {
            package: "com.example.app".into(),
            service: "KeepAlive".into(),
            pid: Some(4242),
        };
        f.keep_alive.set_die_on_bind(true);
        assert!(!f.registry.bind_keep_alive(handle, &target));
        assert!(f.registry.is_keep_alive_dead(handle));
        assert_eq!(f.keep_alive.released_count(), 1);

        f.keep_alive.set_die_on_bind(false);
        assert!(!f.registry.bind_keep_alive(handle, &target));
        assert_eq!(f.keep_alive.bind_count(), 1);
    }

    #[test_timeout::timeout]
    fn failed_bind_can_be_retried() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 10_001);
        let target = KeepAliveTarget {
            package: "com.example.app".into(),
            service: "KeepAlive".into(),
            pid: Some(4242),
        };
        f.keep_alive.set_refuse(true);
        assert!(!f.registry.bind_keep_alive(handle, &target));
        assert!(!f.registry.is_keep_alive_dead(handle));
        f.keep_alive.set_refuse(false);
        assert!(f.registry.bind_keep_alive(handle, &target));
    }

    #[test_timeout::timeout]
    fn eviction_releases_the_keep_alive_binding() {
        let f = fixture();
        let (handle, _) = register(&f.registry, 10_001);
        let target = KeepAliveTarget {
            package: "com.example.app".into(),
            service: "KeepAlive".into(),
            pid: Some(4242),
        };
        assert!(f.registry.bind_keep_alive(handle, &target));
        assert!(f.registry.evict(handle));
        assert_eq!(f.keep_alive.released_count(), 1);
        let origin = Origin::parse("https://a.example").expect("origin");
        assert!(!f.registry.verify_relationship(handle, Relation::UseAsOrigin, origin, false));
    }

    #[test_timeout::timeout]
    fn warmup_state_tracks_uid_and_global_calls() {
        let f = fixture();
        let (a, _) = register(&f.registry, 10_001);
        let (b, _) = register(&f.registry, 10_002);
        assert_eq!(f.registry.warmup_state(None), WarmupState::NoSessionNoWarmup);
        assert_eq!(f.registry.warmup_state(Some(a)), WarmupState::SessionNoWarmupNotCalled);
        f.registry.record_warmup(ClientIdentity(10_001));
        assert_eq!(f.registry.warmup_state(Some(a)), WarmupState::SessionWarmup);
        assert_eq!(f.registry.warmup_state(Some(b)), WarmupState::SessionNoWarmupAlreadyCalled);
        assert_eq!(f.registry.warmup_state(None), WarmupState::NoSessionWarmup);
    }
}
