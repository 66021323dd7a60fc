//! In-memory collaborators for tests and early wiring.
//!
//! Each fake records what the core asked of it so assertions can inspect the
//! exact sequence of surface, verification and keep-alive calls.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collab::{
    BrowserEnvironment, DeathNotice, IdentityResolver, KeepAliveConnection, KeepAliveConnector,
    KeepAliveError, KeepAliveTarget, NavigationEvent, OriginVerifier, Relation, SessionCallback,
    SpeculationPolicy, SurfaceFactory, SurfaceHandle, SurfaceId, SurfaceObserver, VerifyCallback,
    VerifyError,
};
use crate::origin::Origin;
use crate::session::{CallerInfo, ClientIdentity, PackageIdentity};

pub use crate::throttle::InMemoryThrottleStore;

#[derive(Default)]
struct SurfaceLog {
    next: u64,
    spare: Option<SurfaceId>,
    live: BTreeSet<SurfaceId>,
    destroyed: Vec<SurfaceId>,
    shown: Vec<SurfaceId>,
    navigations: Vec<(SurfaceId, String, String)>,
    observers: HashMap<SurfaceId, Arc<dyn SurfaceObserver>>,
    spare_preparations: u32,
    fail_hidden: bool,
}

impl SurfaceLog {
    fn allocate(&mut self) -> SurfaceId {
        self.next += 1;
        let id = SurfaceId(self.next);
        self.live.insert(id);
        id
    }
}

#[derive(Default)]
pub struct RecordingSurfaces {
    log: Mutex<SurfaceLog>,
}

impl RecordingSurfaces {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts with one pre-warmed spare surface.
    pub fn with_spare() -> Arc<Self> {
        let surfaces = Self::default();
        {
            let mut log = surfaces.log.lock();
            let id = log.allocate();
            log.spare = Some(id);
        }
        Arc::new(surfaces)
    }

    pub fn set_fail_hidden(&self, fail: bool) {
        self.log.lock().fail_hidden = fail;
    }

    pub fn live(&self) -> Vec<SurfaceId> {
        self.log.lock().live.iter().copied().collect()
    }

    pub fn live_count(&self) -> usize {
        self.log.lock().live.len()
    }

    pub fn destroyed(&self) -> Vec<SurfaceId> {
        self.log.lock().destroyed.clone()
    }

    pub fn shown(&self) -> Vec<SurfaceId> {
        self.log.lock().shown.clone()
    }

    pub fn navigations(&self) -> Vec<(SurfaceId, String, String)> {
        self.log.lock().navigations.clone()
    }

    pub fn spare_preparations(&self) -> u32 {
        self.log.lock().spare_preparations
    }

    /// Simulates a renderer crash, notifying the registered observer.
    pub fn crash(&self, surface: SurfaceId) {
        let observer = self.log.lock().observers.get(&surface).cloned();
        if let Some(observer) = observer {
            observer.on_crashed(surface);
        }
    }
}

impl SurfaceFactory for RecordingSurfaces {
    fn create_hidden_surface(&self, _identity: ClientIdentity) -> Option<SurfaceHandle> {
        let mut log = self.log.lock();
        if log.fail_hidden {
            return None;
        }
        Some(SurfaceHandle::new(log.allocate()))
    }

    fn create_visible_surface(&self, _identity: ClientIdentity) -> Option<SurfaceHandle> {
        Some(SurfaceHandle::new(self.log.lock().allocate()))
    }

    fn take_spare_surface(&self) -> Option<SurfaceHandle> {
        self.log.lock().spare.take().map(SurfaceHandle::new)
    }

    fn prepare_spare_surface(&self) -> bool {
        let mut log = self.log.lock();
        log.spare_preparations += 1;
        if log.spare.is_none() {
            let id = log.allocate();
            log.spare = Some(id);
        }
        true
    }

    fn has_spare_surface(&self) -> bool {
        self.log.lock().spare.is_some()
    }

    fn navigate(&self, surface: &SurfaceHandle, url: &str, referrer: &str) {
        self.log
            .lock()
            .navigations
            .push((surface.id(), url.to_string(), referrer.to_string()));
    }

    fn show(&self, surface: &SurfaceHandle) {
        self.log.lock().shown.push(surface.id());
    }

    fn observe(&self, surface: &SurfaceHandle, observer: Arc<dyn SurfaceObserver>) {
        self.log.lock().observers.insert(surface.id(), observer);
    }

    fn destroy_surface(&self, surface: SurfaceHandle) {
        let mut log = self.log.lock();
        let id = surface.id();
        log.live.remove(&id);
        log.observers.remove(&id);
        log.destroyed.push(id);
    }
}

/// Fixed uid → package table. Unknown uids resolve to nothing.
#[derive(Debug, Default)]
pub struct StaticIdentities {
    packages: Mutex<HashMap<ClientIdentity, PackageIdentity>>,
}

impl StaticIdentities {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(pairs: impl IntoIterator<Item = (u32, &'static str)>) -> Arc<Self> {
        let identities = Self::default();
        {
            let mut packages = identities.packages.lock();
            for (uid, package) in pairs {
                packages.insert(ClientIdentity(uid), PackageIdentity::new(package));
            }
        }
        Arc::new(identities)
    }

    pub fn insert(&self, uid: u32, package: &str) {
        self.packages
            .lock()
            .insert(ClientIdentity(uid), PackageIdentity::new(package));
    }
}

impl IdentityResolver for StaticIdentities {
    fn resolve_identity(&self, uid: ClientIdentity) -> Option<PackageIdentity> {
        self.packages.lock().get(&uid).cloned()
    }
}

pub struct PendingVerification {
    pub package: PackageIdentity,
    pub origin: Origin,
    pub relation: Relation,
    callback: VerifyCallback,
}

impl PendingVerification {
    pub fn complete(self, result: Result<(), VerifyError>) {
        (self.callback)(result);
    }
}

/// Approves exactly the (package, origin) pairs it was told about. In deferred
/// mode requests queue up until the test completes them.
#[derive(Default)]
pub struct ScriptedVerifier {
    approved: Mutex<HashSet<(String, String)>>,
    deferred: AtomicBool,
    pending: Mutex<Vec<PendingVerification>>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deferred() -> Arc<Self> {
        let verifier = Self::default();
        verifier.deferred.store(true, Ordering::SeqCst);
        Arc::new(verifier)
    }

    pub fn approve(&self, package: &str, origin: &str) {
        let origin = Origin::parse(origin).map_or_else(|| origin.to_string(), |o| o.serialize());
        self.approved.lock().insert((package.to_string(), origin));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Removes the oldest queued request.
    pub fn take_pending(&self) -> Option<PendingVerification> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    fn decide(&self, package: &PackageIdentity, origin: &Origin) -> Result<(), VerifyError> {
        let key = (package.as_str().to_string(), origin.serialize());
        if self.approved.lock().contains(&key) {
            Ok(())
        } else {
            Err(VerifyError::NotDeclared)
        }
    }
}

impl OriginVerifier for ScriptedVerifier {
    fn verify_origin(
        &self,
        package: &PackageIdentity,
        origin: &Origin,
        relation: Relation,
        on_result: VerifyCallback,
    ) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.deferred.load(Ordering::SeqCst) {
            self.pending.lock().push(PendingVerification {
                package: package.clone(),
                origin: origin.clone(),
                relation,
                callback: on_result,
            });
            return;
        }
        let result = self.decide(package, origin);
        on_result(result);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    WarmupCompleted,
    Validation {
        relation: Relation,
        origin: String,
        ok: bool,
    },
    Navigation(NavigationEvent),
    Extra {
        name: String,
        args: serde_json::Value,
    },
}

/// Client sink that records every notification, or panics on every call.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<CallbackEvent>>,
    panics: bool,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn panicking() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            panics: true,
        })
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: CallbackEvent) {
        if self.panics {
            panic!("client callback failure: {event:?}");
        }
        self.events.lock().push(event);
    }
}

impl SessionCallback for RecordingCallback {
    fn on_warmup_completed(&self) {
        self.record(CallbackEvent::WarmupCompleted);
    }

    fn on_relationship_validation_result(&self, relation: Relation, origin: &Origin, ok: bool) {
        self.record(CallbackEvent::Validation {
            relation,
            origin: origin.serialize(),
            ok,
        });
    }

    fn on_navigation_event(&self, event: NavigationEvent) {
        self.record(CallbackEvent::Navigation(event));
    }

    fn extra_callback(&self, name: &str, args: &serde_json::Value) {
        self.record(CallbackEvent::Extra {
            name: name.to_string(),
            args: args.clone(),
        });
    }
}

/// Environment with switchable startup/foreground state and a policy snapshot.
pub struct FakeEnvironment {
    startup_complete: AtomicBool,
    foreground: AtomicBool,
    policy: Mutex<SpeculationPolicy>,
    initializations: AtomicUsize,
    preconnects: Mutex<Vec<String>>,
}

impl Default for FakeEnvironment {
    fn default() -> Self {
        Self {
            startup_complete: AtomicBool::new(true),
            foreground: AtomicBool::new(true),
            policy: Mutex::new(SpeculationPolicy::default()),
            initializations: AtomicUsize::new(0),
            preconnects: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEnvironment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_startup_complete(&self, done: bool) {
        self.startup_complete.store(done, Ordering::SeqCst);
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    pub fn set_policy(&self, policy: SpeculationPolicy) {
        *self.policy.lock() = policy;
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn preconnects(&self) -> Vec<String> {
        self.preconnects.lock().clone()
    }
}

impl BrowserEnvironment for FakeEnvironment {
    fn is_caller_foreground(&self, _caller: &CallerInfo) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn is_startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::SeqCst)
    }

    fn initialize(&self) {
        self.initializations.fetch_add(1, Ordering::SeqCst);
    }

    fn speculation_policy(&self) -> SpeculationPolicy {
        *self.policy.lock()
    }

    fn preconnect(&self, url: &str) {
        self.preconnects.lock().push(url.to_string());
    }
}

#[derive(Default)]
struct KeepAliveLog {
    binds: Vec<(String, KeepAliveTarget)>,
    deaths: HashMap<u64, DeathNotice>,
    released: Vec<u64>,
}

/// Keep-alive connector whose bindings can be killed on demand.
#[derive(Default)]
pub struct FakeKeepAlive {
    log: Arc<Mutex<KeepAliveLog>>,
    next: AtomicU64,
    refuse: AtomicBool,
    die_on_bind: AtomicBool,
}

struct FakeConnection {
    id: u64,
    log: Arc<Mutex<KeepAliveLog>>,
}

impl KeepAliveConnection for FakeConnection {
    fn release(self: Box<Self>) {
        let mut log = self.log.lock();
        log.deaths.remove(&self.id);
        log.released.push(self.id);
    }
}

impl FakeKeepAlive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The target dies while `bind` is still running, before it returns.
    pub fn set_die_on_bind(&self, die: bool) {
        self.die_on_bind.store(die, Ordering::SeqCst);
    }

    pub fn bind_count(&self) -> usize {
        self.log.lock().binds.len()
    }

    pub fn released_count(&self) -> usize {
        self.log.lock().released.len()
    }

    /// Fires the death notice of every live binding.
    pub fn kill_all(&self) {
        let notices: Vec<DeathNotice> = {
            let mut log = self.log.lock();
            log.deaths.drain().map(|(_, notice)| notice).collect()
        };
        for notice in notices {
            notice();
        }
    }
}

impl KeepAliveConnector for FakeKeepAlive {
    fn bind(
        &self,
        package: &PackageIdentity,
        target: &KeepAliveTarget,
        on_death: DeathNotice,
    ) -> Result<Box<dyn KeepAliveConnection>, KeepAliveError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(KeepAliveError::Refused(target.service.clone()));
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        {
            let mut log = self.log.lock();
            log.binds.push((package.as_str().to_string(), target.clone()));
            if !self.die_on_bind.load(Ordering::SeqCst) {
                log.deaths.insert(id, on_death);
                return Ok(Box::new(FakeConnection {
                    id,
                    log: Arc::clone(&self.log),
                }));
            }
        }
        on_death();
        Ok(Box::new(FakeConnection {
            id,
            log: Arc::clone(&self.log),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn live_surfaces_are_listed_in_allocation_order() {
        let surfaces = RecordingSurfaces::new();
        let uid = ClientIdentity(10_001);
        let first = surfaces.create_hidden_surface(uid).expect("first");
        let second = surfaces.create_visible_surface(uid).expect("second");
        let third = surfaces.create_hidden_surface(uid).expect("third");
        let (first_id, third_id) = (first.id(), third.id());
        surfaces.destroy_surface(second);
        assert_eq!(surfaces.live(), vec![first_id, third_id]);
        assert!(first_id < third_id);
    }
}
