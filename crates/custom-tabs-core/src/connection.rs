//! Inbound façade. Every public method may be called from any thread; work on
//! the speculation slot is marshalled onto the owner thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::callback::deliver;
use crate::clock::Clock;
use crate::collab::{
    BrowserEnvironment, IdentityResolver, KeepAliveConnector, KeepAliveTarget, NavigationEvent,
    OriginVerifier, Relation, SessionCallback, SurfaceFactory, SurfaceHandle,
};
use crate::config::ServiceConfig;
use crate::origin::{is_speculatable_url, Origin};
use crate::owner::{OwnerError, OwnerThread};
use crate::registry::{ClientRegistry, DisconnectHook, RegistryParts};
use crate::session::{
    CallerInfo, ClientIdentity, PredictionOutcome, SessionHandle, SessionPolicy, WarmupState,
};
use crate::speculation::{CancelScope, CrashHook, LaunchExtras, SpeculationSlot};
use crate::throttle::{ThrottleSettings, ThrottleStore, Throttler};

/// Collaborators and configuration the service is built from.
pub struct ServiceParts {
    pub config: ServiceConfig,
    pub surfaces: Arc<dyn SurfaceFactory>,
    pub identities: Arc<dyn IdentityResolver>,
    pub verifier: Arc<dyn OriginVerifier>,
    pub keep_alive: Arc<dyn KeepAliveConnector>,
    pub environment: Arc<dyn BrowserEnvironment>,
    pub throttle_store: Arc<dyn ThrottleStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to start owner thread: {0}")]
    OwnerSpawn(#[from] std::io::Error),
}

/// How a real navigation was served.
#[derive(Debug)]
pub enum Navigation {
    Speculated(SurfaceHandle),
    Fresh(SurfaceHandle),
    /// No surface could be created for the navigation.
    Unavailable,
}

#[derive(Debug)]
pub struct NavigationResult {
    pub navigation: Navigation,
    pub outcome: PredictionOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimLevel {
    Moderate,
    Severe,
}

/// State confined to the owner thread.
pub struct OwnerState {
    slot: SpeculationSlot,
    initialized: bool,
    spare_pending: bool,
    warmup_waiters: Vec<ClientIdentity>,
}

impl OwnerState {
    pub fn slot(&self) -> &SpeculationSlot {
        &self.slot
    }
}

struct ServiceInner {
    config: ServiceConfig,
    registry: ClientRegistry,
    throttler: Throttler,
    owner: OwnerThread<OwnerState>,
    surfaces: Arc<dyn SurfaceFactory>,
    environment: Arc<dyn BrowserEnvironment>,
    warmup_called: AtomicBool,
    warmup_finished: AtomicBool,
    disconnect_hook: Mutex<Option<DisconnectHook>>,
}

#[derive(Clone)]
pub struct ConnectionService {
    inner: Arc<ServiceInner>,
}

impl ConnectionService {
    pub fn start(parts: ServiceParts) -> Result<Self, ServiceError> {
        let ServiceParts {
            config,
            surfaces,
            identities,
            verifier,
            keep_alive,
            environment,
            throttle_store,
            clock,
        } = parts;

        let throttler = Throttler::start(
            throttle_store,
            ThrottleSettings::from(&config),
            Arc::clone(&clock),
        );

        let slot_surfaces = Arc::clone(&surfaces);
        let owner = OwnerThread::spawn("tabs-owner", move |poster| {
            let crash_hook: CrashHook = Arc::new(move |surface| {
                let _ = poster.post(move |state: &mut OwnerState| {
                    state.slot.on_surface_crashed(surface)
                });
            });
            OwnerState {
                slot: SpeculationSlot::new(slot_surfaces, crash_hook),
                initialized: false,
                spare_pending: false,
                warmup_waiters: Vec::new(),
            }
        })?;

        let registry = ClientRegistry::new(RegistryParts {
            throttler: throttler.clone(),
            identities,
            verifier,
            keep_alive,
            executor: Arc::new(owner.poster()),
            clock,
        });

        info!(
            capacity = config.throttle_capacity,
            window_ms = config.throttle_window.as_millis() as u64,
            hidden_tab_speculation = config.hidden_tab_speculation,
            "connection service started"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                registry,
                throttler,
                owner,
                surfaces,
                environment,
                warmup_called: AtomicBool::new(false),
                warmup_finished: AtomicBool::new(false),
                disconnect_hook: Mutex::new(None),
            }),
        })
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn throttler(&self) -> &Throttler {
        &self.inner.throttler
    }

    /// Extra hook run whenever a session disconnects.
    pub fn set_disconnect_callback(&self, hook: DisconnectHook) {
        *self.inner.disconnect_hook.lock() = Some(hook);
    }

    pub fn register_session(
        &self,
        handle: SessionHandle,
        caller: CallerInfo,
        sink: Option<Arc<dyn SessionCallback>>,
    ) -> bool {
        let weak = Arc::downgrade(&self.inner);
        let hook: DisconnectHook = Arc::new(move |handle| on_disconnect(&weak, handle));
        let ok = self.inner.registry.register(handle, caller, sink, Some(hook));
        self.log_call("register_session", handle, ok);
        ok
    }

    /// Starts background preparation. Cheap after the first call.
    pub fn warmup(&self, caller: CallerInfo) -> bool {
        let ok = self.warmup_internal(&caller);
        if self.inner.config.log_requests {
            debug!(uid = %caller.uid, ok, "warmup");
        }
        ok
    }

    pub fn has_warmup_finished(&self) -> bool {
        self.inner.warmup_finished.load(Ordering::SeqCst)
    }

    fn warmup_internal(&self, caller: &CallerInfo) -> bool {
        if !self.inner.environment.is_caller_foreground(caller) {
            debug!(uid = %caller.uid, "ignoring warmup from background caller");
            return false;
        }
        let uid = caller.uid;
        self.inner.registry.record_warmup(uid);
        let first = !self.inner.warmup_called.swap(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let posted = self.inner.owner.post(move |state| {
            if !state.initialized {
                inner.environment.initialize();
                state.initialized = true;
                info!("one-time initialization done");
            }
            request_spare(&inner, state, Some(uid));
            if !inner.throttler.is_loaded() {
                debug!("throttle state still loading");
            }
        });
        if let Err(err) = posted {
            warn!(error = %err, "warmup could not be scheduled");
            return false;
        }
        if first {
            debug!(%uid, "first warmup scheduled");
        }
        true
    }

    /// Hint that `url` (or one of `other_likely`) is about to be opened.
    pub fn may_launch_url(
        &self,
        handle: SessionHandle,
        caller: CallerInfo,
        url: Option<&str>,
        other_likely: Option<&[String]>,
        extras: &LaunchExtras,
    ) -> bool {
        let ok = self.may_launch_url_internal(handle, caller, url, other_likely, extras);
        if self.inner.config.log_requests {
            debug!(session = %handle, url = url.unwrap_or(""), ok, "may_launch_url");
        }
        ok
    }

    fn may_launch_url_internal(
        &self,
        handle: SessionHandle,
        caller: CallerInfo,
        url: Option<&str>,
        other_likely: Option<&[String]>,
        extras: &LaunchExtras,
    ) -> bool {
        if extras.incognito {
            return false;
        }
        let low_confidence = url.map_or(true, str::is_empty) && other_likely.is_some();
        let valid_url = url.filter(|u| is_speculatable_url(u)).map(str::to_string);
        if url.is_some() && valid_url.is_none() && !low_confidence {
            return false;
        }
        if !self.warmup_internal(&caller) {
            return false;
        }
        if !self.inner.registry.update_prediction(
            handle,
            caller.uid,
            valid_url.as_deref(),
            other_likely.is_some(),
        ) {
            return false;
        }

        let job = MayLaunch {
            handle,
            uid: caller.uid,
            low_confidence,
            url: valid_url,
            others: other_likely.map(<[String]>::to_vec).unwrap_or_default(),
            extras: extras.clone(),
        };
        let inner = Arc::clone(&self.inner);
        self.inner
            .owner
            .post(move |state| job.run(&inner, state, true))
            .is_ok()
    }

    /// Takes the speculated surface if it matches. A mismatching speculation is destroyed.
    pub fn take_speculated_page(
        &self,
        handle: Option<SessionHandle>,
        url: &str,
        referrer: &str,
    ) -> Option<SurfaceHandle> {
        let ignore_fragments = match handle {
            Some(h) => self.inner.registry.policy(h)?.ignore_fragments,
            None => false,
        };
        let url = url.to_string();
        let referrer = referrer.to_string();
        self.blocking("take_speculated_page", move |state| {
            state.slot.take(handle, ignore_fragments, &url, &referrer)
        })
        .flatten()
    }

    /// Serves a real navigation: the speculated surface when it matches, a
    /// fresh visible one otherwise. The launch is recorded against the
    /// session's last prediction.
    pub fn handle_navigation(
        &self,
        handle: Option<SessionHandle>,
        caller: CallerInfo,
        url: &str,
        referrer: &str,
    ) -> NavigationResult {
        let registered = handle.filter(|h| self.inner.registry.is_registered(*h));
        let ignore_fragments = registered
            .and_then(|h| self.inner.registry.policy(h))
            .is_some_and(|p| p.ignore_fragments);
        let may_take = handle.is_none() || registered.is_some();

        let surfaces = Arc::clone(&self.inner.surfaces);
        let target = url.to_string();
        let target_referrer = referrer.to_string();
        let navigation = self
            .blocking("handle_navigation", move |state| {
                if may_take {
                    if let Some(surface) = state.slot.take(
                        registered,
                        ignore_fragments,
                        &target,
                        &target_referrer,
                    ) {
                        return Navigation::Speculated(surface);
                    }
                }
                match surfaces.create_visible_surface(caller.uid) {
                    Some(surface) => {
                        surfaces.navigate(&surface, &target, &target_referrer);
                        surfaces.show(&surface);
                        Navigation::Fresh(surface)
                    }
                    None => Navigation::Unavailable,
                }
            })
            .unwrap_or(Navigation::Unavailable);

        let outcome = match registered {
            Some(h) => self.inner.registry.record_launch(h, url),
            None => PredictionOutcome::None,
        };
        NavigationResult {
            navigation,
            outcome,
        }
    }

    /// Cancels the session's speculation, or any speculation when `handle` is `None`.
    pub fn cancel_speculation(&self, handle: Option<SessionHandle>) -> bool {
        let scope = handle.map_or(CancelScope::All, CancelScope::Owner);
        self.blocking("cancel_speculation", move |state| state.slot.cancel(scope))
            .unwrap_or(false)
    }

    /// Navigates the spare surface right away and shows it.
    pub fn start_early_navigation(
        &self,
        handle: Option<SessionHandle>,
        caller: CallerInfo,
        url: &str,
        referrer: &str,
    ) -> bool {
        if !is_speculatable_url(url) {
            return false;
        }
        if let Some(h) = handle {
            if self.inner.registry.uid_of(h) != Some(caller.uid) {
                return false;
            }
        }
        let url = url.to_string();
        let referrer = referrer.to_string();
        self.blocking("start_early_navigation", move |state| {
            state
                .slot
                .start_early_navigation(handle, caller.uid, &url, &referrer)
        })
        .unwrap_or(false)
    }

    /// Tears the session down: registry first, then its speculation.
    pub fn evict_session(&self, handle: SessionHandle) -> bool {
        let removed = self.inner.registry.evict(handle);
        self.blocking("evict_session", move |state| {
            state.slot.cancel(CancelScope::Teardown(handle))
        });
        self.log_call("evict_session", handle, removed);
        removed
    }

    /// Client went away without an explicit close. The record is kept until
    /// memory pressure sweeps it.
    pub fn release_session(&self, handle: SessionHandle) -> bool {
        self.inner.registry.release(handle)
    }

    /// Returns the number of evicted sessions.
    pub fn trim_memory(&self, level: TrimLevel) -> usize {
        if level != TrimLevel::Severe {
            return 0;
        }
        let evicted = self.inner.registry.evict_unused();
        self.blocking("trim_memory", |state| state.slot.cancel(CancelScope::All));
        info!(evicted = evicted.len(), "trimmed sessions under memory pressure");
        evicted.len()
    }

    pub fn verify_relationship(
        &self,
        handle: SessionHandle,
        relation: Relation,
        origin: Origin,
        use_cached: bool,
    ) -> bool {
        if !self.inner.warmup_called.load(Ordering::SeqCst) {
            debug!(session = %handle, "verification requested before warmup");
            if let Some(sink) = self.inner.registry.callback(handle) {
                deliver("relationship_validation", || {
                    sink.on_relationship_validation_result(relation, &origin, false)
                });
            }
            return false;
        }
        self.inner
            .registry
            .verify_relationship(handle, relation, origin, use_cached)
    }

    pub fn is_first_party_origin(&self, handle: SessionHandle, origin: &Origin) -> bool {
        self.inner.registry.is_first_party_origin(handle, origin)
    }

    /// Parallel requests are only issued on behalf of a verified first-party referrer.
    pub fn can_do_parallel_request(&self, handle: SessionHandle, referrer: &str) -> bool {
        let Some(policy) = self.inner.registry.policy(handle) else {
            return false;
        };
        if !policy.allow_parallel_request {
            return false;
        }
        Origin::parse(referrer)
            .is_some_and(|origin| self.inner.registry.is_first_party_origin(handle, &origin))
    }

    pub fn bind_keep_alive(&self, handle: SessionHandle, target: &KeepAliveTarget) -> bool {
        self.inner.registry.bind_keep_alive(handle, target)
    }

    pub fn unbind_keep_alive(&self, handle: SessionHandle) -> bool {
        self.inner.registry.unbind_keep_alive(handle)
    }

    pub fn set_session_policy(&self, handle: SessionHandle, policy: SessionPolicy) -> bool {
        self.inner.registry.set_policy(handle, policy)
    }

    pub fn set_session_foreground(&self, handle: SessionHandle, foreground: bool) -> bool {
        self.inner.registry.set_foreground(handle, foreground)
    }

    pub fn warmup_state(&self, handle: Option<SessionHandle>) -> WarmupState {
        self.inner.registry.warmup_state(handle)
    }

    pub fn reset_throttling(&self, uid: ClientIdentity) {
        self.inner.throttler.reset(uid);
    }

    pub fn ban(&self, uid: ClientIdentity) {
        self.inner.throttler.ban(uid);
    }

    pub fn notify_navigation_event(&self, handle: SessionHandle, event: NavigationEvent) -> bool {
        let Some(sink) = self.inner.registry.callback(handle) else {
            return false;
        };
        deliver("navigation_event", || sink.on_navigation_event(event))
    }

    pub fn send_extra_callback(
        &self,
        handle: SessionHandle,
        name: &str,
        args: &serde_json::Value,
    ) -> bool {
        let Some(sink) = self.inner.registry.callback(handle) else {
            return false;
        };
        deliver("extra_callback", || sink.extra_callback(name, args))
    }

    pub fn has_speculation(&self) -> bool {
        self.blocking("has_speculation", |state| state.slot.has_speculation())
            .unwrap_or(false)
    }

    /// Destroys any speculation and stops the owner and throttle threads.
    pub fn shutdown(&self) {
        self.blocking("shutdown", |state| state.slot.cancel(CancelScope::All));
        self.inner.owner.shutdown();
        self.inner.throttler.shutdown();
        info!("connection service stopped");
    }

    /// Runs `job` on the owner thread and waits. Failures are logged and
    /// surface as `None`.
    fn blocking<R, F>(&self, op: &'static str, job: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut OwnerState) -> R + Send + 'static,
    {
        match self.inner.owner.run_blocking(job) {
            Ok(value) => Some(value),
            Err(OwnerError::Reentrant) => {
                warn!(op, "blocking call from the owner thread refused");
                None
            }
            Err(err) => {
                warn!(op, error = %err, "owner call failed");
                None
            }
        }
    }

    fn log_call(&self, op: &'static str, handle: SessionHandle, ok: bool) {
        if self.inner.config.log_requests {
            debug!(op, session = %handle, ok, "inbound call");
        }
    }
}

struct MayLaunch {
    handle: SessionHandle,
    uid: ClientIdentity,
    low_confidence: bool,
    url: Option<String>,
    others: Vec<String>,
    extras: LaunchExtras,
}

impl MayLaunch {
    fn run(self, inner: &Arc<ServiceInner>, state: &mut OwnerState, retry: bool) {
        if !inner.environment.is_startup_complete() {
            if retry {
                let again = Arc::clone(inner);
                let delay = inner.config.startup_retry_delay;
                let _ = inner
                    .owner
                    .post_after(delay, move |state| self.run(&again, state, false));
            } else {
                debug!(session = %self.handle, "startup still incomplete; dropping launch hint");
            }
            return;
        }

        if self.low_confidence {
            if preconnect_all(inner, &self.others) {
                request_spare(inner, state, None);
            }
            return;
        }

        let Some(url) = self.url.as_deref() else {
            state.slot.cancel(CancelScope::Owner(self.handle));
            return;
        };

        if may_speculate(inner, self.handle) {
            if inner.config.hidden_tab_speculation {
                let referrer = self.extras.referrer.as_deref().unwrap_or("");
                state.slot.launch_in_hidden(
                    Some(self.handle),
                    self.uid,
                    url,
                    referrer,
                    &self.extras,
                );
            } else {
                request_spare(inner, state, None);
            }
            inner.environment.preconnect(url);
        }
        preconnect_all(inner, &self.others);
    }
}

fn may_speculate(inner: &ServiceInner, handle: SessionHandle) -> bool {
    let policy = inner.environment.speculation_policy();
    if !policy.device_allows_prerender
        || policy.third_party_cookies_blocked
        || policy.preloading_disabled
    {
        return false;
    }
    if policy.on_cellular {
        return inner
            .registry
            .policy(handle)
            .is_some_and(|p| p.allow_cellular_speculation);
    }
    true
}

/// Returns whether at least one URL was valid.
fn preconnect_all(inner: &ServiceInner, urls: &[String]) -> bool {
    let mut any = false;
    for url in urls.iter().filter(|u| is_speculatable_url(u)) {
        inner.environment.preconnect(url);
        any = true;
    }
    any
}

/// Makes sure a spare surface exists, deferring while startup is incomplete.
/// Requests that arrive while one is pending join it.
fn request_spare(inner: &Arc<ServiceInner>, state: &mut OwnerState, notify: Option<ClientIdentity>) {
    if let Some(uid) = notify {
        if !state.warmup_waiters.contains(&uid) {
            state.warmup_waiters.push(uid);
        }
    }
    if state.spare_pending {
        return;
    }
    state.spare_pending = true;
    spare_step(inner, state, 0);
}

fn spare_step(inner: &Arc<ServiceInner>, state: &mut OwnerState, attempt: u32) {
    if !inner.environment.is_startup_complete() {
        if attempt < inner.config.max_startup_retries {
            let again = Arc::clone(inner);
            let posted = inner.owner.post_after(inner.config.startup_retry_delay, move |state| {
                spare_step(&again, state, attempt + 1)
            });
            if posted.is_ok() {
                return;
            }
        }
        // Waiters stay queued; the next warmup starts a fresh round for them.
        warn!(attempt, "startup did not complete; warmup left unfinished");
        state.spare_pending = false;
        return;
    }
    if !inner.surfaces.has_spare_surface() && !inner.surfaces.prepare_spare_surface() {
        warn!("spare surface could not be prepared");
    }

    state.spare_pending = false;
    inner.warmup_finished.store(true, Ordering::SeqCst);
    for uid in std::mem::take(&mut state.warmup_waiters) {
        notify_warmup_done(inner, uid);
    }
}

fn notify_warmup_done(inner: &ServiceInner, uid: ClientIdentity) {
    for handle in inner.registry.sessions_for_uid(uid) {
        if let Some(sink) = inner.registry.callback(handle) {
            deliver("warmup_completed", || sink.on_warmup_completed());
        }
    }
}

fn on_disconnect(inner: &Weak<ServiceInner>, handle: SessionHandle) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    info!(session = %handle, "session disconnected");
    let _ = inner
        .owner
        .post(move |state| {
            state.slot.cancel(CancelScope::Owner(handle));
        });
    let hook = inner.disconnect_hook.lock().clone();
    if let Some(hook) = hook {
        deliver("disconnect", || hook(handle));
    }
}
