//! The single process-wide speculation slot.
//!
//! Lives on the owner thread only. Every surface the slot owns is released
//! through exactly one path: hand-off, cancellation, crash, or supersede.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collab::{SurfaceFactory, SurfaceHandle, SurfaceId, SurfaceObserver};
use crate::metrics::SPECULATION_EVENTS;
use crate::origin::urls_match;
use crate::session::{ClientIdentity, SessionHandle};

/// Optional parameters a client attaches to a launch hint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchExtras {
    /// Raw request headers. Speculated loads never carry client headers.
    pub headers: BTreeMap<String, String>,
    pub incognito: bool,
    /// Referrer the speculated load is issued with. A later hand-off must
    /// present the same string.
    pub referrer: Option<String>,
}

impl LaunchExtras {
    pub fn has_extra_headers(&self) -> bool {
        !self.headers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Routine cancel from a session. Leaves early navigations alone.
    Owner(SessionHandle),
    /// Session teardown. Also destroys the session's early navigation.
    Teardown(SessionHandle),
    All,
}

/// Called with the id of a crashed surface, from whatever thread observed it.
pub type CrashHook = Arc<dyn Fn(SurfaceId) + Send + Sync>;

struct CrashRelay {
    hook: CrashHook,
}

impl SurfaceObserver for CrashRelay {
    fn on_crashed(&self, surface: SurfaceId) {
        (self.hook)(surface);
    }
}

struct SpeculationRecord {
    session: Option<SessionHandle>,
    url: String,
    referrer: String,
    surface: SurfaceHandle,
    early_navigation: bool,
}

pub struct SpeculationSlot {
    surfaces: Arc<dyn SurfaceFactory>,
    crash_hook: CrashHook,
    current: Option<SpeculationRecord>,
}

impl SpeculationSlot {
    pub fn new(surfaces: Arc<dyn SurfaceFactory>, crash_hook: CrashHook) -> Self {
        Self {
            surfaces,
            crash_hook,
            current: None,
        }
    }

    pub fn has_speculation(&self) -> bool {
        self.current.is_some()
    }

    pub fn speculated_url(&self) -> Option<&str> {
        self.current.as_ref().map(|record| record.url.as_str())
    }

    pub fn speculation_owner(&self) -> Option<Option<SessionHandle>> {
        self.current.as_ref().map(|record| record.session)
    }

    pub fn is_early_navigation(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|record| record.early_navigation)
    }

    pub fn launch_in_hidden(
        &mut self,
        session: Option<SessionHandle>,
        identity: ClientIdentity,
        url: &str,
        referrer: &str,
        extras: &LaunchExtras,
    ) -> bool {
        if extras.has_extra_headers() {
            warn!(%identity, url, "refusing hidden speculation with client headers");
            SPECULATION_EVENTS.with_label_values(&["rejected"]).inc();
            return false;
        }
        if self.is_early_navigation() {
            debug!(%identity, url, "early navigation in flight; dropping speculation");
            SPECULATION_EVENTS.with_label_values(&["dropped"]).inc();
            return false;
        }
        self.supersede();

        let Some(surface) = self.surfaces.create_hidden_surface(identity) else {
            warn!(%identity, url, "no hidden surface available");
            SPECULATION_EVENTS.with_label_values(&["no_surface"]).inc();
            return false;
        };
        self.attach(surface, session, url, referrer, false);
        info!(%identity, url, "speculating in hidden surface");
        SPECULATION_EVENTS.with_label_values(&["started"]).inc();
        true
    }

    pub fn start_early_navigation(
        &mut self,
        session: Option<SessionHandle>,
        identity: ClientIdentity,
        url: &str,
        referrer: &str,
    ) -> bool {
        if self.is_early_navigation() {
            debug!(%identity, url, "early navigation already in flight");
            return false;
        }
        let Some(surface) = self.surfaces.take_spare_surface() else {
            debug!(%identity, url, "no spare surface for early navigation");
            return false;
        };
        self.supersede();
        self.surfaces.show(&surface);
        self.attach(surface, session, url, referrer, true);
        info!(%identity, url, "early navigation started");
        SPECULATION_EVENTS.with_label_values(&["early_navigation"]).inc();
        true
    }

    /// Hands the speculated surface to the caller when session, URL and
    /// referrer all match. A mismatching record is destroyed.
    pub fn take(
        &mut self,
        session: Option<SessionHandle>,
        ignore_fragments: bool,
        url: &str,
        referrer: &str,
    ) -> Option<SurfaceHandle> {
        let record = self.current.as_ref()?;
        if record.session != session {
            return None;
        }
        let matches =
            urls_match(&record.url, url, ignore_fragments) && record.referrer == referrer;
        let record = self.current.take()?;
        if matches {
            info!(url, surface = %record.surface.id(), "handing off speculated surface");
            SPECULATION_EVENTS.with_label_values(&["handed_off"]).inc();
            Some(record.surface)
        } else {
            debug!(
                speculated = %record.url,
                requested = url,
                "speculation did not match navigation"
            );
            self.destroy(record, "discarded");
            None
        }
    }

    /// Returns whether a record was destroyed.
    pub fn cancel(&mut self, scope: CancelScope) -> bool {
        let Some(record) = self.current.as_ref() else {
            return false;
        };
        let hit = match scope {
            CancelScope::Owner(session) => {
                record.session == Some(session) && !record.early_navigation
            }
            CancelScope::Teardown(session) => record.session == Some(session),
            CancelScope::All => true,
        };
        if !hit {
            return false;
        }
        if let Some(record) = self.current.take() {
            self.destroy(record, "cancelled");
        }
        true
    }

    pub fn on_surface_crashed(&mut self, surface: SurfaceId) {
        if self
            .current
            .as_ref()
            .is_some_and(|record| record.surface.id() == surface)
        {
            if let Some(record) = self.current.take() {
                warn!(%surface, url = %record.url, "speculated surface crashed");
                self.destroy(record, "crashed");
            }
        }
    }

    fn supersede(&mut self) {
        if let Some(record) = self.current.take() {
            self.destroy(record, "superseded");
        }
    }

    fn attach(
        &mut self,
        surface: SurfaceHandle,
        session: Option<SessionHandle>,
        url: &str,
        referrer: &str,
        early_navigation: bool,
    ) {
        self.surfaces.observe(
            &surface,
            Arc::new(CrashRelay {
                hook: Arc::clone(&self.crash_hook),
            }),
        );
        self.surfaces.navigate(&surface, url, referrer);
        self.current = Some(SpeculationRecord {
            session,
            url: url.to_string(),
            referrer: referrer.to_string(),
            surface,
            early_navigation,
        });
    }

    fn destroy(&self, record: SpeculationRecord, reason: &'static str) {
        debug!(url = %record.url, surface = %record.surface.id(), reason, "destroying speculation");
        SPECULATION_EVENTS.with_label_values(&[reason]).inc();
        self.surfaces.destroy_surface(record.surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordingSurfaces;
    use parking_lot::Mutex;

    const UID: ClientIdentity = ClientIdentity(10_100);

    fn slot(surfaces: &Arc<RecordingSurfaces>) -> (SpeculationSlot, Arc<Mutex<Vec<SurfaceId>>>) {
        let crashes = Arc::new(Mutex::new(Vec::new()));
        let sink = crashes.clone();
        let hook: CrashHook = Arc::new(move |id| sink.lock().push(id));
        (SpeculationSlot::new(surfaces.clone(), hook), crashes)
    }

    #[test_timeout::timeout]
    fn new_speculation_supersedes_the_previous_one() {
        let surfaces = RecordingSurfaces::new();
        let (mut slot, _) = slot(&surfaces);
        let s = SessionHandle::new();
        assert!(slot.launch_in_hidden(Some(s), UID, "https://a.example/1", "", &LaunchExtras::default()));
        assert!(slot.launch_in_hidden(Some(s), UID, "https://a.example/2", "", &LaunchExtras::default()));
        assert_eq!(surfaces.destroyed().len(), 1);
        assert_eq!(surfaces.live_count(), 1);
        assert_eq!(slot.speculated_url(), Some("https://a.example/2"));
    }

    #[test_timeout::timeout]
    fn extra_headers_are_rejected_without_touching_the_slot() {
        let surfaces = RecordingSurfaces::new();
        let (mut slot, _) = slot(&surfaces);
        let s = SessionHandle::new();
        assert!(slot.launch_in_hidden(Some(s), UID, "https://a.example/", "", &LaunchExtras::default()));
        let mut extras = LaunchExtras::default();
        extras.headers.insert("X-Tracking".into(), "1".into());
        assert!(!slot.launch_in_hidden(Some(s), UID, "https://b.example/", "", &extras));
        assert_eq!(slot.speculated_url(), Some("https://a.example/"));
        assert!(surfaces.destroyed().is_empty());
    }

    #[test_timeout::timeout]
    fn take_requires_owner_url_and_referrer() {
        let surfaces = RecordingSurfaces::new();
        let (mut slot, _) = slot(&surfaces);
        let s = SessionHandle::new();
        let other = SessionHandle::new();
        slot.launch_in_hidden(Some(s), UID, "https://a.example/x#top", "https://ref.example/", &LaunchExtras::default());

        assert!(slot.take(Some(other), false, "https://a.example/x#top", "https://ref.example/").is_none());
        assert!(slot.has_speculation());

        let handed = slot.take(Some(s), true, "https://a.example/x#other", "https://ref.example/");
        assert!(handed.is_some());
        assert!(!slot.has_speculation());
        assert!(surfaces.destroyed().is_empty());
    }

    #[test_timeout::timeout]
    fn mismatched_referrer_destroys_the_speculation() {
        let surfaces = RecordingSurfaces::new();
        let (mut slot, _) = slot(&surfaces);
        let s = SessionHandle::new();
        slot.launch_in_hidden(Some(s), UID, "https://a.example/", "https://ref.example/", &LaunchExtras::default());
        assert!(slot.take(Some(s), false, "https://a.example/", "").is_none());
        assert!(!slot.has_speculation());
        assert_eq!(surfaces.destroyed().len(), 1);
    }

    #[test_timeout::timeout]
    fn early_navigation_survives_routine_cancel_but_not_teardown() {
        let surfaces = RecordingSurfaces::with_spare();
        let (mut slot, _) = slot(&surfaces);
        let s = SessionHandle::new();
        assert!(slot.start_early_navigation(Some(s), UID, "https://a.example/", ""));
        assert_eq!(surfaces.shown().len(), 1);

        assert!(!slot.launch_in_hidden(Some(s), UID, "https://b.example/", "", &LaunchExtras::default()));
        assert!(!slot.cancel(CancelScope::Owner(s)));
        assert!(slot.is_early_navigation());

        assert!(slot.cancel(CancelScope::Teardown(s)));
        assert!(!slot.has_speculation());
    }

    #[test_timeout::timeout]
    fn early_navigation_needs_a_spare_surface() {
        let surfaces = RecordingSurfaces::new();
        let (mut slot, _) = slot(&surfaces);
        let s = SessionHandle::new();
        slot.launch_in_hidden(Some(s), UID, "https://a.example/", "", &LaunchExtras::default());
        assert!(!slot.start_early_navigation(Some(s), UID, "https://b.example/", ""));
        assert_eq!(slot.speculated_url(), Some("https://a.example/"));
        assert!(surfaces.destroyed().is_empty());
    }

    #[test_timeout::timeout]
    fn crash_observer_relays_and_slot_clears() {
        let surfaces = RecordingSurfaces::new();
        let (mut slot, crashes) = slot(&surfaces);
        slot.launch_in_hidden(None, UID, "https://a.example/", "", &LaunchExtras::default());
        let id = surfaces.live().pop().expect("live surface");
        surfaces.crash(id);
        assert_eq!(*crashes.lock(), vec![id]);

        slot.on_surface_crashed(SurfaceId(id.0 + 1000));
        assert!(slot.has_speculation());
        slot.on_surface_crashed(id);
        assert!(!slot.has_speculation());
    }

    #[test_timeout::timeout]
    fn cancel_all_ignores_ownership() {
        let surfaces = RecordingSurfaces::with_spare();
        let (mut slot, _) = slot(&surfaces);
        slot.start_early_navigation(Some(SessionHandle::new()), UID, "https://a.example/", "");
        assert!(!slot.cancel(CancelScope::Owner(SessionHandle::new())));
        assert!(slot.cancel(CancelScope::All));
        assert_eq!(surfaces.live_count(), 0);
    }
}
