//! Surface bookkeeping for a host without a renderer attached.
//!
//! Surfaces are records of what would be loaded where; the embedder polls the
//! navigation endpoints to learn which surface to present.

use std::collections::HashMap;
use std::sync::Arc;

use custom_tabs_core::{
    ClientIdentity, SurfaceFactory, SurfaceHandle, SurfaceId, SurfaceObserver,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Hidden,
    Visible,
    Spare,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurfaceInfo {
    pub id: u64,
    pub kind: SurfaceKind,
    pub owner: Option<u32>,
    pub url: Option<String>,
    pub referrer: Option<String>,
    pub visible: bool,
}

struct Entry {
    info: SurfaceInfo,
    observer: Option<Arc<dyn SurfaceObserver>>,
}

#[derive(Default)]
struct Surfaces {
    next: u64,
    entries: HashMap<SurfaceId, Entry>,
    spare: Option<SurfaceId>,
}

impl Surfaces {
    fn allocate(&mut self, kind: SurfaceKind, owner: Option<ClientIdentity>) -> SurfaceId {
        self.next += 1;
        let id = SurfaceId(self.next);
        self.entries.insert(
            id,
            Entry {
                info: SurfaceInfo {
                    id: id.0,
                    kind,
                    owner: owner.map(|uid| uid.0),
                    url: None,
                    referrer: None,
                    visible: kind == SurfaceKind::Visible,
                },
                observer: None,
            },
        );
        id
    }
}

pub struct HeadlessSurfaces {
    state: Mutex<Surfaces>,
    spare_enabled: bool,
}

impl HeadlessSurfaces {
    pub fn new(spare_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Surfaces::default()),
            spare_enabled,
        })
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn info(&self, id: SurfaceId) -> Option<SurfaceInfo> {
        self.state.lock().entries.get(&id).map(|e| e.info.clone())
    }

    /// Reports a renderer loss for `id` to whoever observes it.
    pub fn report_crash(&self, id: SurfaceId) -> bool {
        let observer = {
            let state = self.state.lock();
            match state.entries.get(&id) {
                Some(entry) => entry.observer.clone(),
                None => return false,
            }
        };
        if let Some(observer) = observer {
            observer.on_crashed(id);
        }
        true
    }
}

impl SurfaceFactory for HeadlessSurfaces {
    fn create_hidden_surface(&self, identity: ClientIdentity) -> Option<SurfaceHandle> {
        let id = self.state.lock().allocate(SurfaceKind::Hidden, Some(identity));
        debug!(surface = %id, %identity, "hidden surface created");
        Some(SurfaceHandle::new(id))
    }

    fn create_visible_surface(&self, identity: ClientIdentity) -> Option<SurfaceHandle> {
        let id = self.state.lock().allocate(SurfaceKind::Visible, Some(identity));
        Some(SurfaceHandle::new(id))
    }

    fn take_spare_surface(&self) -> Option<SurfaceHandle> {
        self.state.lock().spare.take().map(SurfaceHandle::new)
    }

    fn prepare_spare_surface(&self) -> bool {
        if !self.spare_enabled {
            return false;
        }
        let mut state = self.state.lock();
        if state.spare.is_none() {
            let id = state.allocate(SurfaceKind::Spare, None);
            state.spare = Some(id);
            debug!(surface = %id, "spare surface prepared");
        }
        true
    }

    fn has_spare_surface(&self) -> bool {
        self.state.lock().spare.is_some()
    }

    fn navigate(&self, surface: &SurfaceHandle, url: &str, referrer: &str) {
        if let Some(entry) = self.state.lock().entries.get_mut(&surface.id()) {
            entry.info.url = Some(url.to_string());
            entry.info.referrer = (!referrer.is_empty()).then(|| referrer.to_string());
        }
    }

    fn show(&self, surface: &SurfaceHandle) {
        if let Some(entry) = self.state.lock().entries.get_mut(&surface.id()) {
            entry.info.visible = true;
        }
    }

    fn observe(&self, surface: &SurfaceHandle, observer: Arc<dyn SurfaceObserver>) {
        if let Some(entry) = self.state.lock().entries.get_mut(&surface.id()) {
            entry.observer = Some(observer);
        }
    }

    fn destroy_surface(&self, surface: SurfaceHandle) {
        let mut state = self.state.lock();
        let id = surface.id();
        state.entries.remove(&id);
        if state.spare == Some(id) {
            state.spare = None;
        }
        debug!(surface = %id, "surface destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn spare_is_prepared_once_and_taken_once() {
        let surfaces = HeadlessSurfaces::new(true);
        assert!(surfaces.prepare_spare_surface());
        assert!(surfaces.prepare_spare_surface());
        assert_eq!(surfaces.live_count(), 1);

        let spare = surfaces.take_spare_surface().expect("spare ready");
        assert!(!surfaces.has_spare_surface());
        surfaces.navigate(&spare, "https://a.example/", "");
        surfaces.show(&spare);
        let info = surfaces.info(spare.id()).expect("tracked");
        assert!(info.visible);
        assert_eq!(info.url.as_deref(), Some("https://a.example/"));
        assert_eq!(info.referrer, None);
    }

    #[test_timeout::timeout]
    fn spare_preparation_can_be_disabled() {
        let surfaces = HeadlessSurfaces::new(false);
        assert!(!surfaces.prepare_spare_surface());
        assert!(surfaces.take_spare_surface().is_none());
    }

    #[test_timeout::timeout]
    fn destroyed_surfaces_are_forgotten() {
        let surfaces = HeadlessSurfaces::new(true);
        let hidden = surfaces
            .create_hidden_surface(ClientIdentity(10_001))
            .expect("hidden");
        let id = hidden.id();
        assert_eq!(surfaces.info(id).map(|i| i.kind), Some(SurfaceKind::Hidden));
        surfaces.destroy_surface(hidden);
        assert!(surfaces.info(id).is_none());
        assert!(!surfaces.report_crash(id));
    }
}
