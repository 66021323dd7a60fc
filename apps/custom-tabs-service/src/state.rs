use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use custom_tabs_core::memory::InMemoryThrottleStore;
use custom_tabs_core::{
    ConnectionService, JsonFileThrottleStore, ServiceError, ServiceParts, SessionHandle,
    SurfaceFactory, SurfaceHandle, SystemClock, ThrottleStore,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::info;

use crate::asset_links::{AssetLinksError, AssetLinksVerifier};
use crate::config::AppConfig;
use crate::environment::HostEnvironment;
use crate::events::EventBuffer;
use crate::identities::PackageTable;
use crate::keep_alive::ProcessKeepAlive;
use crate::surfaces::HeadlessSurfaces;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    AssetLinks(#[from] AssetLinksError),
}

struct StateInner {
    start: Instant,
    service: ConnectionService,
    surfaces: Arc<HeadlessSurfaces>,
    sinks: Mutex<HashMap<SessionHandle, Arc<EventBuffer>>>,
    presented: Mutex<HashMap<u64, SurfaceHandle>>,
    event_capacity: usize,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

impl AppState {
    pub fn new(
        service: ConnectionService,
        surfaces: Arc<HeadlessSurfaces>,
        event_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(StateInner {
                start: Instant::now(),
                service,
                surfaces,
                sinks: Mutex::new(HashMap::new()),
                presented: Mutex::new(HashMap::new()),
                event_capacity,
            }),
        }
    }

    pub fn service(&self) -> &ConnectionService {
        &self.inner.service
    }

    pub fn surfaces(&self) -> &HeadlessSurfaces {
        &self.inner.surfaces
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start.elapsed().as_secs()
    }

    /// Event buffer for a session, created on first use.
    pub fn open_sink(&self, handle: SessionHandle) -> Arc<EventBuffer> {
        let mut sinks = self.inner.sinks.lock();
        Arc::clone(
            sinks
                .entry(handle)
                .or_insert_with(|| EventBuffer::new(self.inner.event_capacity)),
        )
    }

    pub fn sink(&self, handle: SessionHandle) -> Option<Arc<EventBuffer>> {
        self.inner.sinks.lock().get(&handle).cloned()
    }

    pub fn forget_sink(&self, handle: SessionHandle) {
        self.inner.sinks.lock().remove(&handle);
    }

    pub fn retain_sinks(&self, mut keep: impl FnMut(SessionHandle) -> bool) {
        self.inner.sinks.lock().retain(|handle, _| keep(*handle));
    }

    /// Keeps a surface that was handed to the embedder until it is closed.
    pub fn present(&self, surface: SurfaceHandle) -> u64 {
        let id = surface.id().0;
        self.inner.presented.lock().insert(id, surface);
        id
    }

    pub fn is_presented(&self, id: u64) -> bool {
        self.inner.presented.lock().contains_key(&id)
    }

    pub fn close_surface(&self, id: u64) -> bool {
        let surface = self.inner.presented.lock().remove(&id);
        match surface {
            Some(surface) => {
                self.inner.surfaces.destroy_surface(surface);
                true
            }
            None => false,
        }
    }

    pub fn presented_count(&self) -> usize {
        self.inner.presented.lock().len()
    }

    /// Destroys presented surfaces and stops the connection service.
    pub fn shutdown(&self) {
        let presented: Vec<SurfaceHandle> =
            self.inner.presented.lock().drain().map(|(_, s)| s).collect();
        for surface in presented {
            self.inner.surfaces.destroy_surface(surface);
        }
        self.inner.service.shutdown();
    }
}

/// Wires the host collaborators from configuration. Returns the environment
/// separately so the caller can open the startup gate once serving.
pub fn build_state(
    cfg: &AppConfig,
    runtime: Handle,
) -> Result<(AppState, Arc<HostEnvironment>), StateError> {
    let surfaces = HeadlessSurfaces::new(cfg.spare_surfaces);
    let identities = Arc::new(PackageTable::new(&cfg.client_packages));
    let verifier = Arc::new(AssetLinksVerifier::new(
        cfg.asset_links,
        cfg.asset_links_timeout,
        runtime.clone(),
    )?);
    let keep_alive = Arc::new(ProcessKeepAlive::new(&cfg.proc_root, cfg.keep_alive_poll));
    let environment = Arc::new(HostEnvironment::new(&cfg.proc_root, cfg.policy, runtime));
    let throttle_store: Arc<dyn ThrottleStore> = match &cfg.throttle_store_path {
        Some(path) => Arc::new(JsonFileThrottleStore::new(path.clone())),
        None => InMemoryThrottleStore::new(),
    };
    info!(
        clients = identities.len(),
        persistent_throttle = cfg.throttle_store_path.is_some(),
        "collaborators ready"
    );

    let service = ConnectionService::start(ServiceParts {
        config: cfg.service.clone(),
        surfaces: surfaces.clone(),
        identities,
        verifier,
        keep_alive,
        environment: environment.clone(),
        throttle_store,
        clock: Arc::new(SystemClock),
    })?;
    Ok((AppState::new(service, surfaces, cfg.event_buffer), environment))
}
