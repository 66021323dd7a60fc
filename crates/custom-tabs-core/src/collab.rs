//! Capabilities the core consumes from its embedder.
//!
//! Everything here is implemented outside the core: the rendering layer owns
//! surfaces, the platform resolves identities and verifies origins, and the
//! host process decides what "foreground" and "startup complete" mean.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::origin::Origin;
use crate::session::{CallerInfo, ClientIdentity, PackageIdentity};

/// Identifier of a live renderer/page surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Exclusive ownership token for a surface. Not `Clone`: whoever holds the
/// handle is the only party allowed to navigate, show or destroy it.
#[derive(Debug, PartialEq, Eq)]
pub struct SurfaceHandle {
    id: SurfaceId,
}

impl SurfaceHandle {
    pub fn new(id: SurfaceId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }
}

/// Crash/detach notifications for a surface. May fire on any thread.
pub trait SurfaceObserver: Send + Sync {
    fn on_crashed(&self, surface: SurfaceId);
}

pub trait SurfaceFactory: Send + Sync {
    /// Fresh invisible surface, or `None` when no renderer is available.
    fn create_hidden_surface(&self, identity: ClientIdentity) -> Option<SurfaceHandle>;
    /// Visible surface for a navigation that was not speculated.
    fn create_visible_surface(&self, identity: ClientIdentity) -> Option<SurfaceHandle>;
    /// Takes the pre-warmed spare surface if one exists.
    fn take_spare_surface(&self) -> Option<SurfaceHandle>;
    /// Makes sure a spare surface exists. Returns whether one is ready.
    fn prepare_spare_surface(&self) -> bool;
    fn has_spare_surface(&self) -> bool;
    fn navigate(&self, surface: &SurfaceHandle, url: &str, referrer: &str);
    fn show(&self, surface: &SurfaceHandle);
    fn observe(&self, surface: &SurfaceHandle, observer: Arc<dyn SurfaceObserver>);
    fn destroy_surface(&self, surface: SurfaceHandle);
}

pub trait IdentityResolver: Send + Sync {
    /// `None` when the uid maps to zero or several packages.
    fn resolve_identity(&self, uid: ClientIdentity) -> Option<PackageIdentity>;
}

/// Relation a client claims to hold with an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    UseAsOrigin,
    HandleAllUrls,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::UseAsOrigin => "use_as_origin",
            Relation::HandleAllUrls => "handle_all_urls",
        }
    }

    /// Digital Asset Links permission string for the relation.
    pub fn asset_links_permission(self) -> &'static str {
        match self {
            Relation::UseAsOrigin => "delegate_permission/common.use_as_origin",
            Relation::HandleAllUrls => "delegate_permission/common.handle_all_urls",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("verification backend unavailable: {0}")]
    Unavailable(String),
    #[error("relationship not declared")]
    NotDeclared,
}

pub type VerifyCallback = Box<dyn FnOnce(Result<(), VerifyError>) + Send>;

pub trait OriginVerifier: Send + Sync {
    /// Verifies that `package` may claim `relation` over `origin`. Implementations
    /// must call `on_result` exactly once, including on internal failure.
    fn verify_origin(
        &self,
        package: &PackageIdentity,
        origin: &Origin,
        relation: Relation,
        on_result: VerifyCallback,
    );
}

/// Where a keep-alive binding should point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveTarget {
    pub package: String,
    pub service: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum KeepAliveError {
    #[error("target process is not reachable: {0}")]
    Unreachable(String),
    #[error("keep-alive binding refused: {0}")]
    Refused(String),
}

/// Live binding. Dropping it or calling `release` tears the binding down.
pub trait KeepAliveConnection: Send {
    fn release(self: Box<Self>);
}

pub type DeathNotice = Box<dyn FnOnce() + Send>;

pub trait KeepAliveConnector: Send + Sync {
    /// Binds to `target`. `on_death` fires at most once if the remote process dies.
    fn bind(
        &self,
        package: &PackageIdentity,
        target: &KeepAliveTarget,
        on_death: DeathNotice,
    ) -> Result<Box<dyn KeepAliveConnection>, KeepAliveError>;
}

/// Snapshot of the environmental gates on speculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculationPolicy {
    pub device_allows_prerender: bool,
    pub third_party_cookies_blocked: bool,
    pub preloading_disabled: bool,
    pub on_cellular: bool,
}

impl Default for SpeculationPolicy {
    fn default() -> Self {
        Self {
            device_allows_prerender: true,
            third_party_cookies_blocked: false,
            preloading_disabled: false,
            on_cellular: false,
        }
    }
}

pub trait BrowserEnvironment: Send + Sync {
    fn is_caller_foreground(&self, _caller: &CallerInfo) -> bool {
        true
    }
    fn is_startup_complete(&self) -> bool;
    /// Heavyweight one-time initialization. Runs on the owner thread.
    fn initialize(&self);
    fn speculation_policy(&self) -> SpeculationPolicy {
        SpeculationPolicy::default()
    }
    fn preconnect(&self, url: &str);
}

/// Navigation events forwarded to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationEvent {
    Started,
    Finished,
    Failed,
    Aborted,
    TabShown,
    TabHidden,
}

/// Client-supplied notification sink. Implementations are untrusted: every call
/// made by the core is isolated so that a panic here cannot escape.
pub trait SessionCallback: Send + Sync {
    fn on_warmup_completed(&self) {}
    fn on_relationship_validation_result(&self, _relation: Relation, _origin: &Origin, _ok: bool) {
    }
    fn on_navigation_event(&self, _event: NavigationEvent) {}
    fn extra_callback(&self, _name: &str, _args: &serde_json::Value) {}
}
