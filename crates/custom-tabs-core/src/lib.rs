//! Session registry and speculative preload coordination for custom tabs.
//!
//! Untrusted clients register sessions, hint at URLs they are about to open,
//! and later hand over the real navigation. The service may preconnect or
//! render the hinted page in a hidden surface ahead of time; the single
//! speculation slot, the per-client throttle and the session registry keep
//! that work bounded and attributable.

mod callback;
pub mod clock;
pub mod collab;
pub mod config;
pub mod connection;
pub mod memory;
pub mod metrics;
pub mod origin;
pub mod owner;
pub mod registry;
pub mod session;
pub mod speculation;
pub mod throttle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collab::{
    BrowserEnvironment, IdentityResolver, KeepAliveConnection, KeepAliveConnector, KeepAliveError,
    KeepAliveTarget, NavigationEvent, OriginVerifier, Relation, SessionCallback,
    SpeculationPolicy, SurfaceFactory, SurfaceHandle, SurfaceId, SurfaceObserver, VerifyCallback,
    VerifyError,
};
pub use config::ServiceConfig;
pub use connection::{
    ConnectionService, Navigation, NavigationResult, ServiceError, ServiceParts, TrimLevel,
};
pub use origin::Origin;
pub use registry::{ClientRegistry, DisconnectHook, RegistryParts};
pub use session::{
    CallerInfo, ClientIdentity, PackageIdentity, PredictionOutcome, SessionHandle, SessionPolicy,
    WarmupState,
};
pub use speculation::{CancelScope, LaunchExtras, SpeculationSlot};
pub use throttle::{
    JsonFileThrottleStore, ThrottleDecision, ThrottleSettings, ThrottleStore, ThrottleStoreError,
    Throttler, ThrottlerState,
};
