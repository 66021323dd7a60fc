//! JSON API over the inbound connection calls.
//!
//! The caller's uid and pid are taken from the request body, not from the
//! transport. This surface is a trusted local harness: the per-uid checks in
//! the core only hold against honest callers, which is why the listener is
//! restricted to loopback unless `TABS_ALLOW_REMOTE_CALLERS` is set.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use custom_tabs_core::{
    CallerInfo, ClientIdentity, KeepAliveTarget, LaunchExtras, Navigation, NavigationEvent,
    Origin, PredictionOutcome, Relation, SessionCallback, SessionHandle, SessionPolicy, SurfaceId,
    ThrottlerState, TrimLevel,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::ClientEvent;
use crate::metrics;
use crate::state::AppState;
use crate::surfaces::SurfaceInfo;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ApiErrorBody {
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Service calls may block on the owner thread; keep them off the async workers.
async fn offload<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::Internal(format!("blocking task failed: {err}")))
}

/// Self-reported caller credentials.
#[derive(Debug, Clone, Copy, Deserialize)]
struct CallerBody {
    uid: u32,
    #[serde(default)]
    pid: Option<u32>,
}

impl From<CallerBody> for CallerInfo {
    fn from(body: CallerBody) -> Self {
        CallerInfo {
            uid: ClientIdentity(body.uid),
            pid: body.pid,
        }
    }
}

#[derive(Serialize)]
struct Accepted {
    ok: bool,
}

fn accepted(op: &'static str, ok: bool) -> Json<Accepted> {
    metrics::record_call(op, ok);
    Json(Accepted { ok })
}

fn session_handle(id: Uuid) -> Result<SessionHandle, ApiError> {
    let handle = SessionHandle::from_uuid(id);
    if handle.is_nil() {
        return Err(ApiError::BadRequest("nil session id".into()));
    }
    Ok(handle)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    sessions: usize,
    speculating: bool,
    warmup_finished: bool,
    live_surfaces: usize,
    presented_surfaces: usize,
}

async fn health(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let probe = state.clone();
    let speculating = offload(move || probe.service().has_speculation()).await?;
    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        sessions: state.service().registry().session_count(),
        speculating,
        warmup_finished: state.service().has_warmup_finished(),
        live_surfaces: state.surfaces().live_count(),
        presented_surfaces: state.presented_count(),
    }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(flatten)]
    caller: CallerBody,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    policy: Option<SessionPolicy>,
}

#[derive(Serialize)]
struct RegisterResponse {
    session_id: Uuid,
    package: Option<String>,
}

async fn register_session(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<RegisterResponse> {
    let handle = match body.session_id {
        Some(id) => session_handle(id)?,
        None => SessionHandle::new(),
    };
    let existed = state.sink(handle).is_some();
    let sink: Arc<dyn SessionCallback> = state.open_sink(handle);
    let ok = state
        .service()
        .register_session(handle, body.caller.into(), Some(sink));
    metrics::record_call("register_session", ok);
    if !ok {
        if !existed {
            state.forget_sink(handle);
        }
        return Err(ApiError::Conflict("session could not be registered"));
    }
    if let Some(policy) = body.policy {
        state.service().set_session_policy(handle, policy);
    }
    Ok(Json(RegisterResponse {
        session_id: handle.as_uuid(),
        package: state
            .service()
            .registry()
            .package_name(handle)
            .map(|p| p.as_str().to_string()),
    }))
}

async fn evict_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    let service = state.service().clone();
    let evicted = offload(move || service.evict_session(handle)).await?;
    state.forget_sink(handle);
    if !evicted {
        return Err(ApiError::NotFound("unknown session"));
    }
    Ok(accepted("evict_session", true))
}

async fn release_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    Ok(accepted(
        "release_session",
        state.service().release_session(handle),
    ))
}

async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(policy): Json<SessionPolicy>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    if !state.service().set_session_policy(handle, policy) {
        return Err(ApiError::NotFound("unknown session"));
    }
    Ok(accepted("set_session_policy", true))
}

async fn warmup(
    State(state): State<AppState>,
    Json(caller): Json<CallerBody>,
) -> ApiResult<Accepted> {
    Ok(accepted("warmup", state.service().warmup(caller.into())))
}

#[derive(Deserialize)]
struct MayLaunchRequest {
    #[serde(flatten)]
    caller: CallerBody,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    other_likely: Option<Vec<String>>,
    #[serde(default)]
    extras: LaunchExtras,
}

async fn may_launch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<MayLaunchRequest>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    let ok = state.service().may_launch_url(
        handle,
        body.caller.into(),
        body.url.as_deref(),
        body.other_likely.as_deref(),
        &body.extras,
    );
    Ok(accepted("may_launch_url", ok))
}

#[derive(Deserialize)]
struct NavigateRequest {
    #[serde(flatten)]
    caller: CallerBody,
    url: String,
    #[serde(default)]
    referrer: String,
}

#[derive(Serialize)]
struct NavigateResponse {
    surface_id: Option<u64>,
    speculated: bool,
    outcome: PredictionOutcome,
}

async fn navigate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NavigateRequest>,
) -> ApiResult<NavigateResponse> {
    let handle = session_handle(id)?;
    let service = state.service().clone();
    let caller: CallerInfo = body.caller.into();
    let result = offload(move || {
        service.handle_navigation(Some(handle), caller, &body.url, &body.referrer)
    })
    .await?;
    let (surface, speculated) = match result.navigation {
        Navigation::Speculated(surface) => (Some(surface), true),
        Navigation::Fresh(surface) => (Some(surface), false),
        Navigation::Unavailable => (None, false),
    };
    metrics::record_call("navigate", surface.is_some());
    Ok(Json(NavigateResponse {
        surface_id: surface.map(|s| state.present(s)),
        speculated,
        outcome: result.outcome,
    }))
}

async fn cancel_session_speculation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    let service = state.service().clone();
    let cancelled = offload(move || service.cancel_speculation(Some(handle))).await?;
    Ok(accepted("cancel_speculation", cancelled))
}

async fn cancel_all_speculation(State(state): State<AppState>) -> ApiResult<Accepted> {
    let service = state.service().clone();
    let cancelled = offload(move || service.cancel_speculation(None)).await?;
    Ok(accepted("cancel_speculation", cancelled))
}

#[derive(Deserialize)]
struct ValidateRequest {
    relation: Relation,
    origin: String,
    #[serde(default)]
    use_cached: bool,
}

async fn validate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ValidateRequest>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    let origin = Origin::parse(&body.origin)
        .ok_or_else(|| ApiError::BadRequest(format!("not an origin: {}", body.origin)))?;
    let started = state
        .service()
        .verify_relationship(handle, body.relation, origin, body.use_cached);
    Ok(accepted("verify_relationship", started))
}

#[derive(Deserialize)]
struct FirstPartyQuery {
    origin: String,
}

#[derive(Serialize)]
struct FirstPartyResponse {
    first_party: bool,
}

async fn first_party(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<FirstPartyQuery>,
) -> ApiResult<FirstPartyResponse> {
    let handle = session_handle(id)?;
    let first_party = Origin::parse(&query.origin)
        .is_some_and(|origin| state.service().is_first_party_origin(handle, &origin));
    Ok(Json(FirstPartyResponse { first_party }))
}

async fn bind_keep_alive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(target): Json<KeepAliveTarget>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    let service = state.service().clone();
    let bound = offload(move || service.bind_keep_alive(handle, &target)).await?;
    Ok(accepted("bind_keep_alive", bound))
}

async fn unbind_keep_alive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    Ok(accepted(
        "unbind_keep_alive",
        state.service().unbind_keep_alive(handle),
    ))
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<ClientEvent>,
}

async fn poll_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<EventsResponse> {
    let handle = session_handle(id)?;
    let sink = state
        .sink(handle)
        .ok_or(ApiError::NotFound("unknown session"))?;
    Ok(Json(EventsResponse {
        events: sink.drain(),
    }))
}

#[derive(Deserialize)]
struct NavigationEventRequest {
    event: NavigationEvent,
}

async fn navigation_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NavigationEventRequest>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    Ok(accepted(
        "navigation_event",
        state.service().notify_navigation_event(handle, body.event),
    ))
}

#[derive(Deserialize)]
struct ExtraCallbackRequest {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

async fn extra_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExtraCallbackRequest>,
) -> ApiResult<Accepted> {
    let handle = session_handle(id)?;
    Ok(accepted(
        "extra_callback",
        state
            .service()
            .send_extra_callback(handle, &body.name, &body.args),
    ))
}

#[derive(Deserialize)]
struct TrimRequest {
    level: TrimLevel,
}

#[derive(Serialize)]
struct TrimResponse {
    evicted: usize,
}

async fn trim_memory(
    State(state): State<AppState>,
    Json(body): Json<TrimRequest>,
) -> ApiResult<TrimResponse> {
    let service = state.service().clone();
    let evicted = offload(move || service.trim_memory(body.level)).await?;
    if evicted > 0 {
        debug!(evicted, "dropping event buffers of evicted sessions");
        let registry = state.service().registry().clone();
        state.retain_sinks(|handle| registry.is_registered(handle));
    }
    Ok(Json(TrimResponse { evicted }))
}

#[derive(Deserialize)]
struct EarlyNavigationRequest {
    #[serde(flatten)]
    caller: CallerBody,
    #[serde(default)]
    session_id: Option<Uuid>,
    url: String,
    #[serde(default)]
    referrer: String,
}

async fn early_navigation(
    State(state): State<AppState>,
    Json(body): Json<EarlyNavigationRequest>,
) -> ApiResult<Accepted> {
    let handle = body.session_id.map(session_handle).transpose()?;
    let service = state.service().clone();
    let caller: CallerInfo = body.caller.into();
    let started = offload(move || {
        service.start_early_navigation(handle, caller, &body.url, &body.referrer)
    })
    .await?;
    Ok(accepted("start_early_navigation", started))
}

async fn surface_info(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<SurfaceInfo> {
    state
        .surfaces()
        .info(SurfaceId(id))
        .map(Json)
        .ok_or(ApiError::NotFound("unknown surface"))
}

async fn close_surface(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Accepted> {
    if !state.close_surface(id) {
        return Err(ApiError::NotFound("surface is not presented"));
    }
    Ok(accepted("close_surface", true))
}

async fn surface_crashed(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Accepted> {
    let reported = state.surfaces().report_crash(SurfaceId(id));
    if reported && state.close_surface(id) {
        warn!(surface = id, "presented surface crashed");
    }
    Ok(accepted("surface_crashed", reported))
}

async fn throttle_state(
    State(state): State<AppState>,
    Path(uid): Path<u32>,
) -> ApiResult<ThrottlerState> {
    state
        .service()
        .throttler()
        .state(ClientIdentity(uid))
        .map(Json)
        .ok_or(ApiError::NotFound("no throttle state for uid"))
}

async fn reset_throttle(
    State(state): State<AppState>,
    Path(uid): Path<u32>,
) -> ApiResult<Accepted> {
    state.service().reset_throttling(ClientIdentity(uid));
    Ok(accepted("reset_throttling", true))
}

async fn ban_client(State(state): State<AppState>, Path(uid): Path<u32>) -> ApiResult<Accepted> {
    warn!(uid, "client banned by operator");
    state.service().ban(ClientIdentity(uid));
    Ok(accepted("ban", true))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/warmup", post(warmup))
        .route("/sessions", post(register_session))
        .route("/sessions/:id", axum::routing::delete(evict_session))
        .route("/sessions/:id/release", post(release_session))
        .route("/sessions/:id/policy", put(update_policy))
        .route("/sessions/:id/may-launch", post(may_launch))
        .route("/sessions/:id/navigate", post(navigate))
        .route("/sessions/:id/cancel", post(cancel_session_speculation))
        .route("/sessions/:id/validate", post(validate))
        .route("/sessions/:id/first-party", get(first_party))
        .route(
            "/sessions/:id/keep-alive",
            post(bind_keep_alive).delete(unbind_keep_alive),
        )
        .route("/sessions/:id/events", get(poll_events))
        .route("/sessions/:id/navigation-events", post(navigation_event))
        .route("/sessions/:id/extras", post(extra_callback))
        .route("/speculation", axum::routing::delete(cancel_all_speculation))
        .route("/early-navigation", post(early_navigation))
        .route("/trim-memory", post(trim_memory))
        .route("/surfaces/:id", get(surface_info).delete(close_surface))
        .route("/surfaces/:id/crash", post(surface_crashed))
        .route("/clients/:uid/throttle", get(throttle_state))
        .route("/clients/:uid/throttle/reset", post(reset_throttle))
        .route("/clients/:uid/ban", post(ban_client))
        .with_state(state)
}
