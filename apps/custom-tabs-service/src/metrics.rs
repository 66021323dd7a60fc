use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BOOT_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new("tabs_service_boot_total", "service boots")).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static API_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tabs_api_calls_total", "inbound api calls by operation and result"),
        &["op", "result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PRECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "tabs_preconnects_total",
        "preconnect requests issued",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "tabs_client_events_dropped_total",
        "client events discarded because the session buffer was full",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn record_call(op: &str, ok: bool) {
    API_CALLS
        .with_label_values(&[op, if ok { "ok" } else { "rejected" }])
        .inc();
}

/// Service series followed by the core's series, in text exposition format.
pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer.extend(custom_tabs_core::metrics::gather());
    buffer
}
