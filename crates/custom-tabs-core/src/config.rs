use std::time::Duration;

/// Behaviour switches for the connection service, captured once at construction.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum speculative attempts per client identity inside one window.
    pub throttle_capacity: u32,
    pub throttle_window: Duration,
    /// Ban an identity after this many consecutive bad predictions.
    pub ban_after_bad_predictions: Option<u32>,
    /// Load speculated URLs in a hidden surface. When off, only a spare surface
    /// is prepared and the URL is preconnected.
    pub hidden_tab_speculation: bool,
    /// Delay before re-posting owner-thread work that arrived before startup.
    pub startup_retry_delay: Duration,
    /// How many times spare-surface preparation is re-posted while startup is pending.
    pub max_startup_retries: u32,
    /// Trace every inbound call at debug level.
    pub log_requests: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            throttle_capacity: 10,
            throttle_window: Duration::from_secs(60),
            ban_after_bad_predictions: None,
            hidden_tab_speculation: true,
            startup_retry_delay: Duration::from_millis(50),
            max_startup_retries: 100,
            log_requests: false,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let throttle_capacity = env_parse("TABS_THROTTLE_CAPACITY")
            .filter(|v: &u32| *v > 0)
            .unwrap_or(defaults.throttle_capacity);
        let throttle_window = env_parse("TABS_THROTTLE_WINDOW_MS")
            .filter(|v: &u64| *v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.throttle_window);
        let ban_after_bad_predictions =
            env_parse("TABS_BAN_AFTER_BAD_PREDICTIONS").filter(|v: &u32| *v > 0);
        let hidden_tab_speculation =
            env_flag("TABS_HIDDEN_TAB_SPECULATION").unwrap_or(defaults.hidden_tab_speculation);
        let startup_retry_delay = env_parse("TABS_STARTUP_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.startup_retry_delay);
        let max_startup_retries =
            env_parse("TABS_MAX_STARTUP_RETRIES").unwrap_or(defaults.max_startup_retries);
        let log_requests = env_flag("TABS_LOG_REQUESTS").unwrap_or(defaults.log_requests);
        Self {
            throttle_capacity,
            throttle_window,
            ban_after_bad_predictions,
            hidden_tab_speculation,
            startup_retry_delay,
            max_startup_retries,
            log_requests,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub(crate) fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
}
