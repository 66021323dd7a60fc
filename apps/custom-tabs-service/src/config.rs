use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use custom_tabs_core::{ServiceConfig, SpeculationPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TABS_SERVICE_ADDR {value:?}: {source}")]
    BindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid TABS_CLIENT_PACKAGES entry {0:?} (expected uid=package)")]
    ClientPackage(String),
    #[error("refusing to serve on non-loopback {0}; set TABS_ALLOW_REMOTE_CALLERS=1 behind an authenticating proxy")]
    RemoteBind(SocketAddr),
}

/// How origin relationships are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetLinksMode {
    /// Fetch `/.well-known/assetlinks.json` from the origin over HTTPS.
    Fetch,
    /// Every relationship is reported as undeclared.
    Disabled,
}

impl AssetLinksMode {
    fn from_env() -> Self {
        match std::env::var("TABS_ASSET_LINKS")
            .unwrap_or_else(|_| "fetch".into())
            .as_str()
        {
            "off" | "disabled" => AssetLinksMode::Disabled,
            _ => AssetLinksMode::Fetch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub service: ServiceConfig,
    /// Where throttle counters survive restarts. In-memory when unset.
    pub throttle_store_path: Option<PathBuf>,
    pub client_packages: Vec<(u32, String)>,
    pub asset_links: AssetLinksMode,
    pub asset_links_timeout: Duration,
    pub spare_surfaces: bool,
    pub policy: SpeculationPolicy,
    pub event_buffer: usize,
    pub proc_root: PathBuf,
    pub keep_alive_poll: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let addr = std::env::var("TABS_SERVICE_ADDR").unwrap_or_else(|_| "127.0.0.1:8093".into());
        let bind_addr = addr.parse().map_err(|source| ConfigError::BindAddr {
            value: addr.clone(),
            source,
        })?;
        let bind_addr = check_bind_addr(
            bind_addr,
            flag("TABS_ALLOW_REMOTE_CALLERS").unwrap_or(false),
        )?;
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,custom_tabs_core=debug".into());
        let throttle_store_path = std::env::var("TABS_THROTTLE_STORE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let client_packages = match std::env::var("TABS_CLIENT_PACKAGES") {
            Ok(raw) => parse_client_packages(&raw)?,
            Err(_) => Vec::new(),
        };
        let asset_links_timeout = std::env::var("TABS_ASSET_LINKS_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));
        let defaults = SpeculationPolicy::default();
        let policy = SpeculationPolicy {
            device_allows_prerender: flag("TABS_DEVICE_ALLOWS_PRERENDER")
                .unwrap_or(defaults.device_allows_prerender),
            third_party_cookies_blocked: flag("TABS_THIRD_PARTY_COOKIES_BLOCKED")
                .unwrap_or(defaults.third_party_cookies_blocked),
            preloading_disabled: flag("TABS_PRELOADING_DISABLED")
                .unwrap_or(defaults.preloading_disabled),
            on_cellular: flag("TABS_ON_CELLULAR").unwrap_or(defaults.on_cellular),
        };
        let event_buffer = std::env::var("TABS_EVENT_BUFFER")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(256);
        let proc_root = std::env::var("TABS_PROC_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/proc"));
        let keep_alive_poll = std::env::var("TABS_KEEP_ALIVE_POLL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(500));
        Ok(Self {
            bind_addr,
            log_filter,
            service: ServiceConfig::from_env(),
            throttle_store_path,
            client_packages,
            asset_links: AssetLinksMode::from_env(),
            asset_links_timeout,
            spare_surfaces: flag("TABS_SPARE_SURFACES").unwrap_or(true),
            policy,
            event_buffer,
            proc_root,
            keep_alive_poll,
        })
    }
}

/// Callers identify themselves in request bodies, so the API only trusts
/// processes on the same host unless the operator opts out.
pub fn check_bind_addr(addr: SocketAddr, allow_remote: bool) -> Result<SocketAddr, ConfigError> {
    if addr.ip().is_loopback() || allow_remote {
        Ok(addr)
    } else {
        Err(ConfigError::RemoteBind(addr))
    }
}

fn flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
}

/// Parses `10001=com.example.app,10002=org.example.other`. A uid may appear more
/// than once (shared uids); resolution treats that as ambiguous.
pub fn parse_client_packages(raw: &str) -> Result<Vec<(u32, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (uid, package) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::ClientPackage(entry.to_string()))?;
            let uid = uid
                .trim()
                .parse()
                .map_err(|_| ConfigError::ClientPackage(entry.to_string()))?;
            let package = package.trim();
            if package.is_empty() {
                return Err(ConfigError::ClientPackage(entry.to_string()));
            }
            Ok((uid, package.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn client_packages_parse_and_skip_blank_entries() {
        let parsed = parse_client_packages(" 10001=com.example.app, ,10002 = org.other ")
            .expect("valid table");
        assert_eq!(
            parsed,
            vec![
                (10_001, "com.example.app".to_string()),
                (10_002, "org.other".to_string())
            ]
        );
    }

    #[test_timeout::timeout]
    fn remote_bind_needs_an_explicit_opt_in() {
        let local: SocketAddr = "127.0.0.1:8093".parse().expect("addr");
        let remote: SocketAddr = "0.0.0.0:8093".parse().expect("addr");
        assert_eq!(check_bind_addr(local, false).ok(), Some(local));
        assert!(matches!(
            check_bind_addr(remote, false),
            Err(ConfigError::RemoteBind(addr)) if addr == remote
        ));
        assert_eq!(check_bind_addr(remote, true).ok(), Some(remote));
    }

    #[test_timeout::timeout]
    fn malformed_client_package_is_reported() {
        assert!(matches!(
            parse_client_packages("10001"),
            Err(ConfigError::ClientPackage(entry)) if entry == "10001"
        ));
        assert!(parse_client_packages("abc=com.example").is_err());
        assert!(parse_client_packages("10001=").is_err());
    }
}
