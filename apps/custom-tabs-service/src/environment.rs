use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use custom_tabs_core::{BrowserEnvironment, CallerInfo, SpeculationPolicy};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::metrics::PRECONNECTS;

/// Scheduler cgroups that mark a process as backgrounded.
const BACKGROUND_GROUPS: &[&str] = &["bg_non_interactive", "background"];

pub struct HostEnvironment {
    proc_root: PathBuf,
    started: AtomicBool,
    initialized: AtomicBool,
    policy: Mutex<SpeculationPolicy>,
    client: reqwest::Client,
    runtime: Handle,
}

impl HostEnvironment {
    pub fn new(proc_root: impl Into<PathBuf>, policy: SpeculationPolicy, runtime: Handle) -> Self {
        Self {
            proc_root: proc_root.into(),
            started: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            policy: Mutex::new(policy),
            client: reqwest::Client::new(),
            runtime,
        }
    }

    /// Called once the listener is up; work deferred until then may proceed.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_policy(&self, policy: SpeculationPolicy) {
        *self.policy.lock() = policy;
    }

    fn is_background(&self, pid: u32) -> bool {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        match std::fs::read_to_string(&path) {
            Ok(contents) => contents
                .lines()
                .any(|line| BACKGROUND_GROUPS.iter().any(|group| line.contains(group))),
            Err(_) => false,
        }
    }
}

/// Scheme-less hints (`www.example.com`) are preconnected over https.
fn preconnect_target(url: &str) -> Option<url::Url> {
    let url = url.trim();
    url::Url::parse(url)
        .or_else(|_| url::Url::parse(&format!("https://{url}")))
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
}

impl BrowserEnvironment for HostEnvironment {
    fn is_caller_foreground(&self, caller: &CallerInfo) -> bool {
        match caller.pid {
            Some(pid) => !self.is_background(pid),
            None => true,
        }
    }

    fn is_startup_complete(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("browser host initialized");
        }
    }

    fn speculation_policy(&self) -> SpeculationPolicy {
        *self.policy.lock()
    }

    fn preconnect(&self, url: &str) {
        let Some(target) = preconnect_target(url) else {
            return;
        };
        PRECONNECTS.inc();
        let client = self.client.clone();
        self.runtime.spawn(async move {
            match client.head(target.clone()).send().await {
                Ok(resp) => debug!(url = %target, status = resp.status().as_u16(), "preconnected"),
                Err(err) => debug!(url = %target, error = %err, "preconnect failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(root: &std::path::Path) -> HostEnvironment {
        HostEnvironment::new(root, SpeculationPolicy::default(), Handle::current())
    }

    #[test_timeout::tokio_timeout_test]
    async fn background_cgroup_marks_caller_as_not_foreground() {
        let root = tempfile::tempdir().expect("tempdir");
        for (pid, cgroup) in [(11, "3:cpu:/bg_non_interactive\n"), (12, "3:cpu:/\n")] {
            let dir = root.path().join(pid.to_string());
            std::fs::create_dir_all(&dir).expect("proc dir");
            std::fs::write(dir.join("cgroup"), cgroup).expect("cgroup");
        }
        let env = environment(root.path());
        assert!(!env.is_caller_foreground(&CallerInfo::new(10_001).with_pid(11)));
        assert!(env.is_caller_foreground(&CallerInfo::new(10_001).with_pid(12)));
        assert!(env.is_caller_foreground(&CallerInfo::new(10_001).with_pid(13)));
        assert!(env.is_caller_foreground(&CallerInfo::new(10_001)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn startup_gate_and_initialization() {
        let root = tempfile::tempdir().expect("tempdir");
        let env = environment(root.path());
        assert!(!env.is_startup_complete());
        env.mark_started();
        assert!(env.is_startup_complete());
        env.initialize();
        env.initialize();
        assert!(env.is_initialized());
    }

    #[test_timeout::timeout]
    fn preconnect_targets_accept_scheme_less_hosts() {
        assert_eq!(
            preconnect_target("www.example.com").map(|u| u.to_string()),
            Some("https://www.example.com/".to_string())
        );
        assert!(preconnect_target("ftp://files.example").is_none());
        assert!(preconnect_target("http://a.example/x").is_some());
    }
}
