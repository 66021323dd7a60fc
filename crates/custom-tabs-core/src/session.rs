use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle identifying one client connection.
///
/// Handles are supplied by the transport layer. The nil UUID is reserved as the
/// null handle and is never accepted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Low-level process credential of a caller (a uid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(pub u32);

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid:{}", self.0)
    }
}

/// Application identity a uid resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIdentity(String);

impl PackageIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the transport knows about the process on the other end of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerInfo {
    pub uid: ClientIdentity,
    pub pid: Option<u32>,
}

impl CallerInfo {
    pub fn new(uid: u32) -> Self {
        Self {
            uid: ClientIdentity(uid),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// Per-session switches a client may toggle after registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub ignore_fragments: bool,
    pub allow_cellular_speculation: bool,
    pub allow_parallel_request: bool,
    pub allow_resource_prefetch: bool,
    pub want_navigation_info: bool,
    pub want_scroll_state: bool,
    pub want_page_metrics: bool,
}

/// Classification of a launch against the session's last prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionOutcome {
    Good,
    Bad,
    None,
}

impl PredictionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionOutcome::Good => "good",
            PredictionOutcome::Bad => "bad",
            PredictionOutcome::None => "none",
        }
    }
}

/// Whether warm-up was requested for a session or its uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupState {
    NoSessionNoWarmup,
    NoSessionWarmup,
    SessionNoWarmupAlreadyCalled,
    SessionNoWarmupNotCalled,
    SessionWarmup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn nil_handle_is_distinct_from_generated_ones() {
        let nil = SessionHandle::nil();
        assert!(nil.is_nil());
        let a = SessionHandle::new();
        let b = SessionHandle::new();
        assert!(!a.is_nil());
        assert_ne!(a, b);
    }

    #[test_timeout::timeout]
    fn policy_deserializes_with_missing_fields() {
        let policy: SessionPolicy =
            serde_json::from_str(r#"{"ignore_fragments":true}"#).expect("policy json");
        assert!(policy.ignore_fragments);
        assert!(!policy.allow_parallel_request);
    }
}
