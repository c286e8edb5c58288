use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Connection lifecycle status of one instance.
///
/// Transitions within a session lifetime are monotonic:
/// initializing → connecting → ready → {disconnected, logged_out}.
/// `disconnected` re-enters `initializing` through a retry; `failed` and
/// `destroyed` are terminal for automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Connecting,
    Ready,
    Disconnected,
    LoggedOut,
    Failed,
    Destroyed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "logged_out",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "initializing" => Self::Initializing,
            "connecting" => Self::Connecting,
            "ready" => Self::Ready,
            "disconnected" => Self::Disconnected,
            "logged_out" => Self::LoggedOut,
            "failed" => Self::Failed,
            "destroyed" => Self::Destroyed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory metadata for one instance, mirrored to the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// External account identity, set once the session authenticates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_identity: Option<String>,
    /// Caller-owned configuration blob (webhook URL, auto-reply text, ...).
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: u64,
    pub last_activity: u64,
}

impl InstanceMeta {
    pub fn new(instance_id: impl Into<String>, config: serde_json::Value) -> Self {
        let now = now_ms();
        Self {
            instance_id: instance_id.into(),
            status: InstanceStatus::Initializing,
            linked_identity: None,
            config,
            created_at: now,
            last_activity: now,
        }
    }

    /// Per-instance webhook URL from the config blob, if configured.
    pub fn webhook_url(&self) -> Option<&str> {
        self.config.get("webhook_url").and_then(|v| v.as_str())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
