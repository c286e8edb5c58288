use thiserror::Error;

/// Error taxonomy for the gateway core.
///
/// `SessionInit` is recoverable via the background retry, `NotFound` and
/// `NotReady` ask the caller to re-`ensure` or wait, `MaxRetriesExceeded`
/// needs manual intervention, `StorageWrite` is logged and swallowed at the
/// call site — in-memory status stays authoritative until the next
/// successful write.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("[{instance_id}] session open failed: {reason}")]
    SessionInit { instance_id: String, reason: String },

    #[error("[{0}] no live session")]
    NotFound(String),

    #[error("[{0}] session exists but is not ready")]
    NotReady(String),

    #[error("[{0}] exceeded max retries; manual ensure required")]
    MaxRetriesExceeded(String),

    #[error("[{instance_id}] status persist failed: {reason}")]
    StorageWrite { instance_id: String, reason: String },

    #[error("[{instance_id}] send failed: {reason}")]
    Send { instance_id: String, reason: String },
}

impl GatewayError {
    pub fn session_init(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SessionInit {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }

    pub fn storage_write(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageWrite {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }

    pub fn send(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Send {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }
}
