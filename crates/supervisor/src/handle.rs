use std::sync::Arc;

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    pylon_channel::SessionConn,
    pylon_common::{InstanceMeta, InstanceStatus},
    serde::Serialize,
    tokio::{sync::watch, task::JoinHandle},
    tracing::warn,
};

/// Cached pairing credential for an unauthenticated session.
#[derive(Debug, Clone, Serialize)]
pub struct PairingArtifact {
    /// Raw code as emitted by the session library.
    pub raw: String,
    /// Rendered scannable form (SVG data URL).
    pub rendered: String,
}

impl PairingArtifact {
    /// Render the raw code into a scannable SVG data URL. Falls back to the
    /// raw form if rendering fails (oversized payloads).
    pub(crate) fn render(raw: &str) -> Self {
        let rendered = match qrcode::QrCode::new(raw.as_bytes()) {
            Ok(code) => {
                let svg = code
                    .render::<qrcode::render::svg::Color>()
                    .min_dimensions(256, 256)
                    .build();
                format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg))
            },
            Err(e) => {
                warn!("pairing code render failed: {e}");
                raw.to_string()
            },
        };
        Self {
            raw: raw.to_string(),
            rendered,
        }
    }
}

/// One live session: the opaque connection plus mutable per-instance state.
/// Exists only between a successful open and teardown; never persisted.
pub(crate) struct SessionHandle {
    pub conn: Arc<dyn SessionConn>,
    pub meta: InstanceMeta,
    pub pairing: Option<PairingArtifact>,
    /// Status changes as applied by the event router, observed by the
    /// open race and by nobody else.
    pub status_tx: watch::Sender<InstanceStatus>,
    /// The event-router task bound to this connection.
    pub router: JoinHandle<()>,
}

impl SessionHandle {
    /// Apply a status change to the in-memory meta and the watch channel.
    pub fn set_status(&mut self, status: InstanceStatus) {
        self.meta.status = status;
        self.meta.last_activity = pylon_common::now_ms();
        self.status_tx.send_replace(status);
    }
}
