use std::{path::Path, sync::Arc};

use {anyhow::Result, async_trait::async_trait, tokio::sync::broadcast};

/// Why a connection closed. Drives the retry decision: a signed-out close
/// is terminal, anything else schedules a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Credentials revoked by the remote account (explicit sign-out).
    SignedOut,
    /// Transient transport failure; safe to reconnect.
    Transport(String),
}

impl CloseReason {
    pub fn is_signed_out(&self) -> bool {
        matches!(self, Self::SignedOut)
    }
}

/// One inbound message as delivered by the session library.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender_id: String,
    pub body: String,
    /// Sent from the linked account itself (echo of our own traffic).
    pub self_sent: bool,
    /// Status/broadcast traffic, never forwarded to tenants.
    pub broadcast: bool,
}

/// Connection-lifecycle and message events emitted by a session.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// Pairing artifact (e.g. scannable code) for an unauthenticated session.
    Pairing { code: String },
    Connecting,
    /// Authenticated and ready; `identity` is the linked external account id.
    Open { identity: Option<String> },
    Closed { reason: CloseReason },
    Message(InboundMessage),
}

/// Opens sessions against the messaging network.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Open a connection for `instance_id`. Credential material is read from
    /// and written to `creds_dir` by the driver itself.
    ///
    /// Contract: the returned connection must not emit events until its
    /// stream has been subscribed to. The supervisor subscribes as soon as
    /// `open` resolves; anything emitted before that first `subscribe` is
    /// lost (the stream has no replay).
    async fn open(&self, instance_id: &str, creds_dir: &Path) -> Result<Arc<dyn SessionConn>>;
}

/// One live connection.
#[async_trait]
pub trait SessionConn: Send + Sync {
    /// Subscribe to the connection's event stream. Dropping the receiver
    /// unregisters the listener; only events emitted after a subscription
    /// exists are observed.
    fn subscribe(&self) -> broadcast::Receiver<ConnEvent>;

    /// Whether the session has completed authentication.
    fn is_authenticated(&self) -> bool;

    async fn send_text(&self, to: &str, body: &str) -> Result<()>;

    /// Force-close the connection. Idempotent.
    async fn close(&self);
}
