//! Outbound webhook dispatch.
//!
//! The core enqueues and moves on; a single worker task drains the queue
//! and POSTs each payload. Delivery failures are logged, never retried, and
//! never block the enqueuing side.

use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

/// One pending delivery.
#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub url: String,
    pub payload: serde_json::Value,
}

/// Fire-and-forget sink the core enqueues into.
pub trait WebhookSink: Send + Sync {
    fn enqueue(&self, job: WebhookJob);
}

/// In-process queue backed by an unbounded channel and one HTTP worker.
pub struct HttpWebhookQueue {
    tx: mpsc::UnboundedSender<WebhookJob>,
}

impl HttpWebhookQueue {
    /// Spawn the worker and return the sink handle.
    pub fn spawn() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_loop(rx));
        Arc::new(Self { tx })
    }
}

impl WebhookSink for HttpWebhookQueue {
    fn enqueue(&self, job: WebhookJob) {
        // Send only fails after shutdown, when delivery no longer matters.
        if self.tx.send(job).is_err() {
            debug!("webhook queue closed, dropping job");
        }
    }
}

async fn deliver_loop(mut rx: mpsc::UnboundedReceiver<WebhookJob>) {
    let client = reqwest::Client::new();
    while let Some(job) = rx.recv().await {
        match client.post(&job.url).json(&job.payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %job.url, "webhook delivered");
            },
            Ok(resp) => {
                warn!(url = %job.url, status = %resp.status(), "webhook rejected");
            },
            Err(e) => {
                warn!(url = %job.url, "webhook delivery failed: {e}");
            },
        }
    }
}
