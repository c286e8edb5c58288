//! Per-session event router.
//!
//! One task per live handle, bound before the open race starts. It is the
//! single dispatcher for a session's event stream: status transitions are
//! applied here (and mirrored to the store), inbound messages are filtered
//! and handed to webhook dispatch fire-and-forget.

use std::{ops::ControlFlow, sync::Arc};

use {
    pylon_channel::{ConnEvent, InboundMessage},
    pylon_common::InstanceStatus,
    pylon_webhook::WebhookJob,
    tokio::{sync::broadcast, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{handle::PairingArtifact, supervisor::InstanceSupervisor};

pub(crate) fn spawn_router(
    sup: Arc<InstanceSupervisor>,
    instance_id: String,
    mut rx: broadcast::Receiver<ConnEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if route(&sup, &instance_id, ev).await.is_break() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(instance_id, dropped = n, "event stream lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn route(
    sup: &Arc<InstanceSupervisor>,
    instance_id: &str,
    ev: ConnEvent,
) -> ControlFlow<()> {
    match ev {
        ConnEvent::Pairing { code } => {
            debug!(instance_id, "pairing artifact received");
            let mut sessions = sup.sessions.write().await;
            if let Some(h) = sessions.get_mut(instance_id) {
                h.pairing = Some(PairingArtifact::render(&code));
                h.meta.last_activity = pylon_common::now_ms();
            }
            ControlFlow::Continue(())
        },
        ConnEvent::Connecting => {
            sup.apply_status(instance_id, InstanceStatus::Connecting).await;
            ControlFlow::Continue(())
        },
        ConnEvent::Open { identity } => {
            info!(instance_id, "session open and authenticated");
            {
                let mut sessions = sup.sessions.write().await;
                if let Some(h) = sessions.get_mut(instance_id) {
                    h.set_status(InstanceStatus::Ready);
                    h.pairing = None;
                    if let Some(id) = &identity {
                        h.meta.linked_identity = Some(id.clone());
                    }
                }
            }
            if let Err(e) = sup
                .store
                .upsert_status(instance_id, InstanceStatus::Ready)
                .await
            {
                warn!(instance_id, "{e}");
            }
            if let Some(identity) = identity {
                sup.store.set_linked_identity(instance_id, &identity).await;
            }
            // A successful (re)open clears the attempt counter and any
            // pending timer, so a late pairing scan isn't torn down by a
            // stale retry.
            sup.retry.clear(instance_id);
            ControlFlow::Continue(())
        },
        ConnEvent::Closed { reason } => {
            let signed_out = reason.is_signed_out();
            let status = if signed_out {
                InstanceStatus::LoggedOut
            } else {
                InstanceStatus::Disconnected
            };
            info!(instance_id, status = %status, ?reason, "session closed");
            sup.apply_status(instance_id, status).await;
            if let Some(conn) = sup.detach_session(instance_id).await {
                conn.close().await;
            }
            if !signed_out {
                sup.schedule_retry(instance_id);
            }
            ControlFlow::Break(())
        },
        ConnEvent::Message(msg) => {
            forward_inbound(sup, instance_id, msg).await;
            ControlFlow::Continue(())
        },
    }
}

/// Forward a qualifying inbound message to webhook dispatch. Self-sent and
/// broadcast-status traffic, and empty bodies, are dropped. Enqueue is
/// fire-and-forget; dispatch failures never reach this task.
async fn forward_inbound(sup: &Arc<InstanceSupervisor>, instance_id: &str, msg: InboundMessage) {
    if msg.self_sent || msg.broadcast || msg.body.trim().is_empty() {
        return;
    }
    let webhook_url = {
        let mut sessions = sup.sessions.write().await;
        match sessions.get_mut(instance_id) {
            Some(h) => {
                h.meta.last_activity = pylon_common::now_ms();
                h.meta.webhook_url().map(str::to_string)
            },
            None => None,
        }
    };
    match webhook_url {
        Some(url) => {
            sup.webhook.enqueue(WebhookJob {
                url,
                payload: serde_json::json!({
                    "instance_id": instance_id,
                    "sender_id": msg.sender_id,
                    "body": msg.body,
                }),
            });
            sup.store.bump_message_count(instance_id).await;
        },
        None => {
            debug!(instance_id, "no webhook configured, dropping inbound message");
        },
    }
}
