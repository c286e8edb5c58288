use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use {
    pylon_channel::{SessionConn, SessionDriver},
    pylon_common::{GatewayError, InstanceMeta, InstanceStatus},
    pylon_store::InstanceStore,
    pylon_webhook::WebhookSink,
    serde::Serialize,
    tokio::sync::{Mutex, RwLock, watch},
    tracing::{info, warn},
};

use crate::{
    events,
    handle::{PairingArtifact, SessionHandle},
    retry::{RetryPolicy, RetryScheduler},
};

/// Tuning knobs for the supervisor. Defaults come from the constants in
/// `pylon-common`; tests shrink them.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root directory for per-instance credential bundles.
    pub creds_root: PathBuf,
    /// Bound on the open/authenticated race.
    pub ready_timeout: Duration,
    pub retry: RetryPolicy,
    /// Simultaneously in-flight opens during bulk load.
    pub bulk_concurrency: usize,
    /// Per-position stagger applied to a bulk worker's first open.
    pub start_stagger: Duration,
    /// Fixed delay between consecutive opens by one bulk worker.
    pub inter_open_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            creds_root: PathBuf::from("sessions"),
            ready_timeout: Duration::from_millis(pylon_common::READY_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            bulk_concurrency: pylon_common::CONCURRENCY,
            start_stagger: Duration::from_millis(pylon_common::START_STAGGER_MS),
            inter_open_delay: Duration::from_millis(pylon_common::INTER_OPEN_DELAY_MS),
        }
    }
}

/// One row of `list_status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub instance_id: String,
    pub status: InstanceStatus,
}

/// Outcome of the bounded open race, copied out of the watch channel so no
/// borrow is held across awaits.
enum RaceOutcome {
    Reached(InstanceStatus),
    TornDown,
    TimedOut,
}

/// Owns the live-session map and drives the per-instance lifecycle state
/// machine. Constructed once and passed by reference to the request layer;
/// there is no ambient singleton.
pub struct InstanceSupervisor {
    pub(crate) store: InstanceStore,
    pub(crate) driver: Arc<dyn SessionDriver>,
    pub(crate) webhook: Arc<dyn WebhookSink>,
    pub(crate) config: SupervisorConfig,
    /// Live sessions, exclusively owned: at most one handle per id.
    pub(crate) sessions: RwLock<HashMap<String, SessionHandle>>,
    pub(crate) retry: RetryScheduler,
    /// Per-instance open locks so concurrent `ensure` calls coalesce onto
    /// one session open.
    open_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Bulk-load reentrancy guard: an overlapping call is a safe no-op.
    pub(crate) load_guard: Mutex<()>,
}

impl InstanceSupervisor {
    pub fn new(
        store: InstanceStore,
        driver: Arc<dyn SessionDriver>,
        webhook: Arc<dyn WebhookSink>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let retry = RetryScheduler::new(config.retry.clone());
        Arc::new(Self {
            store,
            driver,
            webhook,
            config,
            sessions: RwLock::new(HashMap::new()),
            retry,
            open_locks: Mutex::new(HashMap::new()),
            load_guard: Mutex::new(()),
        })
    }

    pub(crate) fn creds_dir(&self, instance_id: &str) -> PathBuf {
        self.config.creds_root.join(instance_id)
    }

    async fn open_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.open_locks
                .lock()
                .await
                .entry(instance_id.to_string())
                .or_default(),
        )
    }

    // ── Lifecycle operations ─────────────────────────────────────────────

    /// Bring the instance up, or return the live session's metadata if one
    /// already exists and is authenticated. A live but unauthenticated
    /// session is torn down and replaced — stale half-open sessions are
    /// never reused. `options` is merged into the instance config blob.
    pub async fn ensure(
        self: &Arc<Self>,
        instance_id: &str,
        options: Option<serde_json::Value>,
    ) -> Result<InstanceMeta, GatewayError> {
        let lock = self.open_lock(instance_id).await;
        let _guard = lock.lock().await;

        if let Some(meta) = {
            let sessions = self.sessions.read().await;
            sessions
                .get(instance_id)
                .filter(|h| h.conn.is_authenticated())
                .map(|h| h.meta.clone())
        } {
            return Ok(meta);
        }

        let record = match self.store.get(instance_id).await {
            Some(r) if r.status == InstanceStatus::Destroyed => {
                // A destroyed id needs a fresh durable record before reuse.
                self.store
                    .recreate(instance_id, options.as_ref().unwrap_or(&serde_json::Value::Null))
                    .await?
            },
            Some(r) => r,
            None => {
                self.store
                    .create(instance_id, options.as_ref().unwrap_or(&serde_json::Value::Null))
                    .await?
            },
        };
        let config = match &options {
            Some(opts) if !opts.is_null() => self.store.merge_config(instance_id, opts).await?,
            _ => record.config,
        };

        self.open_session_locked(instance_id, Some(config)).await
    }

    /// Tear down any live session, wipe on-disk credentials, and mark the
    /// durable record destroyed. Idempotent; never fails on a missing
    /// session.
    pub async fn destroy(self: &Arc<Self>, instance_id: &str) {
        self.retry.clear(instance_id);
        self.teardown_session(instance_id).await;
        let _ = tokio::fs::remove_dir_all(self.creds_dir(instance_id)).await;
        if let Err(e) = self
            .store
            .upsert_status(instance_id, InstanceStatus::Destroyed)
            .await
        {
            warn!(instance_id, "{e}");
        }
        info!(instance_id, "instance destroyed");
    }

    /// Caller-initiated sign-out: like destroy, but the record is marked
    /// `logged_out` and the id stays re-enterable via a fresh `ensure`.
    pub async fn logout(self: &Arc<Self>, instance_id: &str) -> Result<(), GatewayError> {
        if !self.sessions.read().await.contains_key(instance_id) {
            return Err(GatewayError::NotFound(instance_id.to_string()));
        }
        self.retry.clear(instance_id);
        self.teardown_session(instance_id).await;
        let _ = tokio::fs::remove_dir_all(self.creds_dir(instance_id)).await;
        if let Err(e) = self
            .store
            .upsert_status(instance_id, InstanceStatus::LoggedOut)
            .await
        {
            warn!(instance_id, "{e}");
        }
        info!(instance_id, "instance logged out");
        Ok(())
    }

    /// Send a text payload through the instance's live session. On a
    /// transient failure, performs exactly one recovery attempt (teardown,
    /// reopen, resend); a second failure surfaces to the caller with a
    /// background session retry scheduled. No message-level redelivery.
    pub async fn send(
        self: &Arc<Self>,
        instance_id: &str,
        target: &str,
        body: &str,
    ) -> Result<(), GatewayError> {
        let conn = match self.ready_conn(instance_id).await {
            Ok(conn) => conn,
            Err(GatewayError::NotFound(id)) => {
                // A failed instance stays down until a manual ensure; tell
                // the caller which case they hit.
                return Err(match self.store.get(&id).await {
                    Some(r) if r.status == InstanceStatus::Failed => {
                        GatewayError::MaxRetriesExceeded(id)
                    },
                    _ => GatewayError::NotFound(id),
                });
            },
            Err(e) => return Err(e),
        };
        match conn.send_text(target, body).await {
            Ok(()) => {
                self.touch(instance_id).await;
                self.store.bump_message_count(instance_id).await;
                Ok(())
            },
            Err(first) => {
                warn!(instance_id, "send failed, recovering session: {first}");
                self.teardown_session(instance_id).await;
                self.ensure(instance_id, None).await?;
                let conn = self.ready_conn(instance_id).await?;
                match conn.send_text(target, body).await {
                    Ok(()) => {
                        self.touch(instance_id).await;
                        self.store.bump_message_count(instance_id).await;
                        Ok(())
                    },
                    Err(second) => {
                        self.schedule_retry(instance_id);
                        Err(GatewayError::send(instance_id, second.to_string()))
                    },
                }
            },
        }
    }

    // ── In-memory reads (never fail) ─────────────────────────────────────

    pub async fn get_qr(&self, instance_id: &str) -> Option<PairingArtifact> {
        self.sessions
            .read()
            .await
            .get(instance_id)
            .and_then(|h| h.pairing.clone())
    }

    pub async fn get_meta(&self, instance_id: &str) -> Option<InstanceMeta> {
        self.sessions
            .read()
            .await
            .get(instance_id)
            .map(|h| h.meta.clone())
    }

    pub async fn get_client(&self, instance_id: &str) -> Option<Arc<dyn SessionConn>> {
        self.sessions
            .read()
            .await
            .get(instance_id)
            .map(|h| Arc::clone(&h.conn))
    }

    pub async fn list_status(&self) -> Vec<StatusEntry> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, h)| StatusEntry {
                instance_id: id.clone(),
                status: h.meta.status,
            })
            .collect()
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Tear down every live session. Used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.retry.clear(&id);
            self.teardown_session(&id).await;
        }
    }

    // ── Session-open algorithm ───────────────────────────────────────────

    /// Reopen on behalf of a fired retry timer. Takes the same per-instance
    /// open lock as `ensure`, so a retry racing a manual open can never
    /// produce a second live session for one id, and gives up when the
    /// instance was destroyed or signed out while the timer was pending.
    async fn retry_reopen(self: &Arc<Self>, instance_id: &str) -> Result<(), GatewayError> {
        let lock = self.open_lock(instance_id).await;
        let _guard = lock.lock().await;
        match self.store.get(instance_id).await.map(|r| r.status) {
            None | Some(InstanceStatus::Destroyed) | Some(InstanceStatus::LoggedOut) => {
                info!(instance_id, "instance gone, skipping scheduled reopen");
                Ok(())
            },
            _ => self
                .open_session_locked(instance_id, None)
                .await
                .map(|_| ()),
        }
    }

    /// Open a session for `instance_id` and wait for it to authenticate
    /// under the ready timeout. The caller must hold the per-instance open
    /// lock: the check-then-insert below is only safe because no other open
    /// for the same id can interleave with it. The shared event router is
    /// bound before the race starts and is the only writer of event-driven
    /// transitions; the race merely observes them through the handle's
    /// watch channel.
    async fn open_session_locked(
        self: &Arc<Self>,
        instance_id: &str,
        config: Option<serde_json::Value>,
    ) -> Result<InstanceMeta, GatewayError> {
        match {
            let sessions = self.sessions.read().await;
            sessions.get(instance_id).map(|h| h.conn.is_authenticated())
        } {
            // Someone beat us to it (e.g. a retry racing a manual ensure).
            Some(true) => {
                if let Some(meta) = self.get_meta(instance_id).await {
                    return Ok(meta);
                }
            },
            Some(false) => self.teardown_session(instance_id).await,
            None => {},
        }

        let config = match config {
            Some(c) => c,
            None => self
                .store
                .get(instance_id)
                .await
                .map(|r| r.config)
                .unwrap_or(serde_json::Value::Null),
        };
        let meta = InstanceMeta::new(instance_id, config);

        let conn = match self
            .driver
            .open(instance_id, &self.creds_dir(instance_id))
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(instance_id, "session open failed: {e}");
                self.record_open_failure(instance_id).await;
                return Err(GatewayError::session_init(instance_id, e.to_string()));
            },
        };

        let (status_tx, mut status_rx) = watch::channel(InstanceStatus::Initializing);
        {
            // Insert under the same write lock the router uses so the
            // handle exists before the first event is dispatched.
            let mut sessions = self.sessions.write().await;
            let router =
                events::spawn_router(Arc::clone(self), instance_id.to_string(), conn.subscribe());
            sessions.insert(instance_id.to_string(), SessionHandle {
                conn,
                meta,
                pairing: None,
                status_tx,
                router,
            });
        }

        if let Err(e) = self
            .store
            .upsert_status(instance_id, InstanceStatus::Initializing)
            .await
        {
            warn!(instance_id, "{e}");
        }

        let outcome = match tokio::time::timeout(
            self.config.ready_timeout,
            status_rx.wait_for(|s| {
                matches!(
                    s,
                    InstanceStatus::Ready | InstanceStatus::Disconnected | InstanceStatus::LoggedOut
                )
            }),
        )
        .await
        {
            Ok(Ok(status)) => RaceOutcome::Reached(*status),
            Ok(Err(_)) => RaceOutcome::TornDown,
            Err(_) => RaceOutcome::TimedOut,
        };

        match outcome {
            RaceOutcome::Reached(InstanceStatus::Ready) => {
                self.retry.clear(instance_id);
                self.get_meta(instance_id)
                    .await
                    .ok_or_else(|| GatewayError::session_init(instance_id, "session vanished after open"))
            },
            RaceOutcome::Reached(status) => {
                // The router already persisted the close and owns recovery.
                Err(GatewayError::session_init(
                    instance_id,
                    format!("connection closed during open ({status})"),
                ))
            },
            RaceOutcome::TornDown => Err(GatewayError::session_init(
                instance_id,
                "session torn down during open",
            )),
            RaceOutcome::TimedOut => {
                // The handle stays live so a late pairing scan can still
                // authenticate it; the scheduled retry replaces it otherwise.
                self.apply_status(instance_id, InstanceStatus::Disconnected).await;
                self.schedule_retry(instance_id);
                Err(GatewayError::session_init(
                    instance_id,
                    "timed out waiting for ready",
                ))
            },
        }
    }

    async fn record_open_failure(self: &Arc<Self>, instance_id: &str) {
        if let Err(e) = self
            .store
            .upsert_status(instance_id, InstanceStatus::Disconnected)
            .await
        {
            warn!(instance_id, "{e}");
        }
        self.schedule_retry(instance_id);
    }

    /// Schedule a background reopen with capped backoff. Past the retry
    /// ceiling the instance is marked `failed` and automatic recovery stops
    /// until a manual `ensure`.
    pub(crate) fn schedule_retry(self: &Arc<Self>, instance_id: &str) {
        let Some((attempt, delay)) = self.retry.next_attempt(instance_id) else {
            warn!(instance_id, "max retries reached, giving up");
            let sup = Arc::clone(self);
            let id = instance_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = sup.store.upsert_status(&id, InstanceStatus::Failed).await {
                    warn!(instance_id = %id, "{e}");
                }
            });
            return;
        };
        info!(
            instance_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling session retry"
        );
        let sup = Arc::clone(self);
        let id = instance_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sup.retry.timer_fired(&id);
            if let Err(e) = sup.retry_reopen(&id).await {
                warn!(instance_id = %id, "retry open failed: {e}");
            }
        });
        self.retry.set_timer(instance_id, timer);
    }

    // ── Shared internals ─────────────────────────────────────────────────

    /// Apply a status transition to the in-memory handle and mirror it to
    /// durable storage. The write is best-effort: on failure the in-memory
    /// status stays authoritative and the error is only logged.
    pub(crate) async fn apply_status(&self, instance_id: &str, status: InstanceStatus) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(h) = sessions.get_mut(instance_id) {
                h.set_status(status);
            }
        }
        if let Err(e) = self.store.upsert_status(instance_id, status).await {
            warn!(instance_id, "{e}");
        }
    }

    /// Remove and close a live session, aborting its event router.
    pub(crate) async fn teardown_session(&self, instance_id: &str) {
        let handle = self.sessions.write().await.remove(instance_id);
        if let Some(h) = handle {
            h.router.abort();
            h.conn.close().await;
        }
    }

    /// Remove a session without aborting the router — used by the router
    /// itself when handling a close event.
    pub(crate) async fn detach_session(&self, instance_id: &str) -> Option<Arc<dyn SessionConn>> {
        self.sessions
            .write()
            .await
            .remove(instance_id)
            .map(|h| h.conn)
    }

    async fn ready_conn(&self, instance_id: &str) -> Result<Arc<dyn SessionConn>, GatewayError> {
        let sessions = self.sessions.read().await;
        let h = sessions
            .get(instance_id)
            .ok_or_else(|| GatewayError::NotFound(instance_id.to_string()))?;
        if !h.conn.is_authenticated() {
            return Err(GatewayError::NotReady(instance_id.to_string()));
        }
        Ok(Arc::clone(&h.conn))
    }

    async fn touch(&self, instance_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(h) = sessions.get_mut(instance_id) {
            h.meta.last_activity = pylon_common::now_ms();
        }
    }
}

#[cfg(test)]
impl InstanceSupervisor {
    pub(crate) fn retry_attempts(&self, instance_id: &str) -> u32 {
        self.retry.attempts(instance_id)
    }

    pub(crate) fn has_pending_retry(&self, instance_id: &str) -> bool {
        self.retry.has_pending_timer(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pylon_common::{GatewayError, InstanceStatus};

    use crate::testing::{OpenScript, TestRig};

    #[tokio::test]
    async fn ensure_opens_and_reports_ready() {
        let rig = TestRig::new(OpenScript::Connect {
            identity: Some("15550001111".into()),
        })
        .await;
        let sup = rig.supervisor();

        let meta = sup.ensure("user_7", None).await.expect("ensure");
        assert_eq!(meta.instance_id, "user_7");
        assert_eq!(meta.status, InstanceStatus::Ready);
        assert_eq!(meta.linked_identity.as_deref(), Some("15550001111"));

        let rec = rig.store.get("user_7").await.expect("record");
        assert_eq!(rec.status, InstanceStatus::Ready);
        assert_eq!(rec.linked_identity.as_deref(), Some("15550001111"));
        assert_eq!(rig.driver.open_count(), 1);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_for_live_sessions() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        let first = sup.ensure("user_1", None).await.expect("ensure");
        let second = sup.ensure("user_1", None).await.expect("ensure");
        assert_eq!(rig.driver.open_count(), 1, "live session must be reused");
        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn concurrent_ensure_coalesces_onto_one_open() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        let (a, b) = tokio::join!(sup.ensure("user_1", None), sup.ensure("user_1", None));
        let a = a.expect("ensure a");
        let b = b.expect("ensure b");
        assert_eq!(rig.driver.open_count(), 1);
        assert_eq!(a.instance_id, b.instance_id);
        assert_eq!(a.status, b.status);
    }

    #[tokio::test]
    async fn open_failure_schedules_bounded_retries_then_fails() {
        let rig = TestRig::new(OpenScript::Fail).await;
        let sup = rig.supervisor();

        let err = sup.ensure("user_1", None).await.expect_err("ensure must reject");
        assert!(matches!(err, GatewayError::SessionInit { .. }));
        // Rejection does not mean recovery stopped: status records the
        // failure and the background retry owns what happens next.
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::Disconnected
        );

        // max_retries=3: the initial failure plus three retries, then failed.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.driver.open_count(), 4);
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::Failed
        );

        // Terminal: no fifth attempt ever fires.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.driver.open_count(), 4);
        assert!(!sup.has_pending_retry("user_1"));
    }

    #[tokio::test]
    async fn retry_reopen_racing_ensure_never_doubles_sessions() {
        let rig = TestRig::new(OpenScript::Manual).await;
        let sup = rig.supervisor();
        rig.store
            .upsert_status("user_1", InstanceStatus::Disconnected)
            .await
            .expect("seed");

        // A fired retry timer and a manual ensure contend for the same id;
        // the open lock must serialize them onto one dial.
        let ensure = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure("user_1", None).await })
        };
        let reopen = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.retry_reopen("user_1").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.driver.open_count(), 1, "loser parks behind the open lock");

        rig.driver.last_conn().expect("conn").emit_open(None);
        ensure.await.expect("join").expect("ensure");
        reopen.await.expect("join").expect("reopen");

        assert_eq!(rig.driver.open_count(), 1, "loser reuses the winner's session");
        let conn = rig.driver.conn(0).expect("conn");
        assert!(!conn.is_closed(), "live session must not be displaced");
        assert!(sup.get_client("user_1").await.is_some());
    }

    #[tokio::test]
    async fn destroy_wins_over_in_flight_retry_reopen() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("user_1", None).await.expect("ensure");
        sup.destroy("user_1").await;

        // A retry already past its timer when destroy ran must not
        // resurrect the instance or overwrite the destroyed record.
        sup.retry_reopen("user_1").await.expect("skip");
        assert_eq!(rig.driver.open_count(), 1);
        assert!(sup.get_client("user_1").await.is_none());
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::Destroyed
        );
    }

    #[tokio::test]
    async fn logged_out_instance_skips_scheduled_reopen() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("user_1", None).await.expect("ensure");
        sup.logout("user_1").await.expect("logout");

        sup.retry_reopen("user_1").await.expect("skip");
        assert_eq!(rig.driver.open_count(), 1);
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::LoggedOut
        );
    }

    #[tokio::test]
    async fn open_timeout_keeps_pairing_available() {
        let rig = TestRig::new(OpenScript::Manual).await;
        let sup = rig.supervisor();

        let ensure = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure("user_1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let conn = rig.driver.last_conn().expect("conn");
        conn.emit_pairing("2@scan-me");

        // Nobody scans; the ready race times out but the handle (and its
        // pairing artifact) stays live for a late scan.
        let err = ensure.await.expect("join").expect_err("ensure must time out");
        assert!(matches!(err, GatewayError::SessionInit { .. }));
        assert!(sup.get_qr("user_1").await.is_some());
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::Disconnected
        );

        // A late scan authenticates the same session and cancels the retry.
        conn.emit_open(Some("15550001111"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::Ready
        );
        assert_eq!(sup.retry_attempts("user_1"), 0);
        assert!(!sup.has_pending_retry("user_1"));
    }

    #[tokio::test]
    async fn destroy_then_ensure_yields_fresh_session() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("user_1", None).await.expect("ensure");
        let first_conn = rig.driver.conn(0).expect("conn");
        sup.destroy("user_1").await;

        assert!(first_conn.is_closed());
        assert!(sup.get_client("user_1").await.is_none());
        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::Destroyed
        );

        let meta = sup.ensure("user_1", None).await.expect("ensure after destroy");
        assert_eq!(meta.status, InstanceStatus::Ready);
        assert_eq!(rig.driver.open_count(), 2, "never a reused handle");
    }

    #[tokio::test]
    async fn destroy_is_idempotent_on_missing_session() {
        let rig = TestRig::new(OpenScript::Manual).await;
        let sup = rig.supervisor();
        // No session was ever opened; destroy must still succeed.
        sup.destroy("ghost").await;
        assert_eq!(
            rig.store.get("ghost").await.expect("record").status,
            InstanceStatus::Destroyed
        );
    }

    #[tokio::test]
    async fn logout_requires_live_session_and_skips_retry() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        let err = sup.logout("user_1").await.expect_err("no session yet");
        assert!(matches!(err, GatewayError::NotFound(_)));

        sup.ensure("user_1", None).await.expect("ensure");
        sup.logout("user_1").await.expect("logout");

        assert_eq!(
            rig.store.get("user_1").await.expect("record").status,
            InstanceStatus::LoggedOut
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rig.driver.open_count(), 1, "logout never schedules a retry");
        assert!(!sup.has_pending_retry("user_1"));
    }

    #[tokio::test]
    async fn send_requires_authenticated_session() {
        let rig = TestRig::new(OpenScript::Manual).await;
        let sup = rig.supervisor();

        let err = sup.send("user_1", "15550002222", "hi").await.expect_err("none");
        assert!(matches!(err, GatewayError::NotFound(_)));

        // Live but unauthenticated: ensure in flight, no open event yet.
        let ensure = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure("user_1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = sup.send("user_1", "15550002222", "hi").await.expect_err("half-open");
        assert!(matches!(err, GatewayError::NotReady(_)));

        rig.driver.last_conn().expect("conn").emit_open(None);
        ensure.await.expect("join").expect("ensure");
        sup.send("user_1", "15550002222", "hi").await.expect("send");
        let sent = rig.driver.last_conn().expect("conn").sent();
        assert_eq!(sent, vec![("15550002222".to_string(), "hi".to_string())]);
        // Outbound sends count toward the instance's message total.
        assert_eq!(rig.store.get("user_1").await.expect("record").message_count, 1);
    }

    #[tokio::test]
    async fn send_to_failed_instance_reports_retry_exhaustion() {
        let rig = TestRig::new(OpenScript::Manual).await;
        let sup = rig.supervisor();

        rig.store
            .upsert_status("user_1", InstanceStatus::Failed)
            .await
            .expect("seed");
        let err = sup.send("user_1", "15550002222", "hi").await.expect_err("failed");
        assert!(matches!(err, GatewayError::MaxRetriesExceeded(_)));
    }

    #[tokio::test]
    async fn send_recovers_once_after_transient_failure() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("user_1", None).await.expect("ensure");
        rig.driver.last_conn().expect("conn").fail_next_sends(1);

        sup.send("user_1", "15550002222", "hello").await.expect("recovered send");
        assert_eq!(rig.driver.open_count(), 2, "one teardown + reinitialize");
        let sent = rig.driver.conn(1).expect("second conn").sent();
        assert_eq!(sent, vec![("15550002222".to_string(), "hello".to_string())]);
    }

    #[tokio::test]
    async fn send_surfaces_second_failure_and_schedules_retry() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("user_1", None).await.expect("ensure");
        rig.driver
            .fail_all_sends
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = sup
            .send("user_1", "15550002222", "hello")
            .await
            .expect_err("second failure surfaces");
        assert!(matches!(err, GatewayError::Send { .. }));
        assert_eq!(rig.driver.open_count(), 2, "exactly one recovery attempt");
        assert!(sup.has_pending_retry("user_1"));
    }

    #[tokio::test]
    async fn ensure_merges_options_into_config() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("user_1", Some(serde_json::json!({"webhook_url": "https://a"})))
            .await
            .expect("ensure");
        assert_eq!(
            rig.store.get("user_1").await.expect("record").config["webhook_url"],
            "https://a"
        );
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let rig = TestRig::new(OpenScript::Connect { identity: None }).await;
        let sup = rig.supervisor();

        sup.ensure("a", None).await.expect("ensure a");
        sup.ensure("b", None).await.expect("ensure b");
        assert_eq!(sup.list_status().await.len(), 2);

        sup.shutdown().await;
        assert!(sup.list_status().await.is_empty());
        assert!(rig.driver.conn(0).expect("conn").is_closed());
        assert!(rig.driver.conn(1).expect("conn").is_closed());
    }
}
