//! Scriptable session-driver double and helpers shared by the test modules.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Result,
    async_trait::async_trait,
    pylon_channel::{CloseReason, ConnEvent, InboundMessage, SessionConn, SessionDriver},
    pylon_store::InstanceStore,
    pylon_webhook::{WebhookJob, WebhookSink},
    tokio::sync::broadcast,
};

use crate::{
    retry::RetryPolicy,
    supervisor::{InstanceSupervisor, SupervisorConfig},
};

pub(crate) fn msg(sender_id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        sender_id: sender_id.to_string(),
        body: body.to_string(),
        self_sent: false,
        broadcast: false,
    }
}

// ── Fake connection ──────────────────────────────────────────────────────

pub(crate) struct FakeConn {
    tx: broadcast::Sender<ConnEvent>,
    authed: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicU32,
    fail_all_sends: Arc<AtomicBool>,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeConn {
    fn new(fail_all_sends: Arc<AtomicBool>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            authed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_sends: AtomicU32::new(0),
            fail_all_sends,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn emit_pairing(&self, code: &str) {
        let _ = self.tx.send(ConnEvent::Pairing { code: code.to_string() });
    }

    pub fn emit_connecting(&self) {
        let _ = self.tx.send(ConnEvent::Connecting);
    }

    pub fn emit_open(&self, identity: Option<&str>) {
        self.authed.store(true, Ordering::SeqCst);
        let _ = self.tx.send(ConnEvent::Open {
            identity: identity.map(str::to_string),
        });
    }

    pub fn emit_closed(&self, reason: CloseReason) {
        self.authed.store(false, Ordering::SeqCst);
        let _ = self.tx.send(ConnEvent::Closed { reason });
    }

    pub fn emit_message(&self, msg: InboundMessage) {
        let _ = self.tx.send(ConnEvent::Message(msg));
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConn for FakeConn {
    fn subscribe(&self) -> broadcast::Receiver<ConnEvent> {
        self.tx.subscribe()
    }

    fn is_authenticated(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<()> {
        if self.fail_all_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transient send failure");
        }
        if self.fail_sends.load(Ordering::SeqCst) > 0 {
            self.fail_sends.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("transient send failure");
        }
        self.sent.lock().unwrap().push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Fake driver ──────────────────────────────────────────────────────────

/// What the next `open` call should do.
#[derive(Clone)]
pub(crate) enum OpenScript {
    /// The dial itself fails.
    Fail,
    /// Connect, then emit connecting + open shortly after.
    Connect { identity: Option<String> },
    /// Connect; the test drives events through `last_conn()`.
    Manual,
}

pub(crate) struct FakeDriver {
    default: OpenScript,
    scripts: Mutex<VecDeque<OpenScript>>,
    opens: AtomicUsize,
    conns: Mutex<Vec<Arc<FakeConn>>>,
    pub fail_all_sends: Arc<AtomicBool>,
}

impl FakeDriver {
    pub fn new(default: OpenScript) -> Arc<Self> {
        Arc::new(Self {
            default,
            scripts: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
            conns: Mutex::new(Vec::new()),
            fail_all_sends: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Queue a script consumed by the next `open` before the default applies.
    pub fn push_script(&self, script: OpenScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_conn(&self) -> Option<Arc<FakeConn>> {
        self.conns.lock().unwrap().last().cloned()
    }

    pub fn conn(&self, i: usize) -> Option<Arc<FakeConn>> {
        self.conns.lock().unwrap().get(i).cloned()
    }
}

#[async_trait]
impl SessionDriver for FakeDriver {
    async fn open(&self, _instance_id: &str, _creds_dir: &Path) -> Result<Arc<dyn SessionConn>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        if matches!(script, OpenScript::Fail) {
            anyhow::bail!("dial refused");
        }
        let conn = FakeConn::new(Arc::clone(&self.fail_all_sends));
        self.conns.lock().unwrap().push(Arc::clone(&conn));
        if let OpenScript::Connect { identity } = script {
            let c = Arc::clone(&conn);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                c.emit_connecting();
                tokio::time::sleep(Duration::from_millis(10)).await;
                c.emit_open(identity.as_deref());
            });
        }
        Ok(conn)
    }
}

// ── Recording webhook sink ───────────────────────────────────────────────

pub(crate) struct RecordingSink {
    jobs: Mutex<Vec<WebhookJob>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn jobs(&self) -> Vec<WebhookJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl WebhookSink for RecordingSink {
    fn enqueue(&self, job: WebhookJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

// ── Rig ──────────────────────────────────────────────────────────────────

pub(crate) struct TestRig {
    pub driver: Arc<FakeDriver>,
    pub sink: Arc<RecordingSink>,
    pub store: InstanceStore,
    pub sup: Arc<InstanceSupervisor>,
    _tmp: tempfile::TempDir,
}

impl TestRig {
    pub async fn new(default: OpenScript) -> Self {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        InstanceStore::init(&pool).await.unwrap();
        let store = InstanceStore::new(pool);

        let tmp = tempfile::tempdir().unwrap();
        let config = SupervisorConfig {
            creds_root: tmp.path().to_path_buf(),
            ready_timeout: Duration::from_millis(300),
            retry: RetryPolicy {
                max_retries: 3,
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                jitter: Duration::from_millis(5),
            },
            bulk_concurrency: 2,
            start_stagger: Duration::from_millis(5),
            inter_open_delay: Duration::from_millis(5),
        };

        let driver = FakeDriver::new(default);
        let sink = RecordingSink::new();
        let sup = InstanceSupervisor::new(
            store.clone(),
            driver.clone() as Arc<dyn SessionDriver>,
            sink.clone() as Arc<dyn WebhookSink>,
            config,
        );
        Self {
            driver,
            sink,
            store,
            sup,
            _tmp: tmp,
        }
    }

    pub fn supervisor(&self) -> Arc<InstanceSupervisor> {
        Arc::clone(&self.sup)
    }
}
