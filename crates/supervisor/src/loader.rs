//! Cold-start bulk loader.
//!
//! Brings up every non-destroyed instance at boot without hammering the
//! messaging network: a fixed pool of worker tasks pulls from one shared
//! work list, each worker's first open is staggered by the item's global
//! position, and a short fixed delay separates consecutive opens by the
//! same worker.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {serde::Serialize, tracing::info};

use crate::supervisor::InstanceSupervisor;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-instance result of a bulk load. One entry per id, always.
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub instance_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<pylon_common::InstanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstanceSupervisor {
    /// Load every instance whose durable status is not `destroyed`.
    ///
    /// Returns `None` when a load is already in flight — overlapping calls
    /// are a deliberate no-op, nothing is touched twice. An individual
    /// failure never aborts the batch; the failed id is recorded and its
    /// recovery belongs to the background retry.
    pub async fn load_all(self: &Arc<Self>) -> Option<Vec<LoadOutcome>> {
        let Ok(_guard) = self.load_guard.try_lock() else {
            info!("bulk load already in progress, skipping");
            return None;
        };

        let ids = self.store.active_ids().await;
        info!(count = ids.len(), "bulk loading instances");

        let work: Arc<Mutex<VecDeque<(usize, String)>>> =
            Arc::new(Mutex::new(ids.into_iter().enumerate().collect()));
        let results = Arc::new(Mutex::new(Vec::new()));

        let workers = self.config.bulk_concurrency.max(1);
        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let sup = Arc::clone(self);
            let work = Arc::clone(&work);
            let results = Arc::clone(&results);
            tasks.push(tokio::spawn(async move {
                let mut first = true;
                loop {
                    let next = lock(&work).pop_front();
                    let Some((pos, instance_id)) = next else { break };
                    if first {
                        first = false;
                        let stagger = sup.config.start_stagger * pos as u32;
                        if !stagger.is_zero() {
                            tokio::time::sleep(stagger).await;
                        }
                    }
                    let outcome = match sup.ensure(&instance_id, None).await {
                        Ok(meta) => LoadOutcome {
                            instance_id,
                            ok: true,
                            status: Some(meta.status),
                            error: None,
                        },
                        Err(e) => LoadOutcome {
                            instance_id,
                            ok: false,
                            status: None,
                            error: Some(e.to_string()),
                        },
                    };
                    lock(&results).push(outcome);
                    tokio::time::sleep(sup.config.inter_open_delay).await;
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        Some(std::mem::take(&mut *lock(&results)))
    }
}
