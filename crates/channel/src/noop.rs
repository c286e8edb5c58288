use std::{path::Path, sync::Arc};

use {anyhow::Result, async_trait::async_trait};

use crate::driver::{SessionConn, SessionDriver};

/// Placeholder driver used when no real session library is linked in.
/// Every open fails, so instances end up `failed` after the retry budget
/// instead of wedging the supervisor.
pub struct NoopDriver;

#[async_trait]
impl SessionDriver for NoopDriver {
    async fn open(&self, instance_id: &str, _creds_dir: &Path) -> Result<Arc<dyn SessionConn>> {
        anyhow::bail!("no session driver configured (instance {instance_id})")
    }
}
