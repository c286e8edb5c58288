//! SQLite-backed instance status store.
//!
//! One durable record per instance id. Writes are best-effort and
//! idempotent; a failed status write is surfaced as `StorageWrite` so the
//! caller can log it and keep going.

use {
    pylon_common::{GatewayError, InstanceStatus, now_ms},
    tracing::error,
};

/// One durable instance record.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub config: serde_json::Value,
    pub linked_identity: Option<String>,
    pub message_count: u32,
    pub created_at: u64,
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    status: String,
    config: String,
    linked_identity: Option<String>,
    message_count: i32,
    created_at: i64,
}

impl From<InstanceRow> for InstanceRecord {
    fn from(r: InstanceRow) -> Self {
        Self {
            instance_id: r.instance_id,
            // Unknown status strings (older schema versions) read as disconnected
            // so the loader still picks the instance up.
            status: InstanceStatus::parse(&r.status).unwrap_or(InstanceStatus::Disconnected),
            config: serde_json::from_str(&r.config).unwrap_or(serde_json::Value::Null),
            linked_identity: r.linked_identity,
            message_count: r.message_count.max(0) as u32,
            created_at: r.created_at as u64,
        }
    }
}

/// Adapter over the `instances` table.
#[derive(Clone)]
pub struct InstanceStore {
    pool: sqlx::SqlitePool,
}

impl InstanceStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `instances` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS instances (
                instance_id     TEXT PRIMARY KEY,
                status          TEXT NOT NULL,
                config          TEXT NOT NULL DEFAULT 'null',
                linked_identity TEXT,
                message_count   INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, instance_id: &str) -> Option<InstanceRecord> {
        match sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row.map(Into::into),
            Err(e) => {
                error!(instance_id, "instances.get failed: {e}");
                None
            },
        }
    }

    /// Insert a fresh record, or return the existing one unchanged.
    pub async fn create(
        &self,
        instance_id: &str,
        config: &serde_json::Value,
    ) -> Result<InstanceRecord, GatewayError> {
        let config_json = config.to_string();
        sqlx::query(
            r#"INSERT INTO instances (instance_id, status, config, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(instance_id) DO NOTHING"#,
        )
        .bind(instance_id)
        .bind(InstanceStatus::Initializing.as_str())
        .bind(&config_json)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::storage_write(instance_id, e.to_string()))?;
        self.get(instance_id)
            .await
            .ok_or_else(|| GatewayError::storage_write(instance_id, "row vanished after insert"))
    }

    /// Reset a destroyed id to a fresh record. `destroyed` keeps the row
    /// around; reuse requires wiping the old identity and counters.
    pub async fn recreate(
        &self,
        instance_id: &str,
        config: &serde_json::Value,
    ) -> Result<InstanceRecord, GatewayError> {
        sqlx::query(
            r#"UPDATE instances
               SET status = ?, config = ?, linked_identity = NULL,
                   message_count = 0, created_at = ?
               WHERE instance_id = ?"#,
        )
        .bind(InstanceStatus::Initializing.as_str())
        .bind(config.to_string())
        .bind(now_ms() as i64)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::storage_write(instance_id, e.to_string()))?;
        self.get(instance_id)
            .await
            .ok_or_else(|| GatewayError::storage_write(instance_id, "row missing on recreate"))
    }

    pub async fn upsert_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO instances (instance_id, status, created_at)
               VALUES (?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET status = excluded.status"#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| GatewayError::storage_write(instance_id, e.to_string()))
    }

    /// Merge extra keys into the stored config blob.
    pub async fn merge_config(
        &self,
        instance_id: &str,
        extra: &serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let mut config = self
            .get(instance_id)
            .await
            .map(|r| r.config)
            .unwrap_or(serde_json::Value::Null);
        merge_json(&mut config, extra);
        sqlx::query("UPDATE instances SET config = ? WHERE instance_id = ?")
            .bind(config.to_string())
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::storage_write(instance_id, e.to_string()))?;
        Ok(config)
    }

    pub async fn set_linked_identity(&self, instance_id: &str, identity: &str) {
        if let Err(e) = sqlx::query("UPDATE instances SET linked_identity = ? WHERE instance_id = ?")
            .bind(identity)
            .bind(instance_id)
            .execute(&self.pool)
            .await
        {
            error!(instance_id, "instances.set_linked_identity failed: {e}");
        }
    }

    /// Bump the forwarded-message counter.
    pub async fn bump_message_count(&self, instance_id: &str) {
        if let Err(e) = sqlx::query(
            "UPDATE instances SET message_count = message_count + 1 WHERE instance_id = ?",
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        {
            error!(instance_id, "instances.bump_message_count failed: {e}");
        }
    }

    /// All instance ids whose durable status is not `destroyed`.
    pub async fn active_ids(&self) -> Vec<String> {
        sqlx::query_scalar::<_, String>(
            "SELECT instance_id FROM instances WHERE status != 'destroyed' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|e| {
            error!("instances.active_ids failed: {e}");
            Vec::new()
        })
    }

    pub async fn list(&self) -> Vec<InstanceRecord> {
        sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(Into::into)
            .collect()
    }
}

/// Shallow object merge; non-object `extra` replaces the config wholesale.
fn merge_json(config: &mut serde_json::Value, extra: &serde_json::Value) {
    match (config.as_object_mut(), extra.as_object()) {
        (Some(base), Some(patch)) => {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
        },
        _ => {
            if !extra.is_null() {
                *config = extra.clone();
            } else if config.is_null() {
                *config = serde_json::json!({});
            }
        },
    }
}
