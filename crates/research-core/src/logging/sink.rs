use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

use super::types::ActivityLog;
use crate::utils::error::CoreResult;

/// Destination for batches of activity logs.
#[async_trait]
pub trait ActivitySink: Send + Sync + 'static {
    /// Returns the number of rows written.
    async fn write_batch(&self, logs: &[ActivityLog]) -> CoreResult<usize>;
}

/// Writes into `tbl_activity_logs`.
pub struct PgActivitySink {
    pool: PgPool,
}

impl PgActivitySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivitySink for PgActivitySink {
    async fn write_batch(&self, logs: &[ActivityLog]) -> CoreResult<usize> {
        if logs.is_empty() {
            return Ok(0);
        }

        // Build bulk insert query
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO tbl_activity_logs (
                user_id, conversation_id, activity_type, activity_status,
                message, error_code, duration_ms, metadata, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(log.user_id)
                .push_bind(log.conversation_id)
                .push_bind(log.activity_type.as_str())
                .push_bind(log.activity_status.as_str())
                .push_bind(&log.message)
                .push_bind(&log.error_code)
                .push_bind(log.duration_ms)
                .push_bind(log.metadata.as_ref().map(Json))
                .push_bind(log.created_at);
        });

        let result = query_builder.build().execute(&self.pool).await?;

        Ok(result.rows_affected() as usize)
    }
}

/// Emits activity logs as structured `tracing` events. Used when no
/// database is configured for the audit trail.
pub struct TracingActivitySink;

#[async_trait]
impl ActivitySink for TracingActivitySink {
    async fn write_batch(&self, logs: &[ActivityLog]) -> CoreResult<usize> {
        for log in logs {
            let user_id = log.user_id.map(|u| u.to_string());
            info!(
                target: "activity",
                activity_type = log.activity_type.as_str(),
                status = log.activity_status.as_str(),
                conversation_id = log.conversation_id,
                user_id = user_id.as_deref(),
                duration_ms = log.duration_ms,
                error_code = log.error_code.as_deref(),
                "{}",
                log.message.as_deref().unwrap_or("")
            );
        }
        Ok(logs.len())
    }
}
