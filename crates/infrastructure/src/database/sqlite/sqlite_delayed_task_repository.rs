use async_trait::async_trait;
use broker_core::BrokerResult;
use broker_domain::{entities::DelayedTaskRecord, repositories::DelayedTaskRepository};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};

pub struct SqliteDelayedTaskRepository {
    pool: SqlitePool,
}

impl SqliteDelayedTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<DelayedTaskRecord> {
        Ok(DelayedTaskRecord {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            insert_time: row.try_get("insert_time")?,
            delay_seconds: row.try_get("delay_seconds")?,
            execution_time: row.try_get("execution_time")?,
            tag: row.try_get("tag")?,
        })
    }
}

#[async_trait]
impl DelayedTaskRepository for SqliteDelayedTaskRepository {
    #[instrument(skip(self, record), fields(task_kind = %record.kind, tag = %record.tag))]
    async fn insert(&self, record: &DelayedTaskRecord) -> BrokerResult<DelayedTaskRecord> {
        let context = OperationContext::new(RepositoryOperation::Create, "延迟任务")
            .with_id(&record.kind);

        let row = sqlx::query(
            r#"
            INSERT INTO delayed_tasks (kind, payload, insert_time, delay_seconds, execution_time, tag)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.kind)
        .bind(&record.payload)
        .bind(record.insert_time)
        .bind(record.delay_seconds)
        .bind(record.execution_time)
        .bind(&record.tag)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        let mut inserted = record.clone();
        inserted.id = row.try_get("id")?;
        debug!(
            "插入延迟任务: {} (ID: {}, 执行时间: {})",
            inserted.kind, inserted.id, inserted.execution_time
        );
        Ok(inserted)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> BrokerResult<Option<DelayedTaskRecord>> {
        let context = OperationContext::new(RepositoryOperation::Claim, "延迟任务");

        // 选出与删除在同一条语句内完成，删除成功者独占执行权
        let row = sqlx::query(
            r#"
            DELETE FROM delayed_tasks
            WHERE id = (
                SELECT id FROM delayed_tasks
                WHERE execution_time <= ? OR insert_time > ?
                ORDER BY execution_time ASC
                LIMIT 1
            )
            RETURNING id, kind, payload, insert_time, delay_seconds, execution_time, tag
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn remove_by_tag(&self, tag: &str) -> BrokerResult<u64> {
        let context = OperationContext::new(RepositoryOperation::Delete, "延迟任务").with_id(tag);
        let result = sqlx::query("DELETE FROM delayed_tasks WHERE tag = ?")
            .bind(tag)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!("按标签 {} 删除延迟任务 {} 个", tag, result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn count_by_tag(&self, tag: &str) -> BrokerResult<i64> {
        let context = OperationContext::new(RepositoryOperation::Query, "延迟任务").with_id(tag);
        let row = sqlx::query("SELECT COUNT(*) AS count FROM delayed_tasks WHERE tag = ?")
            .bind(tag)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(row.try_get("count")?)
    }
}
