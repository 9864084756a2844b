use async_trait::async_trait;
use broker_core::BrokerResult;
use broker_domain::{entities::ScheduledJob, repositories::JobRepository};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<ScheduledJob> {
        Ok(ScheduledJob {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            interval_seconds: row.try_get("interval_seconds")?,
            next_execution_time: row.try_get("next_execution_time")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expiry: row.try_get("lease_expiry")?,
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self), fields(job_name = %name, job_kind = %kind))]
    async fn ensure_job(
        &self,
        name: &str,
        kind: &str,
        interval_seconds: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<ScheduledJob> {
        let context = OperationContext::new(RepositoryOperation::Create, "作业").with_id(name);

        let row = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (name, kind, interval_seconds, next_execution_time)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                interval_seconds = excluded.interval_seconds
            RETURNING id, name, kind, interval_seconds, next_execution_time, lease_owner, lease_expiry
            "#,
        )
        .bind(name)
        .bind(kind)
        .bind(interval_seconds)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        let job = Self::row_to_job(&row)?;
        debug!("注册作业: {} (ID: {}, 间隔: {}秒)", job.name, job.id, job.interval_seconds);
        Ok(job)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn claim_next_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> BrokerResult<Option<ScheduledJob>> {
        let context = OperationContext::new(RepositoryOperation::Claim, "作业");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        let row = sqlx::query(
            r#"
            SELECT id, name, kind, interval_seconds, next_execution_time, lease_owner, lease_expiry
            FROM scheduled_jobs
            WHERE next_execution_time <= ?
              AND (lease_owner IS NULL OR lease_expiry IS NULL OR lease_expiry < ?)
            ORDER BY next_execution_time ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;
            return Ok(None);
        };
        let mut job = Self::row_to_job(&row)?;

        let next_execution_time = now + Duration::seconds(job.interval_seconds);
        let lease_expiry = now + lease_duration;

        // 条件更新：其他 worker 已抢先认领时不影响任何行
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET lease_owner = ?, lease_expiry = ?, next_execution_time = ?
            WHERE id = ?
              AND next_execution_time = ?
              AND (lease_owner IS NULL OR lease_expiry IS NULL OR lease_expiry < ?)
            "#,
        )
        .bind(owner)
        .bind(lease_expiry)
        .bind(next_execution_time)
        .bind(job.id)
        .bind(job.next_execution_time)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;
            debug!("作业 {} 已被其他 worker 认领", job.name);
            return Ok(None);
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        job.lease_owner = Some(owner.to_string());
        job.lease_expiry = Some(lease_expiry);
        job.next_execution_time = next_execution_time;
        debug!("认领作业: {} (ID: {})", job.name, job.id);
        Ok(Some(job))
    }

    async fn release(&self, name: &str, owner: &str) -> BrokerResult<()> {
        let context = OperationContext::new(RepositoryOperation::Update, "作业").with_id(name);
        sqlx::query(
            "UPDATE scheduled_jobs SET lease_owner = NULL, lease_expiry = NULL WHERE name = ? AND lease_owner = ?",
        )
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;
        Ok(())
    }

    async fn release_owned_by(&self, owner: &str) -> BrokerResult<u64> {
        let context = OperationContext::new(RepositoryOperation::Update, "作业租约").with_id(owner);
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET lease_owner = NULL, lease_expiry = NULL WHERE lease_owner = ?",
        )
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;
        Ok(result.rows_affected())
    }

    async fn get_by_name(&self, name: &str) -> BrokerResult<Option<ScheduledJob>> {
        let context = OperationContext::new(RepositoryOperation::Read, "作业").with_id(name);
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self) -> BrokerResult<Vec<ScheduledJob>> {
        let context = OperationContext::new(RepositoryOperation::Read, "作业");
        let rows = sqlx::query("SELECT * FROM scheduled_jobs ORDER BY next_execution_time ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;

    async fn setup_test_repo() -> (DatabaseManager, SqliteJobRepository) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteJobRepository::new(manager.pool().clone());
        (manager, repo)
    }

    #[tokio::test]
    async fn test_ensure_job_is_idempotent() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();

        let first = repo.ensure_job("cache", "cache_updater", 19, now).await.unwrap();
        let later = now + Duration::seconds(100);
        let second = repo.ensure_job("cache", "cache_updater", 30, later).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.interval_seconds, 30);
        // 重复注册保留原有的下次执行时间
        assert_eq!(second.next_execution_time, first.next_execution_time);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_sets_lease_and_next_execution() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.ensure_job("cache", "cache_updater", 19, now).await.unwrap();

        let claimed = repo
            .claim_next_due("host-0", now, Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.lease_owner.as_deref(), Some("host-0"));
        assert_eq!(claimed.next_execution_time, now + Duration::seconds(19));

        // 租约有效期内，其他 worker 认领不到
        let again = repo
            .claim_next_due("host-1", now + Duration::seconds(20), Duration::seconds(300))
            .await
            .unwrap();
        assert!(again.is_none());

        let stored = repo.get_by_name("cache").await.unwrap().unwrap();
        assert_eq!(stored.lease_owner.as_deref(), Some("host-0"));
    }

    #[tokio::test]
    async fn test_not_due_job_is_not_claimed() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.ensure_job("cache", "cache_updater", 19, now + Duration::seconds(60))
            .await
            .unwrap();

        assert!(repo
            .claim_next_due("host-0", now, Duration::seconds(300))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_release_and_reclaim() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.ensure_job("cache", "cache_updater", 1, now).await.unwrap();

        repo.claim_next_due("host-0", now, Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();

        // 非持有者释放无效
        repo.release("cache", "host-1").await.unwrap();
        let later = now + Duration::seconds(2);
        assert!(repo
            .claim_next_due("host-1", later, Duration::seconds(300))
            .await
            .unwrap()
            .is_none());

        repo.release("cache", "host-0").await.unwrap();
        let reclaimed = repo
            .claim_next_due("host-1", later, Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(reclaimed.unwrap().lease_owner.as_deref(), Some("host-1"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_claimed() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.ensure_job("cache", "cache_updater", 1, now).await.unwrap();
        repo.claim_next_due("host-0", now, Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();

        let after_expiry = now + Duration::seconds(10);
        let claimed = repo
            .claim_next_due("host-1", after_expiry, Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(claimed.unwrap().lease_owner.as_deref(), Some("host-1"));
    }

    #[tokio::test]
    async fn test_release_owned_by() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.ensure_job("a", "kind_a", 10, now).await.unwrap();
        repo.ensure_job("b", "kind_b", 10, now).await.unwrap();
        repo.claim_next_due("host-0", now, Duration::seconds(300))
            .await
            .unwrap();
        repo.claim_next_due("host-0", now, Duration::seconds(300))
            .await
            .unwrap();

        assert_eq!(repo.release_owned_by("host-0").await.unwrap(), 2);
        assert!(repo
            .list()
            .await
            .unwrap()
            .iter()
            .all(|job| job.lease_owner.is_none()));
    }
}
