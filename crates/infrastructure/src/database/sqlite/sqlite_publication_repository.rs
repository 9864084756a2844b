use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{
    entities::{Publication, PublicationState},
    repositories::PublicationRepository,
};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use crate::error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};

const PUBLICATION_COLUMNS: &str = "id, pool_id, state, state_date, publish_date, revision, data";

pub struct SqlitePublicationRepository {
    pool: SqlitePool,
}

impl SqlitePublicationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_publication(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<Publication> {
        Ok(Publication {
            id: row.try_get("id")?,
            pool_id: row.try_get("pool_id")?,
            state: row.try_get("state")?,
            state_date: row.try_get("state_date")?,
            publish_date: row.try_get("publish_date")?,
            revision: row.try_get("revision")?,
            data: row.try_get("data")?,
        })
    }
}

#[async_trait]
impl PublicationRepository for SqlitePublicationRepository {
    #[instrument(skip(self), fields(pool_id = %pool_id, revision = %revision))]
    async fn create_for_pool(
        &self,
        pool_id: i64,
        revision: i32,
        now: DateTime<Utc>,
    ) -> BrokerResult<Publication> {
        let context = OperationContext::new(RepositoryOperation::Create, "发布").with_id(pool_id);

        // 检查与插入在同一条语句内完成，存在非终态发布时不写入任何行
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO publications (pool_id, state, state_date, publish_date, revision, data)
            SELECT ?, 'LAUNCHING', ?, ?, ?, NULL
            WHERE NOT EXISTS (
                SELECT 1 FROM publications
                WHERE pool_id = ?
                  AND state IN ('LAUNCHING', 'PREPARING', 'REMOVING', 'CANCELING')
            )
            RETURNING {PUBLICATION_COLUMNS}
            "#
        ))
        .bind(pool_id)
        .bind(now)
        .bind(now)
        .bind(revision)
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        match row {
            Some(row) => {
                let publication = Self::row_to_publication(&row)?;
                debug!(
                    "创建发布: ID {} (服务池: {}, 修订号: {})",
                    publication.id, pool_id, revision
                );
                Ok(publication)
            }
            None => {
                warn!("服务池 {} 已有进行中的发布", pool_id);
                Err(BrokerError::AlreadyPublishing(format!(
                    "服务池 {pool_id} 已有进行中的发布"
                )))
            }
        }
    }

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<Publication>> {
        let context = OperationContext::new(RepositoryOperation::Read, "发布").with_id(id);
        let row = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_publication).transpose()
    }

    #[instrument(skip(self, publication), fields(publication_id = %publication.id, state = %publication.state))]
    async fn update(&self, publication: &Publication) -> BrokerResult<()> {
        let context =
            OperationContext::new(RepositoryOperation::Update, "发布").with_id(publication.id);
        let result = sqlx::query(
            "UPDATE publications SET state = ?, state_date = ?, data = ? WHERE id = ?",
        )
        .bind(publication.state)
        .bind(publication.state_date)
        .bind(&publication.data)
        .bind(publication.id)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::PublicationNotFound { id: publication.id });
        }
        Ok(())
    }

    async fn compare_and_set_state(
        &self,
        id: i64,
        expected: PublicationState,
        new_state: PublicationState,
        now: DateTime<Utc>,
    ) -> BrokerResult<bool> {
        let context = OperationContext::new(RepositoryOperation::Update, "发布").with_id(id);
        let result = sqlx::query(
            "UPDATE publications SET state = ?, state_date = ? WHERE id = ? AND state = ?",
        )
        .bind(new_state)
        .bind(now)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        let changed = result.rows_affected() == 1;
        if changed {
            debug!("发布 {} 状态: {} -> {}", id, expected, new_state);
        }
        Ok(changed)
    }

    async fn transition_pool_publications(
        &self,
        pool_id: i64,
        from: PublicationState,
        to: PublicationState,
        except_id: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<u64> {
        let context = OperationContext::new(RepositoryOperation::Update, "发布").with_id(pool_id);
        let result = sqlx::query(
            r#"
            UPDATE publications SET state = ?, state_date = ?
            WHERE pool_id = ? AND state = ? AND id != ?
            "#,
        )
        .bind(to)
        .bind(now)
        .bind(pool_id)
        .bind(from)
        .bind(except_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected())
    }

    async fn active_for_pool(&self, pool_id: i64) -> BrokerResult<Option<Publication>> {
        let context = OperationContext::new(RepositoryOperation::Read, "发布").with_id(pool_id);
        let row = sqlx::query(&format!(
            r#"
            SELECT {PUBLICATION_COLUMNS} FROM publications
            WHERE pool_id = ? AND state = 'USABLE'
            ORDER BY revision DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_publication).transpose()
    }

    async fn count_in_state(&self, pool_id: i64, state: PublicationState) -> BrokerResult<i64> {
        let context = OperationContext::new(RepositoryOperation::Query, "发布").with_id(pool_id);
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM publications WHERE pool_id = ? AND state = ?",
        )
        .bind(pool_id)
        .bind(state)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(row.try_get("count")?)
    }

    async fn list_by_pool(&self, pool_id: i64) -> BrokerResult<Vec<Publication>> {
        let context = OperationContext::new(RepositoryOperation::Read, "发布").with_id(pool_id);
        let rows = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE pool_id = ? ORDER BY id ASC"
        ))
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_publication).collect()
    }

    async fn list_in_state(&self, state: PublicationState) -> BrokerResult<Vec<Publication>> {
        let context = OperationContext::new(RepositoryOperation::Read, "发布").with_id(state);
        let rows = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE state = ? ORDER BY id ASC"
        ))
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_publication).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::SqlitePoolRepository;
    use crate::database::DatabaseManager;
    use broker_domain::entities::{Pool, PoolState};
    use broker_domain::repositories::PoolRepository;

    async fn setup() -> (DatabaseManager, SqlitePublicationRepository, i64) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let pools = SqlitePoolRepository::new(manager.pool().clone());
        let pool = pools
            .create(&Pool {
                id: 0,
                name: "win11".into(),
                state: PoolState::Active,
                initial_size: 1,
                cache_l1_target: 1,
                cache_l2_target: 0,
                max_size: 5,
                requires_publication: true,
                current_publication_revision: 1,
            })
            .await
            .unwrap();
        let repo = SqlitePublicationRepository::new(manager.pool().clone());
        (manager, repo, pool.id)
    }

    #[tokio::test]
    async fn test_create_rejects_second_in_flight_publication() {
        let (_manager, repo, pool_id) = setup().await;
        let now = Utc::now();

        let first = repo.create_for_pool(pool_id, 1, now).await.unwrap();
        assert_eq!(first.state, PublicationState::Launching);

        let second = repo.create_for_pool(pool_id, 1, now).await;
        assert!(matches!(second, Err(BrokerError::AlreadyPublishing(_))));
        assert_eq!(repo.list_by_pool(pool_id).await.unwrap().len(), 1);

        // 终态后允许再次发布
        repo.compare_and_set_state(first.id, PublicationState::Launching, PublicationState::Canceled, now)
            .await
            .unwrap();
        assert!(repo.create_for_pool(pool_id, 1, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_compare_and_set_state() {
        let (_manager, repo, pool_id) = setup().await;
        let now = Utc::now();
        let publication = repo.create_for_pool(pool_id, 1, now).await.unwrap();

        assert!(repo
            .compare_and_set_state(publication.id, PublicationState::Launching, PublicationState::Preparing, now)
            .await
            .unwrap());
        assert!(!repo
            .compare_and_set_state(publication.id, PublicationState::Launching, PublicationState::Canceled, now)
            .await
            .unwrap());

        let stored = repo.get_by_id(publication.id).await.unwrap().unwrap();
        assert_eq!(stored.state, PublicationState::Preparing);
    }

    #[tokio::test]
    async fn test_update_persists_data() {
        let (_manager, repo, pool_id) = setup().await;
        let now = Utc::now();
        let mut publication = repo.create_for_pool(pool_id, 1, now).await.unwrap();

        publication.set_state(PublicationState::Usable, now);
        publication.data = Some(r#"{"progress":100}"#.into());
        repo.update(&publication).await.unwrap();

        let stored = repo.get_by_id(publication.id).await.unwrap().unwrap();
        assert_eq!(stored.state, PublicationState::Usable);
        assert_eq!(stored.data.as_deref(), Some(r#"{"progress":100}"#));
        assert_eq!(
            repo.active_for_pool(pool_id).await.unwrap().map(|p| p.id),
            Some(publication.id)
        );

        publication.id = 999;
        assert!(matches!(
            repo.update(&publication).await,
            Err(BrokerError::PublicationNotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_transition_pool_publications_skips_excluded() {
        let (_manager, repo, pool_id) = setup().await;
        let now = Utc::now();

        let mut old = repo.create_for_pool(pool_id, 1, now).await.unwrap();
        old.set_state(PublicationState::Usable, now);
        repo.update(&old).await.unwrap();
        let mut new = repo.create_for_pool(pool_id, 2, now).await.unwrap();
        new.set_state(PublicationState::Usable, now);
        repo.update(&new).await.unwrap();

        let moved = repo
            .transition_pool_publications(
                pool_id,
                PublicationState::Usable,
                PublicationState::Removable,
                new.id,
                now,
            )
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(
            repo.count_in_state(pool_id, PublicationState::Removable).await.unwrap(),
            1
        );
        assert_eq!(
            repo.list_in_state(PublicationState::Usable).await.unwrap()[0].id,
            new.id
        );
    }
}
