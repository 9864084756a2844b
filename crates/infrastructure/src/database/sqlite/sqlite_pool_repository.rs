use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{entities::Pool, repositories::PoolRepository};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};

const POOL_COLUMNS: &str = "id, name, state, initial_size, cache_l1_target, cache_l2_target, \
                            max_size, requires_publication, current_publication_revision";

pub struct SqlitePoolRepository {
    pool: SqlitePool,
}

impl SqlitePoolRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_pool(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<Pool> {
        Ok(Pool {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            state: row.try_get("state")?,
            initial_size: row.try_get("initial_size")?,
            cache_l1_target: row.try_get("cache_l1_target")?,
            cache_l2_target: row.try_get("cache_l2_target")?,
            max_size: row.try_get("max_size")?,
            requires_publication: row.try_get("requires_publication")?,
            current_publication_revision: row.try_get("current_publication_revision")?,
        })
    }
}

#[async_trait]
impl PoolRepository for SqlitePoolRepository {
    #[instrument(skip(self, pool), fields(pool_name = %pool.name))]
    async fn create(&self, pool: &Pool) -> BrokerResult<Pool> {
        let context = OperationContext::new(RepositoryOperation::Create, "服务池").with_id(&pool.name);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pools (name, state, initial_size, cache_l1_target, cache_l2_target,
                               max_size, requires_publication, current_publication_revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {POOL_COLUMNS}
            "#
        ))
        .bind(&pool.name)
        .bind(pool.state)
        .bind(pool.initial_size)
        .bind(pool.cache_l1_target)
        .bind(pool.cache_l2_target)
        .bind(pool.max_size)
        .bind(pool.requires_publication)
        .bind(pool.current_publication_revision)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        let created = Self::row_to_pool(&row)?;
        debug!("创建服务池: {}", created);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<Pool>> {
        let context = OperationContext::new(RepositoryOperation::Read, "服务池").with_id(id);
        let row = sqlx::query(&format!("SELECT {POOL_COLUMNS} FROM pools WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_pool).transpose()
    }

    async fn list_cache_candidates(&self) -> BrokerResult<Vec<Pool>> {
        let context = OperationContext::new(RepositoryOperation::Read, "服务池");
        let rows = sqlx::query(&format!(
            r#"
            SELECT {POOL_COLUMNS} FROM pools
            WHERE state = 'ACTIVE'
              AND max_size > 0
              AND (initial_size > 0 OR cache_l1_target > 0)
            ORDER BY id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_pool).collect()
    }

    async fn increment_revision(&self, id: i64) -> BrokerResult<i32> {
        let context = OperationContext::new(RepositoryOperation::Update, "服务池").with_id(id);
        let row = sqlx::query(
            r#"
            UPDATE pools SET current_publication_revision = current_publication_revision + 1
            WHERE id = ?
            RETURNING current_publication_revision
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        match row {
            Some(row) => Ok(row.try_get("current_publication_revision")?),
            None => Err(BrokerError::PoolNotFound { id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use broker_domain::entities::PoolState;

    fn sample_pool(name: &str, initial: i32, l1: i32, max: i32) -> Pool {
        Pool {
            id: 0,
            name: name.to_string(),
            state: PoolState::Active,
            initial_size: initial,
            cache_l1_target: l1,
            cache_l2_target: 0,
            max_size: max,
            requires_publication: true,
            current_publication_revision: 1,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = SqlitePoolRepository::new(manager.pool().clone());

        let created = repo.create(&sample_pool("win11", 2, 1, 10)).await.unwrap();
        assert!(created.id > 0);

        let found = repo.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(found, created);
        assert!(repo.get_by_id(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_cache_candidates_filters() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = SqlitePoolRepository::new(manager.pool().clone());

        let wanted = repo.create(&sample_pool("wanted", 2, 0, 10)).await.unwrap();
        repo.create(&sample_pool("no-max", 2, 1, 0)).await.unwrap();
        repo.create(&sample_pool("no-cache", 0, 0, 10)).await.unwrap();
        let mut removed = sample_pool("removed", 2, 1, 10);
        removed.state = PoolState::Removed;
        repo.create(&removed).await.unwrap();

        let candidates = repo.list_cache_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, wanted.id);
    }

    #[tokio::test]
    async fn test_increment_revision() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = SqlitePoolRepository::new(manager.pool().clone());
        let pool = repo.create(&sample_pool("p", 1, 1, 5)).await.unwrap();

        assert_eq!(repo.increment_revision(pool.id).await.unwrap(), 2);
        assert_eq!(repo.increment_revision(pool.id).await.unwrap(), 3);
        assert!(matches!(
            repo.increment_revision(404).await,
            Err(BrokerError::PoolNotFound { id: 404 })
        ));
    }
}
