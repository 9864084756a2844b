use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{
    entities::{CacheItem, CacheLevel, UserServiceState},
    repositories::CacheItemRepository,
};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};

const ITEM_COLUMNS: &str = "id, pool_id, publication_id, level, state, creation_time, state_date";

pub struct SqliteCacheItemRepository {
    pool: SqlitePool,
}

impl SqliteCacheItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<CacheItem> {
        Ok(CacheItem {
            id: row.try_get("id")?,
            pool_id: row.try_get("pool_id")?,
            publication_id: row.try_get("publication_id")?,
            level: row.try_get("level")?,
            state: row.try_get("state")?,
            creation_time: row.try_get("creation_time")?,
            state_date: row.try_get("state_date")?,
        })
    }
}

#[async_trait]
impl CacheItemRepository for SqliteCacheItemRepository {
    #[instrument(skip(self, item), fields(pool_id = %item.pool_id, level = %item.level))]
    async fn create(&self, item: &CacheItem) -> BrokerResult<CacheItem> {
        let context =
            OperationContext::new(RepositoryOperation::Create, "用户服务实例").with_id(item.pool_id);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO cache_items (pool_id, publication_id, level, state, creation_time, state_date)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(item.pool_id)
        .bind(item.publication_id)
        .bind(item.level)
        .bind(item.state)
        .bind(item.creation_time)
        .bind(item.state_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        let created = Self::row_to_item(&row)?;
        debug!(
            "创建用户服务实例: ID {} (服务池: {}, 层级: {})",
            created.id, created.pool_id, created.level
        );
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<CacheItem>> {
        let context = OperationContext::new(RepositoryOperation::Read, "用户服务实例").with_id(id);
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM cache_items WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn count_in_level(&self, pool_id: i64, level: CacheLevel) -> BrokerResult<i64> {
        let context =
            OperationContext::new(RepositoryOperation::Query, "用户服务实例").with_id(pool_id);
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM cache_items
            WHERE pool_id = ? AND level = ? AND state IN ('PREPARING', 'USABLE')
            "#,
        )
        .bind(pool_id)
        .bind(level)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(row.try_get("count")?)
    }

    async fn count_live(&self, pool_id: i64) -> BrokerResult<i64> {
        let context =
            OperationContext::new(RepositoryOperation::Query, "用户服务实例").with_id(pool_id);
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM cache_items WHERE pool_id = ? AND state IN ('PREPARING', 'USABLE')",
        )
        .bind(pool_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(row.try_get("count")?)
    }

    async fn list_in_level(
        &self,
        pool_id: i64,
        level: CacheLevel,
        newest_first: bool,
    ) -> BrokerResult<Vec<CacheItem>> {
        let context =
            OperationContext::new(RepositoryOperation::Read, "用户服务实例").with_id(pool_id);
        let order = if newest_first { "DESC" } else { "ASC" };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM cache_items
            WHERE pool_id = ? AND level = ? AND state IN ('PREPARING', 'USABLE')
            ORDER BY creation_time {order}, id {order}
            "#
        ))
        .bind(pool_id)
        .bind(level)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn move_to_level(&self, id: i64, level: CacheLevel) -> BrokerResult<()> {
        let context = OperationContext::new(RepositoryOperation::Update, "用户服务实例").with_id(id);
        let result = sqlx::query("UPDATE cache_items SET level = ? WHERE id = ?")
            .bind(level)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::CacheItemNotFound { id });
        }
        Ok(())
    }

    async fn update_state(
        &self,
        id: i64,
        state: UserServiceState,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let context = OperationContext::new(RepositoryOperation::Update, "用户服务实例").with_id(id);
        let result = sqlx::query("UPDATE cache_items SET state = ?, state_date = ? WHERE id = ?")
            .bind(state)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::CacheItemNotFound { id });
        }
        Ok(())
    }

    async fn count_in_process_for_publication(&self, publication_id: i64) -> BrokerResult<i64> {
        let context = OperationContext::new(RepositoryOperation::Query, "用户服务实例")
            .with_id(publication_id);
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM cache_items
            WHERE publication_id = ? AND state NOT IN ('REMOVED', 'CANCELED', 'ERROR')
            "#,
        )
        .bind(publication_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(row.try_get("count")?)
    }

    async fn mark_superseded_removable(
        &self,
        pool_id: i64,
        current_publication_id: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<u64> {
        let context =
            OperationContext::new(RepositoryOperation::Update, "用户服务实例").with_id(pool_id);
        let result = sqlx::query(
            r#"
            UPDATE cache_items SET state = 'REMOVABLE', state_date = ?
            WHERE pool_id = ?
              AND level IN ('L1', 'L2')
              AND state IN ('PREPARING', 'USABLE')
              AND (publication_id IS NULL OR publication_id != ?)
            "#,
        )
        .bind(now)
        .bind(pool_id)
        .bind(current_publication_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!(
            "服务池 {} 中 {} 个旧发布缓存实例标记为可移除",
            pool_id,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    async fn list_by_pool(&self, pool_id: i64) -> BrokerResult<Vec<CacheItem>> {
        let context =
            OperationContext::new(RepositoryOperation::Read, "用户服务实例").with_id(pool_id);
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM cache_items WHERE pool_id = ? ORDER BY id ASC"
        ))
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn list_in_state(
        &self,
        state: UserServiceState,
        limit: i64,
    ) -> BrokerResult<Vec<CacheItem>> {
        let context = OperationContext::new(RepositoryOperation::Query, "用户服务实例");
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM cache_items WHERE state = ? ORDER BY state_date ASC, id ASC LIMIT ?"
        ))
        .bind(state)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn delete_info_older_than(&self, cutoff: DateTime<Utc>) -> BrokerResult<u64> {
        let context = OperationContext::new(RepositoryOperation::Delete, "用户服务实例");
        let result = sqlx::query(
            r#"
            DELETE FROM cache_items
            WHERE state IN ('REMOVED', 'CANCELED', 'ERROR')
              AND julianday(state_date) < julianday(?)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!("删除过期的用户服务实例记录 {} 个", result.rows_affected());
        Ok(result.rows_affected())
    }
}
