use async_trait::async_trait;
use broker_core::BrokerResult;
use broker_domain::{entities::UtilityCacheEntry, repositories::UtilityCacheRepository};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};

pub struct SqliteUtilityCacheRepository {
    pool: SqlitePool,
}

impl SqliteUtilityCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<UtilityCacheEntry> {
        Ok(UtilityCacheEntry {
            owner: row.try_get("owner")?,
            key: row.try_get("key")?,
            value: row.try_get("value")?,
            created: row.try_get("created")?,
            validity_seconds: row.try_get("validity_seconds")?,
        })
    }
}

#[async_trait]
impl UtilityCacheRepository for SqliteUtilityCacheRepository {
    async fn get(&self, owner: &str, key: &str) -> BrokerResult<Option<UtilityCacheEntry>> {
        let context = OperationContext::new(RepositoryOperation::Read, "缓存条目")
            .with_id(format!("{owner}/{key}"));
        let row = sqlx::query(
            "SELECT owner, key, value, created, validity_seconds FROM utility_cache WHERE owner = ? AND key = ?",
        )
        .bind(owner)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn put(&self, entry: &UtilityCacheEntry) -> BrokerResult<()> {
        let context = OperationContext::new(RepositoryOperation::Create, "缓存条目")
            .with_id(format!("{}/{}", entry.owner, entry.key));
        sqlx::query(
            r#"
            INSERT INTO utility_cache (owner, key, value, created, validity_seconds)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner, key) DO UPDATE SET
                value = excluded.value,
                created = excluded.created,
                validity_seconds = excluded.validity_seconds
            "#,
        )
        .bind(&entry.owner)
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.created)
        .bind(entry.validity_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;
        Ok(())
    }

    async fn remove(&self, owner: &str, key: &str) -> BrokerResult<()> {
        let context = OperationContext::new(RepositoryOperation::Delete, "缓存条目")
            .with_id(format!("{owner}/{key}"));
        sqlx::query("DELETE FROM utility_cache WHERE owner = ? AND key = ?")
            .bind(owner)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;
        Ok(())
    }

    async fn clean_up(&self, now: DateTime<Utc>) -> BrokerResult<u64> {
        let context = OperationContext::new(RepositoryOperation::Delete, "过期缓存条目");
        let result = sqlx::query(
            "DELETE FROM utility_cache WHERE (julianday(?) - julianday(created)) * 86400.0 > validity_seconds",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!("清理过期缓存条目 {} 个", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Duration;

    async fn setup_test_repo() -> (DatabaseManager, SqliteUtilityCacheRepository) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteUtilityCacheRepository::new(manager.pool().clone());
        (manager, repo)
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();

        repo.put(&UtilityCacheEntry::new("ldap", "uid", "a".into(), 60, now))
            .await
            .unwrap();
        repo.put(&UtilityCacheEntry::new("ldap", "uid", "b".into(), 60, now))
            .await
            .unwrap();

        let entry = repo.get("ldap", "uid").await.unwrap().unwrap();
        assert_eq!(entry.value, "b");
        assert!(repo.get("other", "uid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_restarts_validity_and_remove() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.put(&UtilityCacheEntry::new("ldap", "uid", "a".into(), 60, now))
            .await
            .unwrap();

        let later = now + Duration::seconds(30);
        repo.put(&UtilityCacheEntry::new("ldap", "uid", "a".into(), 60, later))
            .await
            .unwrap();
        assert_eq!(repo.get("ldap", "uid").await.unwrap().unwrap().created, later);

        repo.remove("ldap", "uid").await.unwrap();
        assert!(repo.get("ldap", "uid").await.unwrap().is_none());
        // 删除不存在的条目不是错误
        repo.remove("ldap", "uid").await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_up_only_expired() {
        let (_manager, repo) = setup_test_repo().await;
        let now = Utc::now();
        repo.put(&UtilityCacheEntry::new("a", "old", "x".into(), 10, now - Duration::seconds(60)))
            .await
            .unwrap();
        repo.put(&UtilityCacheEntry::new("a", "fresh", "x".into(), 600, now - Duration::seconds(60)))
            .await
            .unwrap();

        assert_eq!(repo.clean_up(now).await.unwrap(), 1);
        assert!(repo.get("a", "old").await.unwrap().is_none());
        assert!(repo.get("a", "fresh").await.unwrap().is_some());
    }
}
