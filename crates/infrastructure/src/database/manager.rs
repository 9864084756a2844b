use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use broker_core::{BrokerResult, DatabaseConfig};
use broker_domain::repositories::{
    CacheItemRepository, DelayedTaskRepository, JobRepository, PoolRepository,
    PublicationRepository, UtilityCacheRepository,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::migrations::run_migrations;
use super::sqlite::{
    SqliteCacheItemRepository, SqliteDelayedTaskRepository, SqliteJobRepository,
    SqlitePoolRepository, SqlitePublicationRepository, SqliteUtilityCacheRepository,
};

/// 数据库管理器，持有连接池并充当各仓储的工厂
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> BrokerResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await?;

        info!("数据库连接池创建完成: {}", config.url);
        Ok(Self { pool })
    }

    /// 单连接的内存数据库，所有仓储共享同一个库
    pub async fn in_memory() -> BrokerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> BrokerResult<()> {
        run_migrations(&self.pool).await
    }

    pub async fn health_check(&self) -> BrokerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::new(SqliteJobRepository::new(self.pool.clone()))
    }

    pub fn delayed_task_repository(&self) -> Arc<dyn DelayedTaskRepository> {
        Arc::new(SqliteDelayedTaskRepository::new(self.pool.clone()))
    }

    pub fn pool_repository(&self) -> Arc<dyn PoolRepository> {
        Arc::new(SqlitePoolRepository::new(self.pool.clone()))
    }

    pub fn publication_repository(&self) -> Arc<dyn PublicationRepository> {
        Arc::new(SqlitePublicationRepository::new(self.pool.clone()))
    }

    pub fn cache_item_repository(&self) -> Arc<dyn CacheItemRepository> {
        Arc::new(SqliteCacheItemRepository::new(self.pool.clone()))
    }

    pub fn utility_cache_repository(&self) -> Arc<dyn UtilityCacheRepository> {
        Arc::new(SqliteUtilityCacheRepository::new(self.pool.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_manager() {
        let db_manager = DatabaseManager::in_memory().await.unwrap();
        assert!(db_manager.health_check().await.is_ok());

        // 迁移可以重复执行
        assert!(db_manager.migrate().await.is_ok());

        let _job_repo = db_manager.job_repository();
        let _task_repo = db_manager.delayed_task_repository();

        db_manager.close().await;
    }

    #[tokio::test]
    async fn test_file_database_manager() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("broker.db").display()),
            max_connections: 2,
            min_connections: 1,
            connection_timeout_seconds: 5,
        };

        let db_manager = DatabaseManager::new(&config).await.unwrap();
        db_manager.migrate().await.unwrap();
        assert!(db_manager.health_check().await.is_ok());
        db_manager.close().await;
    }
}
