use broker_core::BrokerResult;
use sqlx::SqlitePool;
use tracing::info;

const SCHEMA: &[(&str, &str)] = &[
    (
        "创建作业表",
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            interval_seconds INTEGER NOT NULL,
            next_execution_time TEXT NOT NULL,
            lease_owner TEXT,
            lease_expiry TEXT
        )
        "#,
    ),
    (
        "创建延迟任务表",
        r#"
        CREATE TABLE IF NOT EXISTS delayed_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            insert_time TEXT NOT NULL,
            delay_seconds INTEGER NOT NULL,
            execution_time TEXT NOT NULL,
            tag TEXT NOT NULL DEFAULT ''
        )
        "#,
    ),
    (
        "创建服务池表",
        r#"
        CREATE TABLE IF NOT EXISTS pools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'ACTIVE',
            initial_size INTEGER NOT NULL DEFAULT 0 CHECK (initial_size >= 0),
            cache_l1_target INTEGER NOT NULL DEFAULT 0 CHECK (cache_l1_target >= 0),
            cache_l2_target INTEGER NOT NULL DEFAULT 0 CHECK (cache_l2_target >= 0),
            max_size INTEGER NOT NULL DEFAULT 0 CHECK (max_size >= 0),
            requires_publication INTEGER NOT NULL DEFAULT 1,
            current_publication_revision INTEGER NOT NULL DEFAULT 1
        )
        "#,
    ),
    (
        "创建发布表",
        r#"
        CREATE TABLE IF NOT EXISTS publications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pool_id INTEGER NOT NULL,
            state TEXT NOT NULL,
            state_date TEXT NOT NULL,
            publish_date TEXT NOT NULL,
            revision INTEGER NOT NULL,
            data TEXT,
            FOREIGN KEY (pool_id) REFERENCES pools (id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "创建用户服务实例表",
        r#"
        CREATE TABLE IF NOT EXISTS cache_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pool_id INTEGER NOT NULL,
            publication_id INTEGER,
            level TEXT NOT NULL,
            state TEXT NOT NULL,
            creation_time TEXT NOT NULL,
            state_date TEXT NOT NULL,
            FOREIGN KEY (pool_id) REFERENCES pools (id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "创建通用缓存表",
        r#"
        CREATE TABLE IF NOT EXISTS utility_cache (
            owner TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            created TEXT NOT NULL,
            validity_seconds INTEGER NOT NULL,
            PRIMARY KEY (owner, key)
        )
        "#,
    ),
    (
        "创建作业到期索引",
        "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next ON scheduled_jobs(next_execution_time)",
    ),
    (
        "创建延迟任务执行时间索引",
        "CREATE INDEX IF NOT EXISTS idx_delayed_tasks_execution ON delayed_tasks(execution_time)",
    ),
    (
        "创建延迟任务标签索引",
        "CREATE INDEX IF NOT EXISTS idx_delayed_tasks_tag ON delayed_tasks(tag)",
    ),
    (
        "创建发布状态索引",
        "CREATE INDEX IF NOT EXISTS idx_publications_pool_state ON publications(pool_id, state)",
    ),
    (
        "创建实例层级索引",
        "CREATE INDEX IF NOT EXISTS idx_cache_items_pool_level ON cache_items(pool_id, level, state)",
    ),
];

/// 运行SQLite数据库迁移，可重复执行
pub async fn run_migrations(pool: &SqlitePool) -> BrokerResult<()> {
    info!("运行SQLite数据库迁移");

    for (description, statement) in SCHEMA {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            broker_core::BrokerError::DatabaseOperation(format!("{description}失败: {e}"))
        })?;
    }

    info!("数据库迁移完成");
    Ok(())
}
