use std::sync::Arc;

use anyhow::{Context, Result};
use broker_core::AppConfig;
use broker_dispatcher::{
    worker_owner_id, DelayedTaskQueue, DelayedTaskRunner, DeployFailureGuard, JobRegistry,
    JobScheduler, PublicationCleaner, PublicationFinishCheckerHandler,
    PublicationLauncherHandler, PublicationManager, ServiceCacheUpdater, TaskRegistry,
    UserServiceFinishCheckerHandler, UserServiceInfoCleaner, UserServiceManager,
    UserServiceRemover, UtilityCacheCleaner, PUBLICATION_CLEANER_KIND,
    SERVICE_CACHE_UPDATER_KIND, USER_SERVICE_INFO_CLEANER_KIND, USER_SERVICE_REMOVER_KIND,
    UTILITY_CACHE_CLEANER_KIND,
};
use broker_domain::entities::ScheduledJob;
use broker_domain::providers::{PublicationProvider, UserServiceProvider};
use broker_domain::repositories::JobRepository;
use broker_infrastructure::{DatabaseManager, MetricsCollector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::providers::UnconfiguredProvider;
use crate::supervisor::Supervisor;

pub const SERVICE_CACHE_UPDATER_JOB: &str = "Service Cache Updater";
pub const USER_SERVICE_INFO_CLEANER_JOB: &str = "User Service Info Cleaner";
pub const USER_SERVICE_CLEANER_JOB: &str = "User Service Cleaner";
pub const PUBLICATION_CLEANER_JOB: &str = "Publication Cleaner";
pub const UTILITY_CACHE_CLEANER_JOB: &str = "Utility Cache Cleaner";

/// 应用程序主结构
///
/// 负责装配仓储、发布管理器、作业与延迟任务注册表，并交给 [`Supervisor`] 启动工作循环。
pub struct Application {
    config: AppConfig,
    database: Arc<DatabaseManager>,
    metrics: Arc<MetricsCollector>,
    hostname: String,
    job_registry: Arc<JobRegistry>,
    task_registry: Arc<TaskRegistry>,
    publication_manager: Arc<PublicationManager>,
}

impl Application {
    /// 连接数据库并执行迁移，使用未接入平台的服务提供者
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("连接数据库: {}", config.database.url);
        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        database.migrate().await.context("运行数据库迁移失败")?;
        info!("数据库连接成功");

        Ok(Self::with_providers(
            config,
            database,
            Arc::new(UnconfiguredProvider),
            Arc::new(UnconfiguredProvider),
        ))
    }

    pub fn with_providers(
        config: AppConfig,
        database: DatabaseManager,
        publication_provider: Arc<dyn PublicationProvider>,
        user_service_provider: Arc<dyn UserServiceProvider>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());

        let queue = Arc::new(DelayedTaskQueue::new(
            database.delayed_task_repository(),
            config.cache.delayed_task_insert_retries,
            Arc::clone(&metrics),
        ));

        let publication_manager = Arc::new(PublicationManager::new(
            database.pool_repository(),
            database.publication_repository(),
            database.cache_item_repository(),
            publication_provider,
            Arc::clone(&queue),
            config.cache.publication_launch_delay_seconds,
            Arc::clone(&metrics),
        ));

        let user_services = Arc::new(UserServiceManager::new(
            database.cache_item_repository(),
            database.publication_repository(),
            user_service_provider,
            queue,
        ));

        let mut task_registry = TaskRegistry::new();
        task_registry.register(Arc::new(PublicationLauncherHandler::new(Arc::clone(
            &publication_manager,
        ))));
        task_registry.register(Arc::new(PublicationFinishCheckerHandler::new(
            Arc::clone(&publication_manager),
        )));
        task_registry.register(Arc::new(UserServiceFinishCheckerHandler::new(
            Arc::clone(&user_services),
        )));

        let mut job_registry = JobRegistry::new();
        job_registry.register(
            SERVICE_CACHE_UPDATER_KIND,
            Arc::new(ServiceCacheUpdater::new(
                database.pool_repository(),
                database.publication_repository(),
                database.cache_item_repository(),
                Arc::clone(&user_services),
                DeployFailureGuard::new(
                    database.utility_cache_repository(),
                    config.cache.deploy_failure_limit,
                    config.cache.deploy_failure_block_seconds,
                ),
                Arc::clone(&metrics),
            )),
        );
        job_registry.register(
            USER_SERVICE_REMOVER_KIND,
            Arc::new(UserServiceRemover::new(
                database.cache_item_repository(),
                user_services,
                config.cache.user_service_remove_at_once,
            )),
        );
        job_registry.register(
            USER_SERVICE_INFO_CLEANER_KIND,
            Arc::new(UserServiceInfoCleaner::new(
                database.cache_item_repository(),
                config.cache.keep_info_seconds,
            )),
        );
        job_registry.register(
            PUBLICATION_CLEANER_KIND,
            Arc::new(PublicationCleaner::new(
                database.publication_repository(),
                Arc::clone(&publication_manager),
            )),
        );
        job_registry.register(
            UTILITY_CACHE_CLEANER_KIND,
            Arc::new(UtilityCacheCleaner::new(database.utility_cache_repository())),
        );

        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();

        Self {
            config,
            database: Arc::new(database),
            metrics,
            hostname,
            job_registry: Arc::new(job_registry),
            task_registry: Arc::new(task_registry),
            publication_manager,
        }
    }

    /// 覆盖用于租约持有者标识的主机名
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    /// 发布、取消与撤销发布的入口
    pub fn publication_manager(&self) -> Arc<PublicationManager> {
        Arc::clone(&self.publication_manager)
    }

    pub fn scheduler(&self, worker_index: usize) -> JobScheduler {
        JobScheduler::new(
            self.database.job_repository(),
            Arc::clone(&self.job_registry),
            worker_owner_id(&self.hostname, std::process::id(), worker_index),
            &self.config.scheduler,
            Arc::clone(&self.metrics),
        )
    }

    pub fn delayed_task_runner(&self) -> DelayedTaskRunner {
        DelayedTaskRunner::new(
            self.database.delayed_task_repository(),
            Arc::clone(&self.task_registry),
            &self.config.scheduler,
            Arc::clone(&self.metrics),
        )
    }

    /// 注册内置的周期作业，重复调用只会更新间隔
    pub async fn register_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let scheduler = self.scheduler(0);
        let cache = &self.config.cache;
        let jobs = [
            (
                SERVICE_CACHE_UPDATER_JOB,
                SERVICE_CACHE_UPDATER_KIND,
                cache.check_delay_seconds,
            ),
            (
                USER_SERVICE_INFO_CLEANER_JOB,
                USER_SERVICE_INFO_CLEANER_KIND,
                cache.user_service_info_cleaner_delay_seconds,
            ),
            (
                USER_SERVICE_CLEANER_JOB,
                USER_SERVICE_REMOVER_KIND,
                cache.user_service_cleaner_delay_seconds,
            ),
            (
                PUBLICATION_CLEANER_JOB,
                PUBLICATION_CLEANER_KIND,
                cache.publication_cleaner_delay_seconds,
            ),
            (
                UTILITY_CACHE_CLEANER_JOB,
                UTILITY_CACHE_CLEANER_KIND,
                cache.utility_cache_cleaner_delay_seconds,
            ),
        ];

        let mut registered = Vec::with_capacity(jobs.len());
        for (name, kind, interval) in jobs {
            let job = scheduler
                .register_job(name, kind, interval)
                .await
                .with_context(|| format!("注册作业失败: {name}"))?;
            info!("作业 {} 已注册，间隔 {} 秒", job.name, job.interval_seconds);
            registered.push(job);
        }

        Ok(registered)
    }

    pub async fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.database
            .job_repository()
            .list()
            .await
            .context("查询作业列表失败")
    }

    /// 运行调度服务，直到 `shutdown` 被取消
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("启动调度服务: {}", self.hostname);
        self.register_jobs().await?;

        let supervisor = Supervisor::new(self.config.scheduler.clone(), shutdown.clone());
        supervisor.start(self).await;

        shutdown.cancelled().await;
        info!("调度服务收到关闭信号");

        if !supervisor.wait().await {
            warn!(
                "工作循环未在 {} 秒内全部退出",
                self.config.scheduler.shutdown_timeout_seconds
            );
        }

        self.database.close().await;
        info!("调度服务已停止");
        Ok(())
    }
}
