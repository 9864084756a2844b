//! 后台任务调度核心
//!
//! 包含周期作业调度器、延迟任务队列与执行器、发布状态机、缓存层级控制器，
//! 以及注册到调度器上的清理作业。

pub mod cache_updater;
pub mod cleaners;
pub mod delayed_task_runner;
pub mod job_registry;
pub mod publication_manager;
pub mod scheduler;
pub mod task_registry;
pub mod user_service_manager;
pub mod utility_cache;

pub use cache_updater::{DeployFailureGuard, ServiceCacheUpdater, SERVICE_CACHE_UPDATER_KIND};
pub use cleaners::{
    PublicationCleaner, UserServiceInfoCleaner, UserServiceRemover, UtilityCacheCleaner,
    PUBLICATION_CLEANER_KIND, USER_SERVICE_INFO_CLEANER_KIND, USER_SERVICE_REMOVER_KIND,
    UTILITY_CACHE_CLEANER_KIND,
};
pub use delayed_task_runner::{DelayedTaskQueue, DelayedTaskRunner};
pub use job_registry::{Job, JobRegistry};
pub use publication_manager::{
    publication_tag, PublicationFinishCheckerHandler, PublicationLauncherHandler,
    PublicationManager,
};
pub use scheduler::{worker_owner_id, JobScheduler};
pub use task_registry::{DelayedTask, DelayedTaskHandler, TaskRegistry};
pub use user_service_manager::{
    user_service_tag, UserServiceFinishCheckerHandler, UserServiceManager,
};
pub use utility_cache::UtilityCache;
