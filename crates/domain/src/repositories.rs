//! 领域仓储抽象
//!
//! 所有跨进程协调都依赖这里定义的原子操作：作业租约的比较并交换、延迟任务的先删除后执行、
//! 发布创建时的非终态检查。任何能提供行级锁或条件写入的存储都可以实现这些接口。

use async_trait::async_trait;
use broker_core::BrokerResult;
use chrono::{DateTime, Duration, Utc};

use crate::entities::{
    CacheItem, CacheLevel, DelayedTaskRecord, Pool, Publication, PublicationState, ScheduledJob,
    UserServiceState, UtilityCacheEntry,
};

/// 周期作业租约仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 注册作业；已存在同名作业时只更新类型与间隔，保留下次执行时间
    async fn ensure_job(
        &self,
        name: &str,
        kind: &str,
        interval_seconds: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<ScheduledJob>;

    /// 在单个事务中认领最早到期且无有效租约的作业，同时设置租约与下次执行时间。
    /// 被其他 worker 抢先认领时返回 `None`。
    async fn claim_next_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> BrokerResult<Option<ScheduledJob>>;

    /// 释放租约，仅当租约仍由 `owner` 持有时生效
    async fn release(&self, name: &str, owner: &str) -> BrokerResult<()>;

    /// 释放某个持有者遗留的全部租约，返回释放数量
    async fn release_owned_by(&self, owner: &str) -> BrokerResult<u64>;

    async fn get_by_name(&self, name: &str) -> BrokerResult<Option<ScheduledJob>>;

    async fn list(&self) -> BrokerResult<Vec<ScheduledJob>>;
}

/// 延迟任务仓储
#[async_trait]
pub trait DelayedTaskRepository: Send + Sync {
    async fn insert(&self, record: &DelayedTaskRecord) -> BrokerResult<DelayedTaskRecord>;

    /// 在单个事务中选出并删除最早可执行的任务（到期或插入时间位于未来）。
    /// 删除成功者独占执行权。
    async fn claim_next(&self, now: DateTime<Utc>) -> BrokerResult<Option<DelayedTaskRecord>>;

    async fn remove_by_tag(&self, tag: &str) -> BrokerResult<u64>;

    async fn count_by_tag(&self, tag: &str) -> BrokerResult<i64>;
}

/// 服务池仓储
#[async_trait]
pub trait PoolRepository: Send + Sync {
    async fn create(&self, pool: &Pool) -> BrokerResult<Pool>;

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<Pool>>;

    /// ACTIVE、max_size > 0 且需要缓存（initial_size > 0 或 cache_l1_target > 0）的服务池
    async fn list_cache_candidates(&self) -> BrokerResult<Vec<Pool>>;

    /// 修订号加一，返回新修订号
    async fn increment_revision(&self, id: i64) -> BrokerResult<i32>;
}

/// 发布仓储
#[async_trait]
pub trait PublicationRepository: Send + Sync {
    /// 原子地检查服务池没有非终态发布并创建新的 LAUNCHING 发布；
    /// 存在非终态发布时返回 `AlreadyPublishing` 且不写入任何数据。
    async fn create_for_pool(
        &self,
        pool_id: i64,
        revision: i32,
        now: DateTime<Utc>,
    ) -> BrokerResult<Publication>;

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<Publication>>;

    /// 保存状态、状态时间与进度数据
    async fn update(&self, publication: &Publication) -> BrokerResult<()>;

    /// 仅当当前状态为 `expected` 时切换状态，返回是否切换成功
    async fn compare_and_set_state(
        &self,
        id: i64,
        expected: PublicationState,
        new_state: PublicationState,
        now: DateTime<Utc>,
    ) -> BrokerResult<bool>;

    /// 把服务池内处于 `from` 的发布全部改为 `to`，`except_id` 除外
    async fn transition_pool_publications(
        &self,
        pool_id: i64,
        from: PublicationState,
        to: PublicationState,
        except_id: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<u64>;

    /// 服务池当前可用的发布（USABLE，修订号最大者）
    async fn active_for_pool(&self, pool_id: i64) -> BrokerResult<Option<Publication>>;

    async fn count_in_state(&self, pool_id: i64, state: PublicationState) -> BrokerResult<i64>;

    async fn list_by_pool(&self, pool_id: i64) -> BrokerResult<Vec<Publication>>;

    async fn list_in_state(&self, state: PublicationState) -> BrokerResult<Vec<Publication>>;
}

/// 用户服务实例仓储
#[async_trait]
pub trait CacheItemRepository: Send + Sync {
    async fn create(&self, item: &CacheItem) -> BrokerResult<CacheItem>;

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<CacheItem>>;

    /// 统计服务池某层级中处于可计数状态（PREPARING/USABLE）的实例
    async fn count_in_level(&self, pool_id: i64, level: CacheLevel) -> BrokerResult<i64>;

    /// 服务池中全部层级处于可计数状态的实例数
    async fn count_live(&self, pool_id: i64) -> BrokerResult<i64>;

    /// 某层级可计数实例，按创建时间排序
    async fn list_in_level(
        &self,
        pool_id: i64,
        level: CacheLevel,
        newest_first: bool,
    ) -> BrokerResult<Vec<CacheItem>>;

    async fn move_to_level(&self, id: i64, level: CacheLevel) -> BrokerResult<()>;

    async fn update_state(
        &self,
        id: i64,
        state: UserServiceState,
        now: DateTime<Utc>,
    ) -> BrokerResult<()>;

    /// 发布下仍有进行中操作（非终态信息状态）的实例数
    async fn count_in_process_for_publication(&self, publication_id: i64) -> BrokerResult<i64>;

    /// 把服务池中不属于 `current_publication_id` 的缓存实例（L1/L2，可计数状态）标记为 REMOVABLE
    async fn mark_superseded_removable(
        &self,
        pool_id: i64,
        current_publication_id: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<u64>;

    async fn list_by_pool(&self, pool_id: i64) -> BrokerResult<Vec<CacheItem>>;

    /// 所有服务池中处于 `state` 的实例，按状态变更时间排序，最多 `limit` 个
    async fn list_in_state(&self, state: UserServiceState, limit: i64)
        -> BrokerResult<Vec<CacheItem>>;

    /// 删除状态变更时间早于 `cutoff` 的终态信息实例（REMOVED/CANCELED/ERROR）
    async fn delete_info_older_than(&self, cutoff: DateTime<Utc>) -> BrokerResult<u64>;
}

/// 通用键值缓存仓储
#[async_trait]
pub trait UtilityCacheRepository: Send + Sync {
    async fn get(&self, owner: &str, key: &str) -> BrokerResult<Option<UtilityCacheEntry>>;

    /// 写入或覆盖
    async fn put(&self, entry: &UtilityCacheEntry) -> BrokerResult<()>;

    async fn remove(&self, owner: &str, key: &str) -> BrokerResult<()>;

    /// 删除已过期条目，返回删除数量
    async fn clean_up(&self, now: DateTime<Utc>) -> BrokerResult<u64>;
}
