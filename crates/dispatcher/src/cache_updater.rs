//! 缓存层级控制器
//!
//! 每次执行只选出一个服务池并只做一个动作（增减一个实例或移动一个实例），
//! 依靠周期性的重复执行逐步收敛到配置的缓存规模。

use std::sync::Arc;

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{
    entities::{CacheLevel, Pool, PublicationState},
    repositories::{
        CacheItemRepository, PoolRepository, PublicationRepository, UtilityCacheRepository,
    },
};
use broker_infrastructure::{MetricsCollector, StructuredLogger};
use tracing::{debug, error, info, warn};

use crate::job_registry::Job;
use crate::user_service_manager::UserServiceManager;
use crate::utility_cache::UtilityCache;

pub const SERVICE_CACHE_UPDATER_KIND: &str = "service_cache_updater";

const DEPLOY_FAILURES_OWNER: &str = "service_cache_updater";

/// 比例按万分比计算，值越小越紧急
pub fn calc_proportion(target: i64, actual: i64) -> i64 {
    actual * 10000 / target
}

/// 服务池当前处于可计数状态的实例数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheCounts {
    pub l1: i64,
    pub l2: i64,
    pub assigned: i64,
}

impl CacheCounts {
    /// L1 缓存与已分配实例之和
    pub fn total(&self) -> i64 {
        self.l1 + self.assigned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    ReduceL1,
    ReduceL2,
    GrowL1,
    GrowL2,
    Nothing,
}

impl CacheAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheAction::ReduceL1 => "reduce_l1",
            CacheAction::ReduceL2 => "reduce_l2",
            CacheAction::GrowL1 => "grow_l1",
            CacheAction::GrowL2 => "grow_l2",
            CacheAction::Nothing => "nothing",
        }
    }
}

/// 为选中的服务池决定唯一的动作，先缩减后增长
pub fn decide_action(pool: &Pool, counts: &CacheCounts) -> CacheAction {
    let total = counts.total();
    let initial = i64::from(pool.initial_size);
    let l1_target = i64::from(pool.cache_l1_target);
    let l2_target = i64::from(pool.cache_l2_target);
    let max = i64::from(pool.max_size);

    if total > max {
        CacheAction::ReduceL1
    } else if total > initial && counts.l1 > l1_target {
        CacheAction::ReduceL1
    } else if counts.l2 > l2_target {
        CacheAction::ReduceL2
    } else if total < max && (total < initial || counts.l1 < l1_target) {
        CacheAction::GrowL1
    } else if counts.l2 < l2_target {
        CacheAction::GrowL2
    } else {
        CacheAction::Nothing
    }
}

/// 各服务池连续部署失败的次数
///
/// 计数存放在通用缓存中，每次失败都重新开始有效期。次数达到上限后，该服务池
/// 在计数过期前不再参与增长；任何一次部署成功都会清零。
pub struct DeployFailureGuard {
    cache: UtilityCache,
    limit: u32,
    block_seconds: i64,
}

impl DeployFailureGuard {
    pub fn new(repo: Arc<dyn UtilityCacheRepository>, limit: u32, block_seconds: u64) -> Self {
        Self {
            cache: UtilityCache::new(DEPLOY_FAILURES_OWNER, repo),
            limit,
            block_seconds: block_seconds as i64,
        }
    }

    fn key(pool_id: i64) -> String {
        format!("deploy-failures-{pool_id}")
    }

    pub async fn failures(&self, pool_id: i64) -> BrokerResult<u32> {
        Ok(self.cache.get::<u32>(&Self::key(pool_id)).await?.unwrap_or(0))
    }

    pub async fn is_blocked(&self, pool_id: i64) -> BrokerResult<bool> {
        Ok(self.failures(pool_id).await? >= self.limit)
    }

    /// 返回累计的失败次数
    pub async fn record_failure(&self, pool_id: i64) -> BrokerResult<u32> {
        let failures = self.failures(pool_id).await? + 1;
        self.cache
            .put(&Self::key(pool_id), &failures, Some(self.block_seconds))
            .await?;
        Ok(failures)
    }

    pub async fn clear(&self, pool_id: i64) -> BrokerResult<()> {
        self.cache.remove(&Self::key(pool_id)).await
    }
}

pub struct ServiceCacheUpdater {
    pools: Arc<dyn PoolRepository>,
    publications: Arc<dyn PublicationRepository>,
    cache_items: Arc<dyn CacheItemRepository>,
    user_services: Arc<UserServiceManager>,
    deploy_guard: DeployFailureGuard,
    metrics: Arc<MetricsCollector>,
}

impl ServiceCacheUpdater {
    pub fn new(
        pools: Arc<dyn PoolRepository>,
        publications: Arc<dyn PublicationRepository>,
        cache_items: Arc<dyn CacheItemRepository>,
        user_services: Arc<UserServiceManager>,
        deploy_guard: DeployFailureGuard,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pools,
            publications,
            cache_items,
            user_services,
            deploy_guard,
            metrics,
        }
    }

    async fn counts_for(&self, pool: &Pool) -> BrokerResult<CacheCounts> {
        Ok(CacheCounts {
            l1: self.cache_items.count_in_level(pool.id, CacheLevel::L1).await?,
            l2: self.cache_items.count_in_level(pool.id, CacheLevel::L2).await?,
            assigned: self
                .cache_items
                .count_in_level(pool.id, CacheLevel::Assigned)
                .await?,
        })
    }

    /// 选出最需要调整缓存的服务池
    pub async fn select_pool(&self) -> BrokerResult<Option<(Pool, CacheCounts)>> {
        let mut selected: Option<(Pool, CacheCounts)> = None;
        // 一旦选中 L1 相关的候选，L2 增长不再参与比较
        let mut to_cache_l1 = false;
        let mut proportion = calc_proportion(1, 1);

        for pool in self.pools.list_cache_candidates().await? {
            if pool.requires_publication
                && self.publications.active_for_pool(pool.id).await?.is_none()
            {
                debug!("服务池 {} 需要发布但没有可用发布，跳过", pool);
                continue;
            }
            if self
                .publications
                .count_in_state(pool.id, PublicationState::Preparing)
                .await?
                > 0
            {
                debug!("服务池 {} 有正在进行的发布，暂停缓存调整", pool);
                continue;
            }

            let counts = self.counts_for(&pool).await?;
            let total = counts.total();
            let initial = i64::from(pool.initial_size);
            let l1_target = i64::from(pool.cache_l1_target);
            let l2_target = i64::from(pool.cache_l2_target);
            let max = i64::from(pool.max_size);
            debug!(
                "检查服务池 {}: L1 {}, L2 {}, 已分配 {}",
                pool, counts.l1, counts.l2, counts.assigned
            );

            if total > max {
                debug!("服务池 {} 实例数超过上限", pool);
                return Ok(Some((pool, counts)));
            }
            if total > initial && counts.l1 > l1_target {
                debug!("服务池 {} 的 L1 缓存超过配置", pool);
                return Ok(Some((pool, counts)));
            }

            if counts.l2 > l2_target && !to_cache_l1 {
                selected = Some((pool.clone(), counts));
                proportion = calc_proportion(1, 0);
            }

            if !self.user_services.can_initiate(&pool).await? {
                debug!("服务池 {} 的服务提供者无法启动更多实例", pool);
                continue;
            }
            if self.deploy_guard.is_blocked(pool.id).await? {
                debug!("服务池 {} 连续部署失败次数过多，暂停增长", pool);
                continue;
            }

            if counts.l2 < l2_target {
                let p = calc_proportion(l2_target, counts.l2);
                if p < proportion && !to_cache_l1 {
                    selected = Some((pool.clone(), counts));
                    proportion = p;
                }
            }

            if total == max {
                continue;
            }

            if total < initial {
                let p = calc_proportion(initial, total);
                if p < proportion || !to_cache_l1 {
                    to_cache_l1 = true;
                    selected = Some((pool.clone(), counts));
                    proportion = p;
                }
            }
            if counts.l1 < l1_target {
                let p = calc_proportion(l1_target, counts.l1);
                if p < proportion || !to_cache_l1 {
                    to_cache_l1 = true;
                    selected = Some((pool.clone(), counts));
                    proportion = p;
                }
            }
        }

        Ok(selected)
    }

    /// 执行一次调整，返回被调整的服务池与动作
    pub async fn update_cache(&self) -> BrokerResult<Option<(i64, CacheAction)>> {
        let Some((pool, counts)) = self.select_pool().await? else {
            debug!("缓存已是最新");
            return Ok(None);
        };

        let action = decide_action(&pool, &counts);
        match action {
            CacheAction::ReduceL1 => self.reduce_l1_cache(&pool, &counts).await?,
            CacheAction::ReduceL2 => self.reduce_l2_cache(&pool, &counts).await?,
            CacheAction::GrowL1 => self.grow_l1_cache(&pool, &counts).await?,
            CacheAction::GrowL2 => self.grow_l2_cache(&pool).await?,
            CacheAction::Nothing => info!(
                "服务池 {} 实例数超过配置，但所有实例均已分配，无法移除",
                pool
            ),
        }

        StructuredLogger::log_cache_decision(
            pool.id,
            action.as_str(),
            counts.l1,
            counts.l2,
            counts.assigned,
        );
        self.metrics.record_cache_action(action.as_str());
        Ok(Some((pool.id, action)))
    }

    async fn reduce_l1_cache(&self, pool: &Pool, counts: &CacheCounts) -> BrokerResult<()> {
        let items = self
            .cache_items
            .list_in_level(pool.id, CacheLevel::L1, true)
            .await?;
        let Some(newest) = items.first() else {
            debug!("服务池 {} 实例过多，但 L1 缓存已为空", pool);
            return Ok(());
        };

        if counts.l2 < i64::from(pool.cache_l2_target) {
            self.user_services.move_to_level(newest, CacheLevel::L2).await
        } else {
            self.user_services.remove_or_cancel(newest).await.map(|_| ())
        }
    }

    async fn reduce_l2_cache(&self, pool: &Pool, counts: &CacheCounts) -> BrokerResult<()> {
        if counts.l2 == 0 {
            return Ok(());
        }
        let items = self
            .cache_items
            .list_in_level(pool.id, CacheLevel::L2, false)
            .await?;
        match items.first() {
            Some(oldest) => self.user_services.remove_or_cancel(oldest).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn grow_l1_cache(&self, pool: &Pool, counts: &CacheCounts) -> BrokerResult<()> {
        if counts.l2 > 0 {
            let items = self
                .cache_items
                .list_in_level(pool.id, CacheLevel::L2, false)
                .await?;
            if let Some(oldest) = items.first() {
                return self.user_services.move_to_level(oldest, CacheLevel::L1).await;
            }
        }
        self.create_cache(pool, CacheLevel::L1).await
    }

    async fn grow_l2_cache(&self, pool: &Pool) -> BrokerResult<()> {
        self.create_cache(pool, CacheLevel::L2).await
    }

    async fn create_cache(&self, pool: &Pool, level: CacheLevel) -> BrokerResult<()> {
        match self.user_services.create_cache_for(pool, level).await {
            Ok(_) => self.deploy_guard.clear(pool.id).await,
            Err(e @ BrokerError::MaxServicesReached { .. }) => {
                error!("服务池 {} 无法增加 {} 缓存: {}", pool, level, e);
                Ok(())
            }
            Err(e) => {
                match self.deploy_guard.record_failure(pool.id).await {
                    Ok(failures) => warn!("服务池 {} 已连续 {} 次部署失败", pool, failures),
                    Err(record_err) => warn!("记录服务池 {} 的部署失败次数出错: {}", pool, record_err),
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Job for ServiceCacheUpdater {
    async fn run(&self) -> BrokerResult<()> {
        self.update_cache().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::entities::PoolState;

    fn pool(initial: i32, l1: i32, l2: i32, max: i32) -> Pool {
        Pool {
            id: 1,
            name: "p".into(),
            state: PoolState::Active,
            initial_size: initial,
            cache_l1_target: l1,
            cache_l2_target: l2,
            max_size: max,
            requires_publication: false,
            current_publication_revision: 1,
        }
    }

    fn counts(l1: i64, l2: i64, assigned: i64) -> CacheCounts {
        CacheCounts { l1, l2, assigned }
    }

    #[test]
    fn test_calc_proportion() {
        assert_eq!(calc_proportion(1, 1), 10000);
        assert_eq!(calc_proportion(1, 0), 0);
        assert_eq!(calc_proportion(4, 1), 2500);
        assert_eq!(calc_proportion(3, 2), 6666);
    }

    #[test]
    fn test_decide_action_priority() {
        // 超过上限优先缩减 L1
        assert_eq!(decide_action(&pool(2, 2, 0, 5), &counts(4, 3, 2)), CacheAction::ReduceL1);
        // L1 超过目标
        assert_eq!(decide_action(&pool(5, 5, 2, 10), &counts(6, 2, 0)), CacheAction::ReduceL1);
        // L2 超过目标
        assert_eq!(decide_action(&pool(2, 2, 1, 10), &counts(2, 3, 0)), CacheAction::ReduceL2);
        // L1 不足
        assert_eq!(decide_action(&pool(2, 2, 1, 10), &counts(0, 0, 0)), CacheAction::GrowL1);
        // L2 不足
        assert_eq!(decide_action(&pool(2, 2, 1, 10), &counts(2, 0, 0)), CacheAction::GrowL2);
        // 全部已分配
        assert_eq!(decide_action(&pool(2, 0, 0, 2), &counts(0, 0, 2)), CacheAction::Nothing);
    }

    #[test]
    fn test_no_growth_at_max() {
        assert_eq!(decide_action(&pool(5, 5, 0, 3), &counts(1, 0, 2)), CacheAction::Nothing);
    }
}
