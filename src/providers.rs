//! 未接入虚拟化平台时使用的服务提供者
//!
//! 独立运行的进程只负责调度与清理：发布请求返回错误，缓存控制器也不会启动新实例。
//! 嵌入方通过 [`crate::app::Application::with_providers`] 注入真实的服务提供者。

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::entities::{CacheItem, CacheLevel, Pool, Publication};
use broker_domain::providers::{
    ProgressToken, PublicationInstance, PublicationProvider, UserServiceProvider,
};
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProvider;

fn not_configured(operation: &str) -> BrokerError {
    BrokerError::provider(format!("未配置服务提供者，无法执行{operation}"))
}

#[async_trait]
impl PublicationProvider for UnconfiguredProvider {
    async fn instance(
        &self,
        pool: &Pool,
        publication: &Publication,
    ) -> BrokerResult<Box<dyn PublicationInstance>> {
        warn!(
            "服务池 {} 的发布 {} 没有可用的服务提供者",
            pool.id, publication.id
        );
        Err(not_configured("发布操作"))
    }
}

#[async_trait]
impl UserServiceProvider for UnconfiguredProvider {
    async fn can_initiate(&self, _pool: &Pool) -> BrokerResult<bool> {
        Ok(false)
    }

    fn max_deployed(&self, _pool: &Pool) -> Option<u32> {
        None
    }

    async fn deploy(&self, _pool: &Pool, _item: &CacheItem) -> BrokerResult<ProgressToken> {
        Err(not_configured("实例部署"))
    }

    async fn move_to_level(&self, _item: &CacheItem, _level: CacheLevel) -> BrokerResult<()> {
        Err(not_configured("缓存层级迁移"))
    }

    async fn cancel(&self, _item: &CacheItem) -> BrokerResult<ProgressToken> {
        Err(not_configured("实例取消"))
    }

    async fn destroy(&self, _item: &CacheItem) -> BrokerResult<ProgressToken> {
        Err(not_configured("实例销毁"))
    }

    async fn check_state(&self, _item: &CacheItem) -> BrokerResult<ProgressToken> {
        Err(not_configured("实例状态查询"))
    }

    fn suggested_poll_interval(&self) -> u64 {
        30
    }
}
