//! 外部协作者接口
//!
//! 服务提供者（虚拟化平台）的发布与实例操作均视为阻塞调用，不会在调用中途被中断。

use async_trait::async_trait;
use broker_core::BrokerResult;

use crate::entities::{CacheItem, CacheLevel, Pool, Publication};

/// 服务提供者操作返回的进度标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressToken {
    Running,
    Finished,
    Error(String),
}

impl ProgressToken {
    pub fn is_finished(&self) -> bool {
        matches!(self, ProgressToken::Finished)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, ProgressToken::Error(_))
    }
}

/// 某个发布在服务提供者侧的实例
#[async_trait]
pub trait PublicationInstance: Send {
    async fn publish(&mut self) -> BrokerResult<ProgressToken>;

    async fn check_state(&mut self) -> BrokerResult<ProgressToken>;

    /// 发布进入完成或错误状态后调用一次
    async fn finish(&mut self) -> BrokerResult<()>;

    async fn cancel(&mut self) -> BrokerResult<ProgressToken>;

    async fn destroy(&mut self) -> BrokerResult<ProgressToken>;

    /// 非终态进度返回后，下次检查前建议等待的秒数
    fn suggested_poll_interval(&self) -> u64;

    /// 需要持久化到发布记录上的进度数据
    fn serialize_data(&self) -> BrokerResult<Option<String>>;
}

#[async_trait]
pub trait PublicationProvider: Send + Sync {
    /// 根据发布记录（含已持久化的进度数据）还原服务提供者实例
    async fn instance(
        &self,
        pool: &Pool,
        publication: &Publication,
    ) -> BrokerResult<Box<dyn PublicationInstance>>;
}

/// 用户服务实例的服务提供者操作
#[async_trait]
pub trait UserServiceProvider: Send + Sync {
    /// 服务提供者当前能否再启动一个实例
    async fn can_initiate(&self, pool: &Pool) -> BrokerResult<bool>;

    /// 单个服务池允许的最大部署数，`None` 表示不限
    fn max_deployed(&self, pool: &Pool) -> Option<u32>;

    /// 为已持久化的实例启动部署
    async fn deploy(&self, pool: &Pool, item: &CacheItem) -> BrokerResult<ProgressToken>;

    async fn move_to_level(&self, item: &CacheItem, level: CacheLevel) -> BrokerResult<()>;

    async fn cancel(&self, item: &CacheItem) -> BrokerResult<ProgressToken>;

    async fn destroy(&self, item: &CacheItem) -> BrokerResult<ProgressToken>;

    /// 查询进行中的部署、取消或销毁操作的进度
    async fn check_state(&self, item: &CacheItem) -> BrokerResult<ProgressToken>;

    /// 非终态进度返回后，下次检查前建议等待的秒数
    fn suggested_poll_interval(&self) -> u64;
}
