//! 用户服务实例的生命周期
//!
//! 部署、取消与销毁都是服务提供者侧的异步操作。操作返回进行中时写入一个
//! 完成检查延迟任务（标签 `us-{id}`），直到服务提供者报告完成或出错。

use std::sync::Arc;

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{
    entities::{CacheItem, CacheLevel, Pool, UserServiceState},
    providers::{ProgressToken, UserServiceProvider},
    repositories::{CacheItemRepository, PublicationRepository},
};
use broker_infrastructure::StructuredLogger;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::delayed_task_runner::DelayedTaskQueue;
use crate::task_registry::{decode_payload, DelayedTask, DelayedTaskHandler};

pub fn user_service_tag(item_id: i64) -> String {
    format!("us-{item_id}")
}

/// 检查实例上进行中的操作是否完成，`expected_state` 为创建任务时实例所处的状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserServiceFinishChecker {
    pub item_id: i64,
    pub expected_state: UserServiceState,
}

impl DelayedTask for UserServiceFinishChecker {
    const KIND: &'static str = "user_service_finish_checker";
}

/// 用户服务实例的创建、层级移动与移除
pub struct UserServiceManager {
    cache_items: Arc<dyn CacheItemRepository>,
    publications: Arc<dyn PublicationRepository>,
    provider: Arc<dyn UserServiceProvider>,
    queue: Arc<DelayedTaskQueue>,
}

impl UserServiceManager {
    pub fn new(
        cache_items: Arc<dyn CacheItemRepository>,
        publications: Arc<dyn PublicationRepository>,
        provider: Arc<dyn UserServiceProvider>,
        queue: Arc<DelayedTaskQueue>,
    ) -> Self {
        Self {
            cache_items,
            publications,
            provider,
            queue,
        }
    }

    pub async fn can_initiate(&self, pool: &Pool) -> BrokerResult<bool> {
        self.provider.can_initiate(pool).await
    }

    /// 在指定缓存层级创建一个新实例
    ///
    /// 服务池已部署的实例数达到服务提供者上限时返回 `MaxServicesReached`。
    /// 部署失败的实例置为 ERROR，不再计入缓存。
    pub async fn create_cache_for(&self, pool: &Pool, level: CacheLevel) -> BrokerResult<CacheItem> {
        if let Some(max) = self.provider.max_deployed(pool) {
            let live = self.cache_items.count_live(pool.id).await?;
            if live >= i64::from(max) {
                StructuredLogger::log_max_services_reached(pool.id, max);
                return Err(BrokerError::MaxServicesReached {
                    pool_id: pool.id,
                    max,
                });
            }
        }

        let publication_id = if pool.requires_publication {
            let publication = self
                .publications
                .active_for_pool(pool.id)
                .await?
                .ok_or_else(|| {
                    BrokerError::Internal(format!("服务池 {pool} 没有可用的发布"))
                })?;
            Some(publication.id)
        } else {
            None
        };

        let mut item = self
            .cache_items
            .create(&CacheItem::new(pool.id, publication_id, level, Utc::now()))
            .await?;

        let token = match self.provider.deploy(pool, &item).await {
            Ok(token) => token,
            Err(e) => {
                error!("服务池 {} 的缓存实例 {} 部署失败: {}", pool, item.id, e);
                self.cache_items
                    .update_state(item.id, UserServiceState::Error, Utc::now())
                    .await?;
                return Err(e);
            }
        };

        info!("为服务池 {} 创建 {} 缓存实例 {}", pool, level, item.id);
        item.state = self.check_and_update_state(&item, token).await?;
        Ok(item)
    }

    pub async fn move_to_level(&self, item: &CacheItem, level: CacheLevel) -> BrokerResult<()> {
        self.provider.move_to_level(item, level).await?;
        self.cache_items.move_to_level(item.id, level).await?;
        debug!("缓存实例 {} 从 {} 移动到 {}", item.id, item.level, level);
        Ok(())
    }

    /// 正在准备的实例取消，已可用或已被替代的实例销毁
    pub async fn remove_or_cancel(&self, item: &CacheItem) -> BrokerResult<UserServiceState> {
        let (token, in_progress) = match item.state {
            UserServiceState::Preparing => {
                (self.provider.cancel(item).await?, UserServiceState::Canceling)
            }
            UserServiceState::Usable | UserServiceState::Removable => {
                (self.provider.destroy(item).await?, UserServiceState::Removing)
            }
            other => {
                return Err(BrokerError::Internal(format!(
                    "缓存实例 {} 处于 {} 状态，无法移除",
                    item.id, other
                )))
            }
        };

        self.cache_items
            .update_state(item.id, in_progress, Utc::now())
            .await?;
        debug!("缓存实例 {} 状态: {} -> {}", item.id, item.state, in_progress);

        let mut item = item.clone();
        item.state = in_progress;
        self.check_and_update_state(&item, token).await
    }

    /// 根据服务提供者返回的进度更新实例状态，返回更新后的状态
    pub async fn check_and_update_state(
        &self,
        item: &CacheItem,
        token: ProgressToken,
    ) -> BrokerResult<UserServiceState> {
        let new_state = match token {
            ProgressToken::Running => {
                self.check_later(item, self.provider.suggested_poll_interval())
                    .await?;
                return Ok(item.state);
            }
            ProgressToken::Error(reason) => {
                warn!("缓存实例 {} 操作出错: {}", item.id, reason);
                UserServiceState::Error
            }
            ProgressToken::Finished => match item.state {
                UserServiceState::Preparing => UserServiceState::Usable,
                UserServiceState::Removing => UserServiceState::Removed,
                UserServiceState::Canceling => UserServiceState::Canceled,
                other => return Ok(other),
            },
        };

        self.cache_items
            .update_state(item.id, new_state, Utc::now())
            .await?;
        debug!("缓存实例 {} 状态: {} -> {}", item.id, item.state, new_state);
        Ok(new_state)
    }

    async fn check_later(&self, item: &CacheItem, delay_seconds: u64) -> BrokerResult<()> {
        let checker = UserServiceFinishChecker {
            item_id: item.id,
            expected_state: item.state,
        };
        self.queue
            .insert(&checker, delay_seconds as i64, &user_service_tag(item.id))
            .await?;
        Ok(())
    }

    /// 完成检查任务：实例状态已变化时视为被其他任务接管
    ///
    /// 查询进度失败的实例置为 ERROR。
    pub async fn check_finished(
        &self,
        item_id: i64,
        expected_state: UserServiceState,
    ) -> BrokerResult<()> {
        let Some(item) = self.cache_items.get_by_id(item_id).await? else {
            debug!("缓存实例 {} 已不存在，忽略完成检查", item_id);
            return Ok(());
        };
        if item.state != expected_state {
            debug!(
                "缓存实例 {} 状态已变为 {}，完成检查由其他任务接管",
                item_id, item.state
            );
            return Ok(());
        }

        match self.provider.check_state(&item).await {
            Ok(token) => self.check_and_update_state(&item, token).await.map(|_| ()),
            Err(e) => {
                error!("查询缓存实例 {} 的进度失败: {}", item_id, e);
                self.cache_items
                    .update_state(item_id, UserServiceState::Error, Utc::now())
                    .await?;
                Err(e)
            }
        }
    }
}

pub struct UserServiceFinishCheckerHandler {
    manager: Arc<UserServiceManager>,
}

impl UserServiceFinishCheckerHandler {
    pub fn new(manager: Arc<UserServiceManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl DelayedTaskHandler for UserServiceFinishCheckerHandler {
    fn kind(&self) -> &'static str {
        UserServiceFinishChecker::KIND
    }

    async fn execute(&self, payload: &str) -> BrokerResult<()> {
        let task: UserServiceFinishChecker = decode_payload(payload)?;
        self.manager
            .check_finished(task.item_id, task.expected_state)
            .await
    }
}
