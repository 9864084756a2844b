use std::sync::Arc;

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{
    entities::{PublicationState, UserServiceState},
    repositories::{CacheItemRepository, PublicationRepository, UtilityCacheRepository},
};
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::job_registry::Job;
use crate::publication_manager::PublicationManager;
use crate::user_service_manager::UserServiceManager;
use crate::utility_cache::UtilityCache;

pub const PUBLICATION_CLEANER_KIND: &str = "publication_cleaner";
pub const UTILITY_CACHE_CLEANER_KIND: &str = "utility_cache_cleaner";
pub const USER_SERVICE_REMOVER_KIND: &str = "user_service_remover";
pub const USER_SERVICE_INFO_CLEANER_KIND: &str = "user_service_info_cleaner";

/// 撤销所有已被替代（REMOVABLE）且没有进行中实例的发布
pub struct PublicationCleaner {
    publications: Arc<dyn PublicationRepository>,
    manager: Arc<PublicationManager>,
}

impl PublicationCleaner {
    pub fn new(
        publications: Arc<dyn PublicationRepository>,
        manager: Arc<PublicationManager>,
    ) -> Self {
        Self {
            publications,
            manager,
        }
    }

    /// 返回本次开始撤销的发布数量
    pub async fn clean(&self) -> BrokerResult<usize> {
        let removable = self
            .publications
            .list_in_state(PublicationState::Removable)
            .await?;

        let mut unpublished = 0;
        for publication in removable {
            match self.manager.unpublish(publication.id).await {
                Ok(_) => unpublished += 1,
                Err(BrokerError::CannotUnpublish(reason)) => {
                    debug!("发布 {} 暂不能撤销: {}", publication.id, reason);
                }
                Err(e) => {
                    warn!("撤销发布 {} 失败: {}", publication.id, e);
                }
            }
        }

        if unpublished > 0 {
            info!("发布清理完成，开始撤销 {} 个发布", unpublished);
        }
        Ok(unpublished)
    }
}

#[async_trait]
impl Job for PublicationCleaner {
    async fn run(&self) -> BrokerResult<()> {
        self.clean().await.map(|_| ())
    }
}

/// 销毁已被替代（REMOVABLE）的用户服务实例，每次最多 `remove_at_once` 个
pub struct UserServiceRemover {
    cache_items: Arc<dyn CacheItemRepository>,
    user_services: Arc<UserServiceManager>,
    remove_at_once: i64,
}

impl UserServiceRemover {
    pub fn new(
        cache_items: Arc<dyn CacheItemRepository>,
        user_services: Arc<UserServiceManager>,
        remove_at_once: u32,
    ) -> Self {
        Self {
            cache_items,
            user_services,
            remove_at_once: i64::from(remove_at_once.max(1)),
        }
    }

    /// 返回本次开始移除的实例数量
    pub async fn remove(&self) -> BrokerResult<usize> {
        let removable = self
            .cache_items
            .list_in_state(UserServiceState::Removable, self.remove_at_once)
            .await?;

        let mut removed = 0;
        for item in removable {
            match self.user_services.remove_or_cancel(&item).await {
                Ok(state) => {
                    debug!("缓存实例 {} 开始移除，当前状态 {}", item.id, state);
                    removed += 1;
                }
                Err(e) => warn!("移除缓存实例 {} 失败: {}", item.id, e),
            }
        }

        if removed > 0 {
            info!("用户服务清理完成，开始移除 {} 个实例", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl Job for UserServiceRemover {
    async fn run(&self) -> BrokerResult<()> {
        self.remove().await.map(|_| ())
    }
}

/// 删除进入终态信息状态超过保留时间的用户服务实例记录
pub struct UserServiceInfoCleaner {
    cache_items: Arc<dyn CacheItemRepository>,
    keep_info: Duration,
}

impl UserServiceInfoCleaner {
    pub fn new(cache_items: Arc<dyn CacheItemRepository>, keep_info_seconds: u64) -> Self {
        Self {
            cache_items,
            keep_info: Duration::seconds(keep_info_seconds as i64),
        }
    }
}

#[async_trait]
impl Job for UserServiceInfoCleaner {
    async fn run(&self) -> BrokerResult<()> {
        let removed = self
            .cache_items
            .delete_info_older_than(Utc::now() - self.keep_info)
            .await?;
        debug!("删除过期的用户服务实例记录 {} 个", removed);
        Ok(())
    }
}

/// 删除过期的通用缓存条目
pub struct UtilityCacheCleaner {
    repo: Arc<dyn UtilityCacheRepository>,
}

impl UtilityCacheCleaner {
    pub fn new(repo: Arc<dyn UtilityCacheRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl Job for UtilityCacheCleaner {
    async fn run(&self) -> BrokerResult<()> {
        let removed = UtilityCache::clean_up(self.repo.as_ref(), Utc::now()).await?;
        debug!("清理过期的通用缓存条目 {} 个", removed);
        Ok(())
    }
}
