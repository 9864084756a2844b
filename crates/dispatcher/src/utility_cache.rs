//! 按持有者划分命名空间的持久化键值缓存
//!
//! 值以 JSON 存储，每个条目有自己的有效期，过期条目读取时视为不存在，
//! 由通用缓存清理作业定期删除。缓存控制器用它记录各服务池连续部署失败的次数。

use std::sync::Arc;

use broker_core::BrokerResult;
use broker_domain::{entities::UtilityCacheEntry, repositories::UtilityCacheRepository};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct UtilityCache {
    owner: String,
    repo: Arc<dyn UtilityCacheRepository>,
}

impl UtilityCache {
    pub fn new(owner: &str, repo: Arc<dyn UtilityCacheRepository>) -> Self {
        Self {
            owner: owner.to_string(),
            repo,
        }
    }

    /// 读取未过期的值；值无法按 `T` 解析时同样返回 `None`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> BrokerResult<Option<T>> {
        let Some(entry) = self.repo.get(&self.owner, key).await? else {
            return Ok(None);
        };
        if entry.is_expired(Utc::now()) {
            debug!("缓存条目 {}/{} 已过期", self.owner, key);
            return Ok(None);
        }

        match serde_json::from_str(&entry.value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("缓存条目 {}/{} 的值无法解析: {}", self.owner, key, e);
                Ok(None)
            }
        }
    }

    /// 写入或覆盖，`validity_seconds` 为空时使用默认有效期
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        validity_seconds: Option<i64>,
    ) -> BrokerResult<()> {
        let entry = UtilityCacheEntry::new(
            &self.owner,
            key,
            serde_json::to_string(value)?,
            validity_seconds.unwrap_or(UtilityCacheEntry::DEFAULT_VALIDITY_SECONDS),
            Utc::now(),
        );
        self.repo.put(&entry).await
    }

    pub async fn remove(&self, key: &str) -> BrokerResult<()> {
        self.repo.remove(&self.owner, key).await
    }

    /// 删除所有持有者的过期条目
    pub async fn clean_up(repo: &dyn UtilityCacheRepository, now: DateTime<Utc>) -> BrokerResult<u64> {
        repo.clean_up(now).await
    }
}
