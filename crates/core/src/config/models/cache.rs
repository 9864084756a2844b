use serde::{Deserialize, Serialize};

/// 缓存控制与发布相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 缓存级别控制器的执行频率（秒）
    pub check_delay_seconds: u64,
    pub publication_launch_delay_seconds: u64,
    pub publication_cleaner_delay_seconds: u64,
    pub utility_cache_cleaner_delay_seconds: u64,
    pub user_service_cleaner_delay_seconds: u64,
    /// 每次清理最多开始移除的实例数
    pub user_service_remove_at_once: u32,
    pub user_service_info_cleaner_delay_seconds: u64,
    /// 终态实例记录的保留时间（秒）
    pub keep_info_seconds: u64,
    /// 连续部署失败达到该次数后暂停服务池增长
    pub deploy_failure_limit: u32,
    pub deploy_failure_block_seconds: u64,
    pub delayed_task_insert_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            check_delay_seconds: 19,
            publication_launch_delay_seconds: 4,
            publication_cleaner_delay_seconds: 3600,
            utility_cache_cleaner_delay_seconds: 3600,
            user_service_cleaner_delay_seconds: 31,
            user_service_remove_at_once: 10,
            user_service_info_cleaner_delay_seconds: 600,
            keep_info_seconds: 14400,
            deploy_failure_limit: 3,
            deploy_failure_block_seconds: 600,
            delayed_task_insert_retries: 3,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_delay_seconds == 0 {
            return Err(anyhow::anyhow!("缓存检查间隔必须大于0"));
        }

        if self.publication_cleaner_delay_seconds == 0 {
            return Err(anyhow::anyhow!("发布清理间隔必须大于0"));
        }

        if self.utility_cache_cleaner_delay_seconds == 0 {
            return Err(anyhow::anyhow!("通用缓存清理间隔必须大于0"));
        }

        if self.user_service_cleaner_delay_seconds == 0
            || self.user_service_info_cleaner_delay_seconds == 0
        {
            return Err(anyhow::anyhow!("用户服务清理间隔必须大于0"));
        }

        if self.user_service_remove_at_once == 0 {
            return Err(anyhow::anyhow!("每次移除的用户服务数必须大于0"));
        }

        if self.deploy_failure_limit == 0 {
            return Err(anyhow::anyhow!("部署失败次数上限必须大于0"));
        }

        if self.delayed_task_insert_retries == 0 {
            return Err(anyhow::anyhow!("延迟任务插入重试次数必须大于0"));
        }

        Ok(())
    }
}
