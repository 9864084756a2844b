use serde::{Deserialize, Serialize};

/// 调度器与延迟任务执行器的线程及轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 作业调度循环数量
    pub scheduler_threads: usize,
    /// 延迟任务循环数量
    pub delayed_task_threads: usize,
    pub scheduler_granularity_seconds: u64,
    pub delayed_task_granularity_seconds: u64,
    /// 作业租约的安全时长，持有者崩溃后超过该时长租约失效
    pub lease_safety_margin_seconds: i64,
    pub scheduler_stagger_millis: u64,
    pub delayed_task_stagger_millis: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_threads: 2,
            delayed_task_threads: 2,
            scheduler_granularity_seconds: 2,
            delayed_task_granularity_seconds: 2,
            lease_safety_margin_seconds: 300,
            scheduler_stagger_millis: 500,
            delayed_task_stagger_millis: 1000,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler_threads == 0 && self.delayed_task_threads == 0 {
            return Err(anyhow::anyhow!("调度线程数与延迟任务线程数不能同时为0"));
        }

        if self.scheduler_granularity_seconds == 0 {
            return Err(anyhow::anyhow!("调度轮询间隔必须大于0"));
        }

        if self.delayed_task_granularity_seconds == 0 {
            return Err(anyhow::anyhow!("延迟任务轮询间隔必须大于0"));
        }

        if self.lease_safety_margin_seconds <= 0 {
            return Err(anyhow::anyhow!("租约安全时长必须大于0"));
        }

        if self.shutdown_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("关闭超时时间必须大于0"));
        }

        Ok(())
    }
}
