use std::sync::Arc;
use std::time::{Duration, Instant};

use broker_core::{BrokerError, BrokerResult, SchedulerConfig};
use broker_domain::{entities::ScheduledJob, repositories::JobRepository};
use broker_infrastructure::{MetricsCollector, StructuredLogger};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job_registry::JobRegistry;

/// 租约持有者标识：`{hostname}-{process_id}-{worker_index}`
///
/// 同一主机上的多个进程各自持有不同的标识，启动时只释放本进程遗留的租约。
pub fn worker_owner_id(hostname: &str, process_id: u32, worker_index: usize) -> String {
    format!("{hostname}-{process_id}-{worker_index}")
}

/// 周期作业调度循环
///
/// 每轮认领一个到期作业并在当前任务内执行。全集群的互斥完全依赖仓储的租约
/// 比较并交换，进程内不需要任何锁。
pub struct JobScheduler {
    job_repo: Arc<dyn JobRepository>,
    registry: Arc<JobRegistry>,
    owner: String,
    granularity: Duration,
    lease_safety_margin: chrono::Duration,
    metrics: Arc<MetricsCollector>,
}

impl JobScheduler {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        registry: Arc<JobRegistry>,
        owner: String,
        config: &SchedulerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            job_repo,
            registry,
            owner,
            granularity: Duration::from_secs(config.scheduler_granularity_seconds),
            lease_safety_margin: chrono::Duration::seconds(config.lease_safety_margin_seconds),
            metrics,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// 注册作业，重复注册同名作业只更新类型与间隔
    pub async fn register_job(
        &self,
        name: &str,
        kind: &str,
        interval_seconds: u64,
    ) -> BrokerResult<ScheduledJob> {
        if !self.registry.contains(kind) {
            return Err(BrokerError::JobKindNotRegistered(kind.to_string()));
        }
        let job = self
            .job_repo
            .ensure_job(name, kind, interval_seconds as i64, Utc::now())
            .await?;
        info!("已注册作业 {} (类型: {}, 间隔: {}秒)", name, kind, interval_seconds);
        Ok(job)
    }

    /// 认领并执行一个到期作业，返回是否执行了作业
    pub async fn execute_one_job(&self) -> BrokerResult<bool> {
        let now = Utc::now();
        let Some(job) = self
            .job_repo
            .claim_next_due(&self.owner, now, self.lease_safety_margin)
            .await?
        else {
            return Ok(false);
        };

        StructuredLogger::log_job_claimed(&job.name, &self.owner, job.next_execution_time);

        let implementation = match self.registry.get(&job.kind) {
            Ok(implementation) => implementation,
            Err(e) => {
                error!("作业 {} 的类型 {} 未注册", job.name, job.kind);
                self.job_repo.release(&job.name, &self.owner).await?;
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = implementation.run().await;
        let elapsed = start.elapsed();

        let error_message = result.as_ref().err().map(ToString::to_string);
        StructuredLogger::log_job_complete(
            &job.name,
            &self.owner,
            result.is_ok(),
            elapsed.as_millis() as u64,
            error_message.as_deref(),
        );
        self.metrics
            .record_job_run(&job.name, result.is_ok(), elapsed.as_secs_f64());

        // 无论成功与否都释放租约，作业在下次执行时间重新可被认领
        self.job_repo.release(&job.name, &self.owner).await?;
        Ok(true)
    }

    /// 调度循环，直到 `shutdown` 被取消。正在执行的作业不会被中断。
    pub async fn run(&self, shutdown: CancellationToken) {
        StructuredLogger::log_worker_lifecycle("scheduler", &self.owner, true);

        match self.job_repo.release_owned_by(&self.owner).await {
            Ok(0) => {}
            Ok(released) => warn!("释放 {} 遗留的作业租约 {} 个", self.owner, released),
            Err(e) => error!("释放遗留作业租约失败: {}", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.granularity) => {}
            }

            match self.execute_one_job().await {
                Ok(true) => {}
                Ok(false) => debug!("{} 没有到期作业", self.owner),
                Err(e) => StructuredLogger::log_system_error("scheduler", "execute_one_job", &e),
            }
        }

        StructuredLogger::log_worker_lifecycle("scheduler", &self.owner, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_owner_id() {
        assert_eq!(worker_owner_id("broker01", 4711, 0), "broker01-4711-0");
        assert_eq!(worker_owner_id("broker01", 4711, 3), "broker01-4711-3");
        assert_ne!(
            worker_owner_id("broker01", 4711, 0),
            worker_owner_id("broker01", 4712, 0)
        );
    }
}
