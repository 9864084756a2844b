use std::sync::Arc;
use std::time::{Duration, Instant};

use broker_core::{BrokerResult, SchedulerConfig};
use broker_domain::{entities::DelayedTaskRecord, repositories::DelayedTaskRepository};
use broker_infrastructure::{MetricsCollector, StructuredLogger};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::task_registry::{encode_payload, DelayedTask, TaskRegistry};

/// 插入重试的退避基数，第 n 次失败后等待 n 倍
const INSERT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// 延迟任务的写入端：插入、按标签删除、按标签检查
pub struct DelayedTaskQueue {
    repo: Arc<dyn DelayedTaskRepository>,
    insert_attempts: u32,
    metrics: Arc<MetricsCollector>,
}

impl DelayedTaskQueue {
    pub fn new(
        repo: Arc<dyn DelayedTaskRepository>,
        insert_attempts: u32,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repo,
            insert_attempts: insert_attempts.max(1),
            metrics,
        }
    }

    /// 在 `delay_seconds` 秒后执行 `task`。存储的瞬时错误会重试，
    /// 全部尝试失败后返回最后一次的错误。
    pub async fn insert<T: DelayedTask>(
        &self,
        task: &T,
        delay_seconds: i64,
        tag: &str,
    ) -> BrokerResult<DelayedTaskRecord> {
        let payload = encode_payload(task)?;
        let mut attempt = 1;
        loop {
            let record =
                DelayedTaskRecord::new(T::KIND, payload.clone(), delay_seconds, tag, Utc::now());
            match self.repo.insert(&record).await {
                Ok(inserted) => {
                    StructuredLogger::log_task_inserted(T::KIND, tag, inserted.execution_time);
                    self.metrics.record_task_inserted(T::KIND);
                    return Ok(inserted);
                }
                Err(e) if e.is_retryable() && attempt < self.insert_attempts => {
                    warn!(
                        "插入延迟任务 {} 失败 (第{}次): {}",
                        T::KIND,
                        attempt,
                        e
                    );
                    self.metrics.record_task_insert_retry();
                    tokio::time::sleep(INSERT_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "无法插入延迟任务 {} (延迟: {}秒, 标签: '{}'): {}",
                        T::KIND,
                        delay_seconds,
                        tag,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    pub async fn remove(&self, tag: &str) -> BrokerResult<u64> {
        self.repo.remove_by_tag(tag).await
    }

    pub async fn check_exists(&self, tag: &str) -> BrokerResult<bool> {
        Ok(self.repo.count_by_tag(tag).await? > 0)
    }
}

/// 延迟任务执行循环
///
/// 每轮认领（即删除）一个可执行任务并在独立的 tokio 任务中执行。
/// 认领成功者独占执行权，任务最多执行一次。
pub struct DelayedTaskRunner {
    repo: Arc<dyn DelayedTaskRepository>,
    registry: Arc<TaskRegistry>,
    granularity: Duration,
    metrics: Arc<MetricsCollector>,
    tracker: TaskTracker,
}

impl DelayedTaskRunner {
    pub fn new(
        repo: Arc<dyn DelayedTaskRepository>,
        registry: Arc<TaskRegistry>,
        config: &SchedulerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repo,
            registry,
            granularity: Duration::from_secs(config.delayed_task_granularity_seconds),
            metrics,
            tracker: TaskTracker::new(),
        }
    }

    /// 认领一个可执行任务并派发执行，没有可执行任务时返回 `None`
    pub async fn execute_one_task(&self) -> BrokerResult<Option<JoinHandle<()>>> {
        let Some(record) = self.repo.claim_next(Utc::now()).await? else {
            return Ok(None);
        };

        // 任务已从存储中删除，类型未注册时只能记录后丢弃
        let handler = match self.registry.get(&record.kind) {
            Ok(handler) => handler,
            Err(e) => {
                error!("丢弃未注册类型的延迟任务 {} (ID: {})", record.kind, record.id);
                self.metrics.record_task_execution(&record.kind, false, 0.0);
                return Err(e);
            }
        };

        debug!("执行延迟任务 {} (ID: {})", record.kind, record.id);
        let metrics = Arc::clone(&self.metrics);
        let handle = self.tracker.spawn(async move {
            let start = Instant::now();
            let result = handler.execute(&record.payload).await;
            let error_message = result.as_ref().err().map(ToString::to_string);
            StructuredLogger::log_task_complete(
                &record.kind,
                result.is_ok(),
                error_message.as_deref(),
            );
            metrics.record_task_execution(&record.kind, result.is_ok(), start.elapsed().as_secs_f64());
        });
        Ok(Some(handle))
    }

    /// 执行循环，直到 `shutdown` 被取消；退出前等待已派发的任务完成
    pub async fn run(&self, worker_id: &str, shutdown: CancellationToken) {
        StructuredLogger::log_worker_lifecycle("delayed_task_runner", worker_id, true);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.granularity) => {}
            }

            if let Err(e) = self.execute_one_task().await {
                StructuredLogger::log_system_error("delayed_task_runner", "execute_one_task", &e);
            }
        }

        self.drain().await;
        StructuredLogger::log_worker_lifecycle("delayed_task_runner", worker_id, false);
    }

    /// 等待已派发的任务全部结束
    pub async fn drain(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("等待 {} 个延迟任务执行完成", self.tracker.len());
        }
        self.tracker.wait().await;
    }
}
