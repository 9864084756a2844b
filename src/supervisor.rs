use std::time::Duration;

use broker_core::SchedulerConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::app::Application;

/// 工作循环监督者
///
/// 启动 `scheduler_threads` 个作业调度循环和 `delayed_task_threads` 个延迟任务循环，
/// 每个循环错开启动以分散数据库访问。
pub struct Supervisor {
    config: SchedulerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new(config: SchedulerConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// 启动全部工作循环；启动过程中收到关闭信号时不再启动剩余循环
    pub async fn start(&self, app: &Application) {
        for index in 0..self.config.scheduler_threads {
            if index > 0 && !self.stagger(self.config.scheduler_stagger_millis).await {
                return;
            }
            let scheduler = app.scheduler(index);
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move { scheduler.run(shutdown).await });
        }

        for index in 0..self.config.delayed_task_threads {
            if index > 0 && !self.stagger(self.config.delayed_task_stagger_millis).await {
                return;
            }
            let runner = app.delayed_task_runner();
            let worker_id = format!("{}-task-{}", app.hostname(), index);
            let shutdown = self.shutdown.clone();
            self.tracker
                .spawn(async move { runner.run(&worker_id, shutdown).await });
        }

        info!(
            "已启动 {} 个作业调度循环和 {} 个延迟任务循环",
            self.config.scheduler_threads, self.config.delayed_task_threads
        );
    }

    async fn stagger(&self, millis: u64) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(millis)) => true,
        }
    }

    pub fn running_workers(&self) -> usize {
        self.tracker.len()
    }

    /// 等待所有工作循环退出，超过 `shutdown_timeout_seconds` 返回 `false`
    pub async fn wait(&self) -> bool {
        self.tracker.close();
        let timeout = Duration::from_secs(self.config.shutdown_timeout_seconds);
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}
