//! 发布状态机
//!
//! 发布的启动与完成检查都通过延迟任务驱动，同一发布的所有延迟任务共用标签
//! `pm-{id}`，重叠的检查因此可以被整体删除或查询。

use std::sync::Arc;

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::{
    entities::{Pool, Publication, PublicationState},
    providers::{ProgressToken, PublicationInstance, PublicationProvider},
    repositories::{CacheItemRepository, PoolRepository, PublicationRepository},
};
use broker_infrastructure::{MetricsCollector, StructuredLogger};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::delayed_task_runner::DelayedTaskQueue;
use crate::task_registry::{decode_payload, DelayedTask, DelayedTaskHandler};

const PUBLICATION_TAG_PREFIX: &str = "pm-";

pub fn publication_tag(publication_id: i64) -> String {
    format!("{PUBLICATION_TAG_PREFIX}{publication_id}")
}

/// 启动 LAUNCHING 状态的发布
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationLauncher {
    pub publication_id: i64,
}

impl DelayedTask for PublicationLauncher {
    const KIND: &'static str = "publication_launcher";
}

/// 检查进行中的发布是否完成，`expected_state` 为创建任务时发布所处的状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationFinishChecker {
    pub publication_id: i64,
    pub expected_state: PublicationState,
}

impl DelayedTask for PublicationFinishChecker {
    const KIND: &'static str = "publication_finish_checker";
}

pub struct PublicationManager {
    pools: Arc<dyn PoolRepository>,
    publications: Arc<dyn PublicationRepository>,
    cache_items: Arc<dyn CacheItemRepository>,
    provider: Arc<dyn PublicationProvider>,
    queue: Arc<DelayedTaskQueue>,
    launch_delay_seconds: i64,
    metrics: Arc<MetricsCollector>,
}

impl PublicationManager {
    pub fn new(
        pools: Arc<dyn PoolRepository>,
        publications: Arc<dyn PublicationRepository>,
        cache_items: Arc<dyn CacheItemRepository>,
        provider: Arc<dyn PublicationProvider>,
        queue: Arc<DelayedTaskQueue>,
        launch_delay_seconds: u64,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pools,
            publications,
            cache_items,
            provider,
            queue,
            launch_delay_seconds: launch_delay_seconds as i64,
            metrics,
        }
    }

    async fn load_pool(&self, pool_id: i64) -> BrokerResult<Pool> {
        self.pools
            .get_by_id(pool_id)
            .await?
            .ok_or(BrokerError::PoolNotFound { id: pool_id })
    }

    async fn load_publication(&self, publication_id: i64) -> BrokerResult<Publication> {
        self.publications
            .get_by_id(publication_id)
            .await?
            .ok_or(BrokerError::PublicationNotFound { id: publication_id })
    }

    async fn instance_for(
        &self,
        publication: &Publication,
    ) -> BrokerResult<Box<dyn PublicationInstance>> {
        let pool = self.load_pool(publication.pool_id).await?;
        self.provider.instance(&pool, publication).await
    }

    fn record_transition(&self, publication: &Publication, from: PublicationState) {
        StructuredLogger::log_publication_transition(
            publication.id,
            publication.pool_id,
            from.as_str(),
            publication.state.as_str(),
        );
        self.metrics
            .record_publication_transition(publication.state.as_str());
    }

    /// 为服务池创建新发布，并在短暂延迟后启动
    ///
    /// 服务池已有非终态发布时返回 `AlreadyPublishing`，不写入任何数据。
    pub async fn publish(&self, pool_id: i64) -> BrokerResult<Publication> {
        let pool = self.load_pool(pool_id).await?;
        let publication = self
            .publications
            .create_for_pool(pool.id, pool.current_publication_revision, Utc::now())
            .await?;

        let launcher = PublicationLauncher {
            publication_id: publication.id,
        };
        if let Err(e) = self
            .queue
            .insert(&launcher, self.launch_delay_seconds, &publication_tag(publication.id))
            .await
        {
            // 启动任务写入失败时发布不能停留在 LAUNCHING
            self.publications
                .compare_and_set_state(
                    publication.id,
                    PublicationState::Launching,
                    PublicationState::Error,
                    Utc::now(),
                )
                .await?;
            return Err(e);
        }

        info!(
            "服务池 {} 创建发布 {} (修订号: {})",
            pool, publication.id, publication.revision
        );
        Ok(publication)
    }

    /// 启动任务：发布已不在 LAUNCHING（例如已被取消）时什么都不做
    pub async fn launch(&self, publication_id: i64) -> BrokerResult<()> {
        let now = Utc::now();
        if !self
            .publications
            .compare_and_set_state(
                publication_id,
                PublicationState::Launching,
                PublicationState::Preparing,
                now,
            )
            .await?
        {
            debug!("发布 {} 已不处于 LAUNCHING 状态，跳过启动", publication_id);
            return Ok(());
        }

        let mut publication = self.load_publication(publication_id).await?;
        self.record_transition(&publication, PublicationState::Launching);

        if let Err(e) = self.start_publication(&mut publication).await {
            error!("启动发布 {} 失败: {}", publication_id, e);
            let from = publication.state;
            publication.set_state(PublicationState::Error, Utc::now());
            self.publications.update(&publication).await?;
            self.record_transition(&publication, from);
            return Err(e);
        }
        Ok(())
    }

    async fn start_publication(&self, publication: &mut Publication) -> BrokerResult<()> {
        let mut instance = self.instance_for(publication).await?;
        let token = instance.publish().await?;
        let revision = self.pools.increment_revision(publication.pool_id).await?;
        debug!("服务池 {} 修订号递增为 {}", publication.pool_id, revision);
        self.check_and_update_state(publication, instance.as_mut(), token)
            .await
    }

    /// 根据服务提供者返回的进度更新发布状态
    pub async fn check_and_update_state(
        &self,
        publication: &mut Publication,
        instance: &mut dyn PublicationInstance,
        token: ProgressToken,
    ) -> BrokerResult<()> {
        let previous = publication.state;
        let now = Utc::now();

        match token {
            ProgressToken::Finished => {
                match previous {
                    PublicationState::Preparing => {
                        self.publications
                            .transition_pool_publications(
                                publication.pool_id,
                                PublicationState::Usable,
                                PublicationState::Removable,
                                publication.id,
                                now,
                            )
                            .await?;
                        publication.set_state(PublicationState::Usable, now);
                        self.cache_items
                            .mark_superseded_removable(publication.pool_id, publication.id, now)
                            .await?;
                    }
                    PublicationState::Removing => {
                        publication.set_state(PublicationState::Removed, now)
                    }
                    _ => publication.set_state(PublicationState::Canceled, now),
                }
                instance.finish().await?;
                publication.data = instance.serialize_data()?;
                self.publications.update(publication).await?;
                self.record_transition(publication, previous);
            }
            ProgressToken::Error(reason) => {
                warn!("发布 {} 出错: {}", publication.id, reason);
                instance.finish().await?;
                publication.data = instance.serialize_data()?;
                publication.set_state(PublicationState::Error, now);
                self.publications.update(publication).await?;
                self.record_transition(publication, previous);
            }
            ProgressToken::Running => {
                publication.data = instance.serialize_data()?;
                self.publications.update(publication).await?;
                self.check_later(publication, instance.suggested_poll_interval())
                    .await?;
            }
        }
        Ok(())
    }

    /// 安排一次完成检查，沿用发布标签
    pub async fn check_later(
        &self,
        publication: &Publication,
        delay_seconds: u64,
    ) -> BrokerResult<()> {
        let checker = PublicationFinishChecker {
            publication_id: publication.id,
            expected_state: publication.state,
        };
        self.queue
            .insert(
                &checker,
                delay_seconds as i64,
                &publication_tag(publication.id),
            )
            .await?;
        Ok(())
    }

    /// 完成检查任务：发布状态已变化时视为被其他任务接管
    pub async fn check_finished(
        &self,
        publication_id: i64,
        expected_state: PublicationState,
    ) -> BrokerResult<()> {
        let Some(mut publication) = self.publications.get_by_id(publication_id).await? else {
            debug!("发布 {} 已不存在，忽略完成检查", publication_id);
            return Ok(());
        };
        if publication.state != expected_state {
            debug!(
                "发布 {} 状态已变为 {}，完成检查由其他任务接管",
                publication_id, publication.state
            );
            return Ok(());
        }

        let mut instance = self.instance_for(&publication).await?;
        let token = instance.check_state().await?;
        self.check_and_update_state(&mut publication, instance.as_mut(), token)
            .await
    }

    /// 取消进行中的发布
    ///
    /// 只有 LAUNCHING、PREPARING 与 REMOVING 可以取消。LAUNCHING 的发布尚未交给
    /// 服务提供者，直接置为 CANCELED。
    pub async fn cancel(&self, publication_id: i64) -> BrokerResult<Publication> {
        let mut publication = self.load_publication(publication_id).await?;
        if !publication.state.is_cancelable() {
            return Err(BrokerError::CannotCancel(format!(
                "发布 {} 处于 {} 状态，不可取消",
                publication_id, publication.state
            )));
        }

        if publication.state == PublicationState::Launching {
            let now = Utc::now();
            if self
                .publications
                .compare_and_set_state(
                    publication_id,
                    PublicationState::Launching,
                    PublicationState::Canceled,
                    now,
                )
                .await?
            {
                publication.set_state(PublicationState::Canceled, now);
                self.record_transition(&publication, PublicationState::Launching);
                if let Err(e) = self.queue.remove(&publication_tag(publication_id)).await {
                    warn!("删除发布 {} 的启动任务失败: {}", publication_id, e);
                }
                return Ok(publication);
            }

            // 启动任务抢先一步，按进行中的发布处理
            publication = self.load_publication(publication_id).await?;
            if !publication.state.is_cancelable() {
                return Err(BrokerError::CannotCancel(format!(
                    "发布 {} 处于 {} 状态，不可取消",
                    publication_id, publication.state
                )));
            }
        }

        let mut instance = self.instance_for(&publication).await?;
        let token = instance.cancel().await?;
        let from = publication.state;
        publication.set_state(PublicationState::Canceling, Utc::now());
        self.record_transition(&publication, from);
        self.check_and_update_state(&mut publication, instance.as_mut(), token)
            .await?;
        Ok(publication)
    }

    /// 撤销可用或可移除的发布
    pub async fn unpublish(&self, publication_id: i64) -> BrokerResult<Publication> {
        let mut publication = self.load_publication(publication_id).await?;
        if !matches!(
            publication.state,
            PublicationState::Usable | PublicationState::Removable
        ) {
            return Err(BrokerError::CannotUnpublish(format!(
                "发布 {} 处于 {} 状态，不可撤销",
                publication_id, publication.state
            )));
        }
        if self
            .cache_items
            .count_in_process_for_publication(publication_id)
            .await?
            > 0
        {
            return Err(BrokerError::CannotUnpublish(format!(
                "发布 {publication_id} 仍有进行中的用户服务实例"
            )));
        }

        let mut instance = self.instance_for(&publication).await?;
        let token = instance.destroy().await?;
        let from = publication.state;
        publication.set_state(PublicationState::Removing, Utc::now());
        self.record_transition(&publication, from);
        self.check_and_update_state(&mut publication, instance.as_mut(), token)
            .await?;
        Ok(publication)
    }
}

pub struct PublicationLauncherHandler {
    manager: Arc<PublicationManager>,
}

impl PublicationLauncherHandler {
    pub fn new(manager: Arc<PublicationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl DelayedTaskHandler for PublicationLauncherHandler {
    fn kind(&self) -> &'static str {
        PublicationLauncher::KIND
    }

    async fn execute(&self, payload: &str) -> BrokerResult<()> {
        let task: PublicationLauncher = decode_payload(payload)?;
        self.manager.launch(task.publication_id).await
    }
}

pub struct PublicationFinishCheckerHandler {
    manager: Arc<PublicationManager>,
}

impl PublicationFinishCheckerHandler {
    pub fn new(manager: Arc<PublicationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl DelayedTaskHandler for PublicationFinishCheckerHandler {
    fn kind(&self) -> &'static str {
        PublicationFinishChecker::KIND
    }

    async fn execute(&self, payload: &str) -> BrokerResult<()> {
        let task: PublicationFinishChecker = decode_payload(payload)?;
        self.manager
            .check_finished(task.publication_id, task.expected_state)
            .await
    }
}
