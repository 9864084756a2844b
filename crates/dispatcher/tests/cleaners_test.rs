#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use broker_core::SchedulerConfig;
    use broker_dispatcher::cleaners::*;
    use broker_dispatcher::delayed_task_runner::{DelayedTaskQueue, DelayedTaskRunner};
    use broker_dispatcher::job_registry::Job;
    use broker_dispatcher::publication_manager::PublicationManager;
    use broker_dispatcher::task_registry::TaskRegistry;
    use broker_dispatcher::user_service_manager::{
        UserServiceFinishCheckerHandler, UserServiceManager,
    };
    use broker_domain::entities::{CacheLevel, PublicationState, UserServiceState, UtilityCacheEntry};
    use broker_domain::providers::ProgressToken;
    use broker_domain::repositories::{
        CacheItemRepository, PublicationRepository, UtilityCacheRepository,
    };
    use broker_infrastructure::MetricsCollector;
    use broker_testing_utils::{
        seed_cache_items, seed_pool, InMemoryStore, MockPublicationProvider,
        MockUserServiceProvider, PoolBuilder, PublicationBuilder,
    };
    use chrono::{Duration, Utc};

    fn publication_cleaner(store: &InMemoryStore, provider: &MockPublicationProvider) -> PublicationCleaner {
        let metrics = Arc::new(MetricsCollector::new());
        let queue = Arc::new(DelayedTaskQueue::new(
            store.delayed_task_repository(),
            3,
            Arc::clone(&metrics),
        ));
        let manager = Arc::new(PublicationManager::new(
            store.pool_repository(),
            store.publication_repository(),
            store.cache_item_repository(),
            Arc::new(provider.clone()),
            queue,
            0,
            metrics,
        ));
        PublicationCleaner::new(store.publication_repository(), manager)
    }

    fn user_service_manager(
        store: &InMemoryStore,
        services: &MockUserServiceProvider,
    ) -> Arc<UserServiceManager> {
        let queue = Arc::new(DelayedTaskQueue::new(
            store.delayed_task_repository(),
            3,
            Arc::new(MetricsCollector::new()),
        ));
        Arc::new(UserServiceManager::new(
            store.cache_item_repository(),
            store.publication_repository(),
            Arc::new(services.clone()),
            queue,
        ))
    }

    /// Superseded publication with two superseded L1 items
    async fn superseded_publication(store: &InMemoryStore) -> (i64, Vec<i64>) {
        let pool = seed_pool(store, PoolBuilder::new().build()).await;
        let old = store.publications.insert(
            PublicationBuilder::new()
                .with_pool_id(pool.id)
                .with_state(PublicationState::Removable)
                .build(),
        );
        let items = seed_cache_items(
            store,
            pool.id,
            Some(old.id),
            CacheLevel::L1,
            UserServiceState::Removable,
            2,
        )
        .await;
        (old.id, items.iter().map(|i| i.id).collect())
    }

    async fn item_states(store: &InMemoryStore, ids: &[i64]) -> Vec<UserServiceState> {
        let mut states = Vec::new();
        for id in ids {
            states.push(store.cache_items.get_by_id(*id).await.unwrap().unwrap().state);
        }
        states
    }

    #[tokio::test]
    async fn test_publication_cleaner_unpublishes_idle_removable() {
        let store = InMemoryStore::new();
        let provider = MockPublicationProvider::new();
        let pool = seed_pool(&store, PoolBuilder::new().build()).await;

        let idle = store.publications.insert(
            PublicationBuilder::new()
                .with_pool_id(pool.id)
                .with_state(PublicationState::Removable)
                .build(),
        );
        let busy = store.publications.insert(
            PublicationBuilder::new()
                .with_pool_id(pool.id)
                .with_state(PublicationState::Removable)
                .build(),
        );
        let usable = store.publications.insert(
            PublicationBuilder::new()
                .with_pool_id(pool.id)
                .with_state(PublicationState::Usable)
                .build(),
        );
        seed_cache_items(
            &store,
            pool.id,
            Some(busy.id),
            CacheLevel::L1,
            UserServiceState::Removing,
            1,
        )
        .await;

        let cleaner = publication_cleaner(&store, &provider);
        assert_eq!(cleaner.clean().await.unwrap(), 1);

        let state = |id| {
            let publications = store.publications.clone();
            async move { publications.get_by_id(id).await.unwrap().unwrap().state }
        };
        assert_eq!(state(idle.id).await, PublicationState::Removed);
        assert_eq!(state(busy.id).await, PublicationState::Removable);
        assert_eq!(state(usable.id).await, PublicationState::Usable);
        assert_eq!(provider.destroy_calls(), 1);

        // 作业接口同样可用，且没有剩余可撤销的发布
        assert!(cleaner.run().await.is_ok());
        assert_eq!(provider.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_utility_cache_cleaner_removes_expired_entries() {
        let store = InMemoryStore::new();
        let repo = store.utility_cache_repository();
        let now = Utc::now();
        repo.put(&UtilityCacheEntry::new("a", "fresh", "1".into(), 3600, now))
            .await
            .unwrap();
        repo.put(&UtilityCacheEntry::new(
            "a",
            "old",
            "2".into(),
            10,
            now - Duration::seconds(120),
        ))
        .await
        .unwrap();

        let cleaner = UtilityCacheCleaner::new(Arc::clone(&repo));
        cleaner.run().await.unwrap();

        assert_eq!(store.utility_cache.count(), 1);
        assert!(repo.get("a", "fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_removed_items_let_superseded_publication_be_unpublished() {
        let store = InMemoryStore::new();
        let provider = MockPublicationProvider::new();
        let services = MockUserServiceProvider::new();
        services.set_progress(ProgressToken::Finished);
        let (publication_id, item_ids) = superseded_publication(&store).await;

        let cleaner = publication_cleaner(&store, &provider);
        // 实例仍可移除时发布不能撤销
        assert_eq!(cleaner.clean().await.unwrap(), 0);

        let remover = UserServiceRemover::new(
            store.cache_item_repository(),
            user_service_manager(&store, &services),
            10,
        );
        assert_eq!(remover.remove().await.unwrap(), 2);
        assert_eq!(
            item_states(&store, &item_ids).await,
            vec![UserServiceState::Removed, UserServiceState::Removed]
        );
        assert_eq!(services.call_count("destroy"), 2);

        assert_eq!(cleaner.clean().await.unwrap(), 1);
        let publication = store.publications.get_by_id(publication_id).await.unwrap().unwrap();
        assert_eq!(publication.state, PublicationState::Removed);

        // 没有剩余的可移除实例
        assert_eq!(remover.remove().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_running_removal_completes_through_finish_check() {
        let store = InMemoryStore::new();
        let services = MockUserServiceProvider::new().with_poll_interval(0);
        let (_, item_ids) = superseded_publication(&store).await;
        let manager = user_service_manager(&store, &services);

        let remover = UserServiceRemover::new(store.cache_item_repository(), Arc::clone(&manager), 1);
        remover.run().await.unwrap();
        assert_eq!(
            item_states(&store, &item_ids).await,
            vec![UserServiceState::Removing, UserServiceState::Removable]
        );
        assert_eq!(store.delayed_tasks.count(), 1);

        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(UserServiceFinishCheckerHandler::new(manager)));
        let runner = DelayedTaskRunner::new(
            store.delayed_task_repository(),
            Arc::new(registry),
            &SchedulerConfig::default(),
            Arc::new(MetricsCollector::new()),
        );

        // 服务提供者仍在处理时检查任务重新排队
        let handle = runner.execute_one_task().await.unwrap().unwrap();
        handle.await.unwrap();
        assert_eq!(store.delayed_tasks.count(), 1);
        assert_eq!(services.call_count("check"), 1);

        services.set_progress(ProgressToken::Finished);
        let handle = runner.execute_one_task().await.unwrap().unwrap();
        handle.await.unwrap();
        assert_eq!(store.delayed_tasks.count(), 0);
        assert_eq!(
            item_states(&store, &item_ids).await,
            vec![UserServiceState::Removed, UserServiceState::Removable]
        );
    }

    #[tokio::test]
    async fn test_error_progress_marks_item_error() {
        let store = InMemoryStore::new();
        let services = MockUserServiceProvider::new();
        services.set_progress(ProgressToken::Error("vm locked".to_string()));
        let (_, item_ids) = superseded_publication(&store).await;

        let remover = UserServiceRemover::new(
            store.cache_item_repository(),
            user_service_manager(&store, &services),
            10,
        );
        remover.remove().await.unwrap();

        assert_eq!(
            item_states(&store, &item_ids).await,
            vec![UserServiceState::Error, UserServiceState::Error]
        );
    }

    #[tokio::test]
    async fn test_user_service_info_cleaner_keeps_recent_records() {
        let store = InMemoryStore::new();
        let pool = seed_pool(&store, PoolBuilder::new().build()).await;
        let old = seed_cache_items(&store, pool.id, None, CacheLevel::L1, UserServiceState::Removed, 2).await;
        let recent =
            seed_cache_items(&store, pool.id, None, CacheLevel::L1, UserServiceState::Canceled, 1).await;
        let live = seed_cache_items(&store, pool.id, None, CacheLevel::L1, UserServiceState::Usable, 1).await;
        let long_ago = Utc::now() - Duration::hours(10);
        for item in old.iter().chain(live.iter()) {
            store
                .cache_items
                .update_state(item.id, item.state, long_ago)
                .await
                .unwrap();
        }

        let cleaner = UserServiceInfoCleaner::new(store.cache_item_repository(), 3600);
        cleaner.run().await.unwrap();

        let remaining: Vec<i64> = store.cache_items.get_all_items().iter().map(|i| i.id).collect();
        assert_eq!(remaining, vec![recent[0].id, live[0].id]);
    }
}
