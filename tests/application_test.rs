#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use broker_core::AppConfig;
    use broker_domain::entities::{CacheItem, CacheLevel, PublicationState, UserServiceState};
    use broker_domain::providers::ProgressToken;
    use broker_domain::repositories::{CacheItemRepository, PoolRepository, PublicationRepository};
    use broker_infrastructure::DatabaseManager;
    use broker_testing_utils::{
        MockPublicationProvider, MockUserServiceProvider, PoolBuilder, TestEnv,
    };
    use tokio_util::sync::CancellationToken;
    use vdi_broker::app::{
        PUBLICATION_CLEANER_JOB, SERVICE_CACHE_UPDATER_JOB, USER_SERVICE_CLEANER_JOB,
        USER_SERVICE_INFO_CLEANER_JOB, UTILITY_CACHE_CLEANER_JOB,
    };
    use vdi_broker::Application;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.scheduler.scheduler_threads = 2;
        config.scheduler.delayed_task_threads = 1;
        config.scheduler.scheduler_granularity_seconds = 1;
        config.scheduler.delayed_task_granularity_seconds = 1;
        config.scheduler.scheduler_stagger_millis = 0;
        config.scheduler.delayed_task_stagger_millis = 0;
        config.scheduler.shutdown_timeout_seconds = 5;
        config.cache.publication_launch_delay_seconds = 0;
        config.cache.publication_cleaner_delay_seconds = 1;
        config.cache.user_service_cleaner_delay_seconds = 1;
        config
    }

    async fn test_app(
        publications: MockPublicationProvider,
        services: MockUserServiceProvider,
    ) -> Application {
        let database = DatabaseManager::in_memory().await.unwrap();
        Application::with_providers(
            test_config(),
            database,
            Arc::new(publications),
            Arc::new(services),
        )
        .with_hostname("broker-test")
    }

    #[tokio::test]
    async fn test_register_jobs_is_idempotent() {
        let app = test_app(MockPublicationProvider::new(), MockUserServiceProvider::new()).await;

        let jobs = app.register_jobs().await.unwrap();
        let names: Vec<&str> = jobs.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                SERVICE_CACHE_UPDATER_JOB,
                USER_SERVICE_INFO_CLEANER_JOB,
                USER_SERVICE_CLEANER_JOB,
                PUBLICATION_CLEANER_JOB,
                UTILITY_CACHE_CLEANER_JOB
            ]
        );
        assert_eq!(jobs[0].interval_seconds, 19);
        assert_eq!(jobs[2].interval_seconds, 1);

        app.register_jobs().await.unwrap();
        assert_eq!(app.list_jobs().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_run_fills_cache_and_stops_on_shutdown() {
        TestEnv::init_logging();
        let services = MockUserServiceProvider::new();
        let app = Arc::new(test_app(MockPublicationProvider::new(), services.clone()).await);
        app.database()
            .pool_repository()
            .create(&PoolBuilder::new().with_sizes(0, 1, 0, 10).build())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = {
            let app = Arc::clone(&app);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { app.run(shutdown).await })
        };

        let deployed = TestEnv::wait_for(
            || {
                let services = services.clone();
                async move { services.call_count("deploy") == 1 }
            },
            Duration::from_secs(10),
        )
        .await;
        assert!(deployed, "cache updater did not run");

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("application should stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_publication_completes_through_delayed_tasks() {
        let app = Arc::new(
            test_app(
                MockPublicationProvider::new().with_poll_interval(0),
                MockUserServiceProvider::new(),
            )
            .await,
        );
        let pool = app
            .database()
            .pool_repository()
            .create(&PoolBuilder::new().build())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = {
            let app = Arc::clone(&app);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { app.run(shutdown).await })
        };

        let publication = app.publication_manager().publish(pool.id).await.unwrap();
        assert_eq!(publication.state, PublicationState::Launching);

        let publications = app.database().publication_repository();
        let usable = TestEnv::wait_for(
            || {
                let publications = Arc::clone(&publications);
                async move {
                    matches!(
                        publications.get_by_id(publication.id).await,
                        Ok(Some(p)) if p.state == PublicationState::Usable
                    )
                }
            },
            Duration::from_secs(15),
        )
        .await;
        assert!(usable, "publication did not become usable");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_superseded_publication_is_removed_with_its_items() {
        let services = MockUserServiceProvider::new();
        services.set_progress(ProgressToken::Finished);
        let app = Arc::new(test_app(MockPublicationProvider::new(), services.clone()).await);
        let database = app.database();
        let pool = database
            .pool_repository()
            .create(&PoolBuilder::new().with_sizes(0, 0, 0, 10).build())
            .await
            .unwrap();

        let now = chrono::Utc::now();
        let publications = database.publication_repository();
        let old = publications.create_for_pool(pool.id, 1, now).await.unwrap();
        assert!(publications
            .compare_and_set_state(old.id, PublicationState::Launching, PublicationState::Removable, now)
            .await
            .unwrap());
        let cache_items = database.cache_item_repository();
        for _ in 0..2 {
            let item = cache_items
                .create(&CacheItem::new(pool.id, Some(old.id), CacheLevel::L1, now))
                .await
                .unwrap();
            cache_items
                .update_state(item.id, UserServiceState::Removable, now)
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = {
            let app = Arc::clone(&app);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { app.run(shutdown).await })
        };

        let removed = TestEnv::wait_for(
            || {
                let publications = Arc::clone(&publications);
                async move {
                    matches!(
                        publications.get_by_id(old.id).await,
                        Ok(Some(p)) if p.state == PublicationState::Removed
                    )
                }
            },
            Duration::from_secs(15),
        )
        .await;
        assert!(removed, "superseded publication was not removed");

        let items = cache_items.list_by_pool(pool.id).await.unwrap();
        assert!(items.iter().all(|i| i.state == UserServiceState::Removed));
        assert_eq!(services.call_count("destroy"), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
