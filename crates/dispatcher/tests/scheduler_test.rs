#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use broker_core::{BrokerError, BrokerResult, SchedulerConfig};
    use broker_dispatcher::job_registry::{Job, JobRegistry};
    use broker_dispatcher::scheduler::*;
    use broker_domain::repositories::JobRepository;
    use broker_infrastructure::{DatabaseManager, MetricsCollector};
    use broker_testing_utils::MockJobRepository;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        fail: bool,
        pause: Duration,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self) -> BrokerResult<()> {
            tokio::time::sleep(self.pause).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BrokerError::Internal("job failed".to_string()));
            }
            Ok(())
        }
    }

    fn create_test_metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new())
    }

    fn registry_with(kind: &str, runs: Arc<AtomicUsize>, fail: bool) -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(
            kind,
            Arc::new(CountingJob {
                runs,
                fail,
                pause: Duration::from_millis(10),
            }),
        );
        Arc::new(registry)
    }

    fn scheduler(
        repo: Arc<dyn JobRepository>,
        registry: Arc<JobRegistry>,
        owner: &str,
    ) -> JobScheduler {
        let config = SchedulerConfig {
            scheduler_granularity_seconds: 1,
            ..SchedulerConfig::default()
        };
        JobScheduler::new(
            repo,
            registry,
            owner.to_string(),
            &config,
            create_test_metrics(),
        )
    }

    #[tokio::test]
    async fn test_register_job_requires_known_kind() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MockJobRepository::new());
        let scheduler = scheduler(repo.clone(), registry_with("counter", runs, false), "host-0");

        let result = scheduler.register_job("Unknown", "missing", 10).await;
        assert!(matches!(result, Err(BrokerError::JobKindNotRegistered(_))));
        assert!(repo.get_all_jobs().is_empty());

        let job = scheduler.register_job("Counter", "counter", 10).await.unwrap();
        assert_eq!(job.interval_seconds, 10);

        // 重复注册只更新间隔
        let job = scheduler.register_job("Counter", "counter", 30).await.unwrap();
        assert_eq!(job.interval_seconds, 30);
        assert_eq!(repo.get_all_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_one_job_runs_and_releases_lease() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MockJobRepository::new());
        let scheduler = scheduler(
            repo.clone(),
            registry_with("counter", runs.clone(), false),
            "host-0",
        );
        scheduler.register_job("Counter", "counter", 60).await.unwrap();

        let before = Utc::now();
        assert!(scheduler.execute_one_job().await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let job = repo.get_by_name("Counter").await.unwrap().unwrap();
        assert!(job.lease_owner.is_none());
        assert!(job.next_execution_time >= before + chrono::Duration::seconds(60));

        // 下次执行时间未到
        assert!(!scheduler.execute_one_job().await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_job_is_not_retried_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MockJobRepository::new());
        let scheduler = scheduler(
            repo.clone(),
            registry_with("counter", runs.clone(), true),
            "host-0",
        );
        scheduler.register_job("Counter", "counter", 60).await.unwrap();

        assert!(scheduler.execute_one_job().await.unwrap());
        assert!(!scheduler.execute_one_job().await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let job = repo.get_by_name("Counter").await.unwrap().unwrap();
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_kind_releases_lease() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MockJobRepository::new());
        repo.ensure_job("Ghost", "ghost", 60, Utc::now()).await.unwrap();
        let scheduler = scheduler(repo.clone(), registry_with("counter", runs, false), "host-0");

        let result = scheduler.execute_one_job().await;
        assert!(matches!(result, Err(BrokerError::JobKindNotRegistered(_))));

        let job = repo.get_by_name("Ghost").await.unwrap().unwrap();
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_schedulers_run_job_once() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = registry_with("counter", runs.clone(), false);

        let first = scheduler(db.job_repository(), Arc::clone(&registry), "host-0");
        let second = scheduler(db.job_repository(), Arc::clone(&registry), "host-1");
        first.register_job("Counter", "counter", 3600).await.unwrap();

        let (a, b) = tokio::join!(first.execute_one_job(), second.execute_one_job());
        let executed = [a.unwrap(), b.unwrap()];

        assert_eq!(executed.iter().filter(|e| **e).count(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_releases_stale_leases_and_stops() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MockJobRepository::new());
        let now = Utc::now();
        let mut job = repo.ensure_job("Counter", "counter", 60, now).await.unwrap();
        job.lease_owner = Some("host-0".to_string());
        job.lease_expiry = Some(now + chrono::Duration::seconds(300));
        job.next_execution_time = now + chrono::Duration::seconds(3600);
        repo.set_job(job);

        let scheduler = Arc::new(scheduler(
            repo.clone(),
            registry_with("counter", runs, false),
            "host-0",
        ));
        let shutdown = CancellationToken::new();
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler should stop after cancellation")
            .unwrap();

        let job = repo.get_by_name("Counter").await.unwrap().unwrap();
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_startup_keeps_leases_of_other_process_on_same_host() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MockJobRepository::new());
        let now = Utc::now();
        let other_process = worker_owner_id("host", 100, 0);
        let mut job = repo.ensure_job("Counter", "counter", 60, now).await.unwrap();
        job.lease_owner = Some(other_process.clone());
        job.lease_expiry = Some(now + chrono::Duration::seconds(300));
        job.next_execution_time = now + chrono::Duration::seconds(3600);
        repo.set_job(job);

        let scheduler = Arc::new(scheduler(
            repo.clone(),
            registry_with("counter", runs.clone(), false),
            &worker_owner_id("host", 200, 0),
        ));
        let shutdown = CancellationToken::new();
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler should stop after cancellation")
            .unwrap();

        let job = repo.get_by_name("Counter").await.unwrap().unwrap();
        assert_eq!(job.lease_owner, Some(other_process));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
