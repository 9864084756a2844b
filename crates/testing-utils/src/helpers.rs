//! Test helper utilities and common testing patterns

use std::time::Duration;

use broker_domain::entities::{CacheItem, CacheLevel, Pool, UserServiceState};
use broker_domain::repositories::{CacheItemRepository, PoolRepository};
use chrono::Utc;
use tokio::time::sleep;

use crate::builders::CacheItemBuilder;
use crate::mocks::InMemoryStore;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// Useful where the outcome of spawned tasks has to be awaited.
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Set up logging for tests (call once per test binary)
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

/// Store a pool in the in-memory store and return it with its assigned id
pub async fn seed_pool(store: &InMemoryStore, pool: Pool) -> Pool {
    store.pools.create(&pool).await.unwrap()
}

/// Store `count` items of one pool in the given level and state.
///
/// Creation times are spaced one second apart, oldest first.
pub async fn seed_cache_items(
    store: &InMemoryStore,
    pool_id: i64,
    publication_id: Option<i64>,
    level: CacheLevel,
    state: UserServiceState,
    count: usize,
) -> Vec<CacheItem> {
    let base = Utc::now() - chrono::Duration::seconds(3600);
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        let mut builder = CacheItemBuilder::new()
            .with_pool_id(pool_id)
            .with_level(level)
            .with_state(state)
            .created_at(base + chrono::Duration::seconds(i as i64));
        if let Some(publication_id) = publication_id {
            builder = builder.with_publication_id(publication_id);
        }
        created.push(store.cache_items.create(&builder.build()).await.unwrap());
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::PoolBuilder;

    #[tokio::test]
    async fn test_wait_for_success() {
        let mut counter = 0;
        let condition = || {
            counter += 1;
            let reached = counter >= 3;
            async move { reached }
        };

        let result = TestEnv::wait_for(condition, Duration::from_millis(500)).await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let condition = || async { false };
        let result = TestEnv::wait_for(condition, Duration::from_millis(100)).await;
        assert!(!result);
    }

    #[tokio::test]
    async fn test_seed_cache_items() {
        let store = InMemoryStore::new();
        let pool = seed_pool(&store, PoolBuilder::new().with_sizes(1, 2, 1, 5).build()).await;
        let items = seed_cache_items(
            &store,
            pool.id,
            None,
            CacheLevel::L2,
            UserServiceState::Usable,
            3,
        )
        .await;

        assert_eq!(items.len(), 3);
        assert!(items[0].creation_time < items[2].creation_time);
        assert_eq!(store.cache_items.level_counts(pool.id), (0, 3, 0));
    }
}
