//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::{DateTime, Utc};
use broker_domain::entities::{
    CacheItem, CacheLevel, Pool, PoolState, Publication, PublicationState, UserServiceState,
};

/// Builder for creating test Pool entities
pub struct PoolBuilder {
    pool: Pool,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            pool: Pool {
                id: 1,
                name: "test_pool".to_string(),
                state: PoolState::Active,
                initial_size: 0,
                cache_l1_target: 0,
                cache_l2_target: 0,
                max_size: 10,
                requires_publication: false,
                current_publication_revision: 1,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.pool.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.pool.name = name.to_string();
        self
    }

    pub fn with_state(mut self, state: PoolState) -> Self {
        self.pool.state = state;
        self
    }

    /// initial, L1 target, L2 target and max size in one call
    pub fn with_sizes(mut self, initial: i32, l1: i32, l2: i32, max: i32) -> Self {
        self.pool.initial_size = initial;
        self.pool.cache_l1_target = l1;
        self.pool.cache_l2_target = l2;
        self.pool.max_size = max;
        self
    }

    pub fn requiring_publication(mut self) -> Self {
        self.pool.requires_publication = true;
        self
    }

    pub fn with_revision(mut self, revision: i32) -> Self {
        self.pool.current_publication_revision = revision;
        self
    }

    pub fn build(self) -> Pool {
        self.pool
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test CacheItem entities
pub struct CacheItemBuilder {
    item: CacheItem,
}

impl CacheItemBuilder {
    pub fn new() -> Self {
        Self {
            item: CacheItem::new(1, None, CacheLevel::L1, Utc::now()),
        }
    }

    pub fn with_pool_id(mut self, pool_id: i64) -> Self {
        self.item.pool_id = pool_id;
        self
    }

    pub fn with_publication_id(mut self, publication_id: i64) -> Self {
        self.item.publication_id = Some(publication_id);
        self
    }

    pub fn with_level(mut self, level: CacheLevel) -> Self {
        self.item.level = level;
        self
    }

    pub fn with_state(mut self, state: UserServiceState) -> Self {
        self.item.state = state;
        self
    }

    pub fn usable(self) -> Self {
        self.with_state(UserServiceState::Usable)
    }

    pub fn created_at(mut self, time: DateTime<Utc>) -> Self {
        self.item.creation_time = time;
        self.item.state_date = time;
        self
    }

    pub fn build(self) -> CacheItem {
        self.item
    }
}

impl Default for CacheItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Publication entities
pub struct PublicationBuilder {
    publication: Publication,
}

impl PublicationBuilder {
    pub fn new() -> Self {
        Self {
            publication: Publication::new(1, 1, Utc::now()),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.publication.id = id;
        self
    }

    pub fn with_pool_id(mut self, pool_id: i64) -> Self {
        self.publication.pool_id = pool_id;
        self
    }

    pub fn with_state(mut self, state: PublicationState) -> Self {
        self.publication.state = state;
        self
    }

    pub fn with_revision(mut self, revision: i32) -> Self {
        self.publication.revision = revision;
        self
    }

    pub fn build(self) -> Publication {
        self.publication
    }
}

impl Default for PublicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
