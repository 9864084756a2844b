pub mod sqlite_cache_item_repository;
pub mod sqlite_delayed_task_repository;
pub mod sqlite_job_repository;
pub mod sqlite_pool_repository;
pub mod sqlite_publication_repository;
pub mod sqlite_utility_cache_repository;

pub use sqlite_cache_item_repository::SqliteCacheItemRepository;
pub use sqlite_delayed_task_repository::SqliteDelayedTaskRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_pool_repository::SqlitePoolRepository;
pub use sqlite_publication_repository::SqlitePublicationRepository;
pub use sqlite_utility_cache_repository::SqliteUtilityCacheRepository;
