//! Mock implementations for the repository and provider traits
//!
//! The repositories keep their rows behind a `Mutex` and perform every
//! claim/check-and-write under a single lock, so they honour the same atomic
//! contracts as the SQLite implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use broker_domain::entities::{
    CacheItem, CacheLevel, DelayedTaskRecord, Pool, Publication, PublicationState, ScheduledJob,
    UserServiceState, UtilityCacheEntry,
};
use broker_domain::providers::{
    ProgressToken, PublicationInstance, PublicationProvider, UserServiceProvider,
};
use broker_domain::repositories::{
    CacheItemRepository, DelayedTaskRepository, JobRepository, PoolRepository,
    PublicationRepository, UtilityCacheRepository,
};
use chrono::{DateTime, Duration, Utc};

/// Mock implementation of JobRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockJobRepository {
    jobs: Arc<Mutex<Vec<ScheduledJob>>>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_all_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Overwrite a job row, e.g. to move its next execution time
    pub fn set_job(&self, job: ScheduledJob) {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.iter_mut().find(|j| j.name == job.name) {
            Some(existing) => *existing = job,
            None => jobs.push(job),
        }
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn ensure_job(
        &self,
        name: &str,
        kind: &str,
        interval_seconds: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<ScheduledJob> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.name == name) {
            job.kind = kind.to_string();
            job.interval_seconds = interval_seconds;
            return Ok(job.clone());
        }

        let mut job = ScheduledJob::new(name, kind, interval_seconds, now);
        job.id = jobs.len() as i64 + 1;
        jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_next_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> BrokerResult<Option<ScheduledJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let candidate = jobs
            .iter_mut()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| j.next_execution_time);

        Ok(candidate.map(|job| {
            job.lease_owner = Some(owner.to_string());
            job.lease_expiry = Some(now + lease_duration);
            job.next_execution_time = now + Duration::seconds(job.interval_seconds);
            job.clone()
        }))
    }

    async fn release(&self, name: &str, owner: &str) -> BrokerResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs
            .iter_mut()
            .filter(|j| j.name == name && j.lease_owner.as_deref() == Some(owner))
        {
            job.lease_owner = None;
            job.lease_expiry = None;
        }
        Ok(())
    }

    async fn release_owned_by(&self, owner: &str) -> BrokerResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut released = 0;
        for job in jobs
            .iter_mut()
            .filter(|j| j.lease_owner.as_deref() == Some(owner))
        {
            job.lease_owner = None;
            job.lease_expiry = None;
            released += 1;
        }
        Ok(released)
    }

    async fn get_by_name(&self, name: &str) -> BrokerResult<Option<ScheduledJob>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.iter().find(|j| j.name == name).cloned())
    }

    async fn list(&self) -> BrokerResult<Vec<ScheduledJob>> {
        let mut jobs = self.jobs.lock().unwrap().clone();
        jobs.sort_by_key(|j| j.next_execution_time);
        Ok(jobs)
    }
}

/// Mock implementation of DelayedTaskRepository for testing
#[derive(Debug, Clone)]
pub struct MockDelayedTaskRepository {
    tasks: Arc<Mutex<Vec<DelayedTaskRecord>>>,
    next_id: Arc<Mutex<i64>>,
    /// Number of upcoming inserts that fail with a transient error
    failing_inserts: Arc<AtomicUsize>,
}

impl MockDelayedTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(Mutex::new(1)),
            failing_inserts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn get_all_tasks(&self) -> Vec<DelayedTaskRecord> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn tasks_with_tag(&self, tag: &str) -> Vec<DelayedTaskRecord> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.tag == tag)
            .cloned()
            .collect()
    }
}

impl Default for MockDelayedTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelayedTaskRepository for MockDelayedTaskRepository {
    async fn insert(&self, record: &DelayedTaskRecord) -> BrokerResult<DelayedTaskRecord> {
        let failing = self.failing_inserts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_inserts.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::DatabaseOperation("database is locked".to_string()));
        }

        let mut tasks = self.tasks.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut inserted = record.clone();
        inserted.id = *next_id;
        *next_id += 1;

        tasks.push(inserted.clone());
        Ok(inserted)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> BrokerResult<Option<DelayedTaskRecord>> {
        let mut tasks = self.tasks.lock().unwrap();
        let position = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_executable(now))
            .min_by_key(|(_, t)| (t.execution_time, t.id))
            .map(|(i, _)| i);

        Ok(position.map(|i| tasks.remove(i)))
    }

    async fn remove_by_tag(&self, tag: &str) -> BrokerResult<u64> {
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|t| t.tag != tag);
        Ok((before - tasks.len()) as u64)
    }

    async fn count_by_tag(&self, tag: &str) -> BrokerResult<i64> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks.iter().filter(|t| t.tag == tag).count() as i64)
    }
}

/// Mock implementation of PoolRepository for testing
#[derive(Debug, Clone)]
pub struct MockPoolRepository {
    pools: Arc<Mutex<HashMap<i64, Pool>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockPoolRepository {
    pub fn new() -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Replace a stored pool, keeping its id
    pub fn update_pool(&self, pool: Pool) {
        self.pools.lock().unwrap().insert(pool.id, pool);
    }
}

impl Default for MockPoolRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolRepository for MockPoolRepository {
    async fn create(&self, pool: &Pool) -> BrokerResult<Pool> {
        let mut pools = self.pools.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut new_pool = pool.clone();
        new_pool.id = *next_id;
        *next_id += 1;

        pools.insert(new_pool.id, new_pool.clone());
        Ok(new_pool)
    }

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<Pool>> {
        let pools = self.pools.lock().unwrap();
        Ok(pools.get(&id).cloned())
    }

    async fn list_cache_candidates(&self) -> BrokerResult<Vec<Pool>> {
        let pools = self.pools.lock().unwrap();
        let mut candidates: Vec<Pool> = pools
            .values()
            .filter(|p| p.is_active() && p.wants_caching())
            .cloned()
            .collect();
        candidates.sort_by_key(|p| p.id);
        Ok(candidates)
    }

    async fn increment_revision(&self, id: i64) -> BrokerResult<i32> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&id).ok_or(BrokerError::PoolNotFound { id })?;
        pool.current_publication_revision += 1;
        Ok(pool.current_publication_revision)
    }
}

/// Mock implementation of PublicationRepository for testing
#[derive(Debug, Clone)]
pub struct MockPublicationRepository {
    publications: Arc<Mutex<HashMap<i64, Publication>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockPublicationRepository {
    pub fn new() -> Self {
        Self {
            publications: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn count(&self) -> usize {
        self.publications.lock().unwrap().len()
    }

    /// Store a publication as-is, bypassing the non-terminal check
    pub fn insert(&self, publication: Publication) -> Publication {
        let mut publications = self.publications.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut stored = publication;
        if stored.id == 0 {
            stored.id = *next_id;
        }
        *next_id = (*next_id).max(stored.id + 1);

        publications.insert(stored.id, stored.clone());
        stored
    }
}

impl Default for MockPublicationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublicationRepository for MockPublicationRepository {
    async fn create_for_pool(
        &self,
        pool_id: i64,
        revision: i32,
        now: DateTime<Utc>,
    ) -> BrokerResult<Publication> {
        let mut publications = self.publications.lock().unwrap();
        if publications
            .values()
            .any(|p| p.pool_id == pool_id && p.state.is_publishing())
        {
            return Err(BrokerError::AlreadyPublishing(format!("服务池 {pool_id}")));
        }

        let mut next_id = self.next_id.lock().unwrap();
        let mut publication = Publication::new(pool_id, revision, now);
        publication.id = *next_id;
        *next_id += 1;

        publications.insert(publication.id, publication.clone());
        Ok(publication)
    }

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<Publication>> {
        let publications = self.publications.lock().unwrap();
        Ok(publications.get(&id).cloned())
    }

    async fn update(&self, publication: &Publication) -> BrokerResult<()> {
        let mut publications = self.publications.lock().unwrap();
        let stored = publications
            .get_mut(&publication.id)
            .ok_or(BrokerError::PublicationNotFound { id: publication.id })?;
        stored.state = publication.state;
        stored.state_date = publication.state_date;
        stored.data = publication.data.clone();
        Ok(())
    }

    async fn compare_and_set_state(
        &self,
        id: i64,
        expected: PublicationState,
        new_state: PublicationState,
        now: DateTime<Utc>,
    ) -> BrokerResult<bool> {
        let mut publications = self.publications.lock().unwrap();
        match publications.get_mut(&id) {
            Some(publication) if publication.state == expected => {
                publication.set_state(new_state, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_pool_publications(
        &self,
        pool_id: i64,
        from: PublicationState,
        to: PublicationState,
        except_id: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<u64> {
        let mut publications = self.publications.lock().unwrap();
        let mut changed = 0;
        for publication in publications
            .values_mut()
            .filter(|p| p.pool_id == pool_id && p.state == from && p.id != except_id)
        {
            publication.set_state(to, now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn active_for_pool(&self, pool_id: i64) -> BrokerResult<Option<Publication>> {
        let publications = self.publications.lock().unwrap();
        Ok(publications
            .values()
            .filter(|p| p.pool_id == pool_id && p.state == PublicationState::Usable)
            .max_by_key(|p| (p.revision, p.id))
            .cloned())
    }

    async fn count_in_state(&self, pool_id: i64, state: PublicationState) -> BrokerResult<i64> {
        let publications = self.publications.lock().unwrap();
        Ok(publications
            .values()
            .filter(|p| p.pool_id == pool_id && p.state == state)
            .count() as i64)
    }

    async fn list_by_pool(&self, pool_id: i64) -> BrokerResult<Vec<Publication>> {
        let publications = self.publications.lock().unwrap();
        let mut found: Vec<Publication> = publications
            .values()
            .filter(|p| p.pool_id == pool_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.id);
        Ok(found)
    }

    async fn list_in_state(&self, state: PublicationState) -> BrokerResult<Vec<Publication>> {
        let publications = self.publications.lock().unwrap();
        let mut found: Vec<Publication> = publications
            .values()
            .filter(|p| p.state == state)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.id);
        Ok(found)
    }
}

/// Mock implementation of CacheItemRepository for testing
#[derive(Debug, Clone)]
pub struct MockCacheItemRepository {
    items: Arc<Mutex<HashMap<i64, CacheItem>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockCacheItemRepository {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn get_all_items(&self) -> Vec<CacheItem> {
        let mut items: Vec<CacheItem> = self.items.lock().unwrap().values().cloned().collect();
        items.sort_by_key(|i| i.id);
        items
    }

    /// Countable items of a pool per level: (l1, l2, assigned)
    pub fn level_counts(&self, pool_id: i64) -> (usize, usize, usize) {
        let items = self.items.lock().unwrap();
        let count = |level: CacheLevel| {
            items
                .values()
                .filter(|i| i.pool_id == pool_id && i.level == level && i.state.is_countable())
                .count()
        };
        (
            count(CacheLevel::L1),
            count(CacheLevel::L2),
            count(CacheLevel::Assigned),
        )
    }

    fn countable_in_level(
        items: &HashMap<i64, CacheItem>,
        pool_id: i64,
        level: CacheLevel,
    ) -> Vec<CacheItem> {
        items
            .values()
            .filter(|i| i.pool_id == pool_id && i.level == level && i.state.is_countable())
            .cloned()
            .collect()
    }
}

impl Default for MockCacheItemRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheItemRepository for MockCacheItemRepository {
    async fn create(&self, item: &CacheItem) -> BrokerResult<CacheItem> {
        let mut items = self.items.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut new_item = item.clone();
        new_item.id = *next_id;
        *next_id += 1;

        items.insert(new_item.id, new_item.clone());
        Ok(new_item)
    }

    async fn get_by_id(&self, id: i64) -> BrokerResult<Option<CacheItem>> {
        let items = self.items.lock().unwrap();
        Ok(items.get(&id).cloned())
    }

    async fn count_in_level(&self, pool_id: i64, level: CacheLevel) -> BrokerResult<i64> {
        let items = self.items.lock().unwrap();
        Ok(Self::countable_in_level(&items, pool_id, level).len() as i64)
    }

    async fn count_live(&self, pool_id: i64) -> BrokerResult<i64> {
        let items = self.items.lock().unwrap();
        Ok(items
            .values()
            .filter(|i| i.pool_id == pool_id && i.state.is_countable())
            .count() as i64)
    }

    async fn list_in_level(
        &self,
        pool_id: i64,
        level: CacheLevel,
        newest_first: bool,
    ) -> BrokerResult<Vec<CacheItem>> {
        let items = self.items.lock().unwrap();
        let mut found = Self::countable_in_level(&items, pool_id, level);
        found.sort_by_key(|i| (i.creation_time, i.id));
        if newest_first {
            found.reverse();
        }
        Ok(found)
    }

    async fn move_to_level(&self, id: i64, level: CacheLevel) -> BrokerResult<()> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(&id)
            .ok_or(BrokerError::CacheItemNotFound { id })?;
        item.level = level;
        Ok(())
    }

    async fn update_state(
        &self,
        id: i64,
        state: UserServiceState,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(&id)
            .ok_or(BrokerError::CacheItemNotFound { id })?;
        item.state = state;
        item.state_date = now;
        Ok(())
    }

    async fn count_in_process_for_publication(&self, publication_id: i64) -> BrokerResult<i64> {
        let items = self.items.lock().unwrap();
        Ok(items
            .values()
            .filter(|i| i.publication_id == Some(publication_id) && !i.state.is_info())
            .count() as i64)
    }

    async fn mark_superseded_removable(
        &self,
        pool_id: i64,
        current_publication_id: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<u64> {
        let mut items = self.items.lock().unwrap();
        let mut marked = 0;
        for item in items.values_mut().filter(|i| {
            i.pool_id == pool_id
                && i.is_cached()
                && i.state.is_countable()
                && i.publication_id != Some(current_publication_id)
        }) {
            item.state = UserServiceState::Removable;
            item.state_date = now;
            marked += 1;
        }
        Ok(marked)
    }

    async fn list_by_pool(&self, pool_id: i64) -> BrokerResult<Vec<CacheItem>> {
        let items = self.items.lock().unwrap();
        let mut found: Vec<CacheItem> = items
            .values()
            .filter(|i| i.pool_id == pool_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.id);
        Ok(found)
    }

    async fn list_in_state(
        &self,
        state: UserServiceState,
        limit: i64,
    ) -> BrokerResult<Vec<CacheItem>> {
        let items = self.items.lock().unwrap();
        let mut found: Vec<CacheItem> = items
            .values()
            .filter(|i| i.state == state)
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.state_date, i.id));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn delete_info_older_than(&self, cutoff: DateTime<Utc>) -> BrokerResult<u64> {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|_, i| !(i.state.is_info() && i.state_date < cutoff));
        Ok((before - items.len()) as u64)
    }
}

/// Mock implementation of UtilityCacheRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockUtilityCacheRepository {
    entries: Arc<Mutex<HashMap<(String, String), UtilityCacheEntry>>>,
}

impl MockUtilityCacheRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl UtilityCacheRepository for MockUtilityCacheRepository {
    async fn get(&self, owner: &str, key: &str) -> BrokerResult<Option<UtilityCacheEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(&(owner.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, entry: &UtilityCacheEntry) -> BrokerResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert((entry.owner.clone(), entry.key.clone()), entry.clone());
        Ok(())
    }

    async fn remove(&self, owner: &str, key: &str) -> BrokerResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&(owner.to_string(), key.to_string()));
        Ok(())
    }

    async fn clean_up(&self, now: DateTime<Utc>) -> BrokerResult<u64> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

/// One in-memory repository of each kind, as used by a single test
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    pub jobs: MockJobRepository,
    pub delayed_tasks: MockDelayedTaskRepository,
    pub pools: MockPoolRepository,
    pub publications: MockPublicationRepository,
    pub cache_items: MockCacheItemRepository,
    pub utility_cache: MockUtilityCacheRepository,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::new(self.jobs.clone())
    }

    pub fn delayed_task_repository(&self) -> Arc<dyn DelayedTaskRepository> {
        Arc::new(self.delayed_tasks.clone())
    }

    pub fn pool_repository(&self) -> Arc<dyn PoolRepository> {
        Arc::new(self.pools.clone())
    }

    pub fn publication_repository(&self) -> Arc<dyn PublicationRepository> {
        Arc::new(self.publications.clone())
    }

    pub fn cache_item_repository(&self) -> Arc<dyn CacheItemRepository> {
        Arc::new(self.cache_items.clone())
    }

    pub fn utility_cache_repository(&self) -> Arc<dyn UtilityCacheRepository> {
        Arc::new(self.utility_cache.clone())
    }
}

/// Call counters shared between a mock provider and the instances it hands out
#[derive(Debug, Default)]
pub struct ProviderCallCounters {
    pub publish: AtomicUsize,
    pub check_state: AtomicUsize,
    pub finish: AtomicUsize,
    pub cancel: AtomicUsize,
    pub destroy: AtomicUsize,
}

impl ProviderCallCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

type ScriptStep = Result<ProgressToken, String>;

/// Publication provider whose instances replay a scripted sequence of results.
///
/// Every provider call (publish, check, cancel, destroy) pops the next step;
/// an empty script yields `Finished`.
#[derive(Debug, Clone)]
pub struct MockPublicationProvider {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    poll_interval: u64,
    pub calls: Arc<ProviderCallCounters>,
}

impl MockPublicationProvider {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            poll_interval: 5,
            calls: Arc::new(ProviderCallCounters::default()),
        }
    }

    pub fn with_poll_interval(mut self, seconds: u64) -> Self {
        self.poll_interval = seconds;
        self
    }

    pub fn push_token(&self, token: ProgressToken) {
        self.script.lock().unwrap().push_back(Ok(token));
    }

    pub fn push_failure(&self, message: &str) {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn publish_calls(&self) -> usize {
        ProviderCallCounters::get(&self.calls.publish)
    }

    pub fn check_calls(&self) -> usize {
        ProviderCallCounters::get(&self.calls.check_state)
    }

    pub fn finish_calls(&self) -> usize {
        ProviderCallCounters::get(&self.calls.finish)
    }

    pub fn cancel_calls(&self) -> usize {
        ProviderCallCounters::get(&self.calls.cancel)
    }

    pub fn destroy_calls(&self) -> usize {
        ProviderCallCounters::get(&self.calls.destroy)
    }
}

impl Default for MockPublicationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublicationProvider for MockPublicationProvider {
    async fn instance(
        &self,
        _pool: &Pool,
        publication: &Publication,
    ) -> BrokerResult<Box<dyn PublicationInstance>> {
        let interactions = publication
            .data
            .as_deref()
            .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
            .and_then(|v| v["interactions"].as_u64())
            .unwrap_or(0);

        Ok(Box::new(MockPublicationInstance {
            script: Arc::clone(&self.script),
            poll_interval: self.poll_interval,
            calls: Arc::clone(&self.calls),
            interactions,
        }))
    }
}

pub struct MockPublicationInstance {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    poll_interval: u64,
    calls: Arc<ProviderCallCounters>,
    interactions: u64,
}

impl MockPublicationInstance {
    fn next_step(&mut self, counter: &AtomicUsize) -> BrokerResult<ProgressToken> {
        counter.fetch_add(1, Ordering::SeqCst);
        self.interactions += 1;
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(token)) => Ok(token),
            Some(Err(message)) => Err(BrokerError::Provider(message)),
            None => Ok(ProgressToken::Finished),
        }
    }
}

#[async_trait]
impl PublicationInstance for MockPublicationInstance {
    async fn publish(&mut self) -> BrokerResult<ProgressToken> {
        let calls = Arc::clone(&self.calls);
        self.next_step(&calls.publish)
    }

    async fn check_state(&mut self) -> BrokerResult<ProgressToken> {
        let calls = Arc::clone(&self.calls);
        self.next_step(&calls.check_state)
    }

    async fn finish(&mut self) -> BrokerResult<()> {
        self.calls.finish.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&mut self) -> BrokerResult<ProgressToken> {
        let calls = Arc::clone(&self.calls);
        self.next_step(&calls.cancel)
    }

    async fn destroy(&mut self) -> BrokerResult<ProgressToken> {
        let calls = Arc::clone(&self.calls);
        self.next_step(&calls.destroy)
    }

    fn suggested_poll_interval(&self) -> u64 {
        self.poll_interval
    }

    fn serialize_data(&self) -> BrokerResult<Option<String>> {
        Ok(Some(
            serde_json::json!({ "interactions": self.interactions }).to_string(),
        ))
    }
}

/// A recorded user-service provider call: (operation, cache item id)
pub type ServiceCall = (&'static str, i64);

/// User-service provider with configurable capacity that records every call.
///
/// Deploy, cancel, destroy and state checks all report the same configurable
/// progress; the default `Running` leaves items in their in-progress state.
#[derive(Debug, Clone)]
pub struct MockUserServiceProvider {
    can_initiate: Arc<AtomicBool>,
    fail_deploy: Arc<AtomicBool>,
    max_deployed: Arc<Mutex<Option<u32>>>,
    progress: Arc<Mutex<ProgressToken>>,
    poll_interval: u64,
    calls: Arc<Mutex<Vec<ServiceCall>>>,
}

impl MockUserServiceProvider {
    pub fn new() -> Self {
        Self {
            can_initiate: Arc::new(AtomicBool::new(true)),
            fail_deploy: Arc::new(AtomicBool::new(false)),
            max_deployed: Arc::new(Mutex::new(None)),
            progress: Arc::new(Mutex::new(ProgressToken::Running)),
            poll_interval: 5,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_poll_interval(mut self, seconds: u64) -> Self {
        self.poll_interval = seconds;
        self
    }

    pub fn set_can_initiate(&self, value: bool) {
        self.can_initiate.store(value, Ordering::SeqCst);
    }

    /// Make every following `deploy` fail with a provider error
    pub fn set_fail_deploy(&self, value: bool) {
        self.fail_deploy.store(value, Ordering::SeqCst);
    }

    pub fn set_max_deployed(&self, max: Option<u32>) {
        *self.max_deployed.lock().unwrap() = max;
    }

    pub fn set_progress(&self, token: ProgressToken) {
        *self.progress.lock().unwrap() = token;
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| *op == operation)
            .count()
    }

    fn record(&self, operation: &'static str, item: &CacheItem) {
        self.calls.lock().unwrap().push((operation, item.id));
    }

    fn progress(&self) -> ProgressToken {
        self.progress.lock().unwrap().clone()
    }
}

impl Default for MockUserServiceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserServiceProvider for MockUserServiceProvider {
    async fn can_initiate(&self, _pool: &Pool) -> BrokerResult<bool> {
        Ok(self.can_initiate.load(Ordering::SeqCst))
    }

    fn max_deployed(&self, _pool: &Pool) -> Option<u32> {
        *self.max_deployed.lock().unwrap()
    }

    async fn deploy(&self, _pool: &Pool, item: &CacheItem) -> BrokerResult<ProgressToken> {
        self.record("deploy", item);
        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(BrokerError::Provider("deploy failed".into()));
        }
        Ok(self.progress())
    }

    async fn move_to_level(&self, item: &CacheItem, _level: CacheLevel) -> BrokerResult<()> {
        self.record("move", item);
        Ok(())
    }

    async fn cancel(&self, item: &CacheItem) -> BrokerResult<ProgressToken> {
        self.record("cancel", item);
        Ok(self.progress())
    }

    async fn destroy(&self, item: &CacheItem) -> BrokerResult<ProgressToken> {
        self.record("destroy", item);
        Ok(self.progress())
    }

    async fn check_state(&self, item: &CacheItem) -> BrokerResult<ProgressToken> {
        self.record("check", item);
        Ok(self.progress())
    }

    fn suggested_poll_interval(&self) -> u64 {
        self.poll_interval
    }
}
