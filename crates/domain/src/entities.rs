use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 周期性作业
///
/// 同一时刻全集群至多一个 worker 持有某作业的未过期租约。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub interval_seconds: i64,
    pub next_execution_time: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(name: &str, kind: &str, interval_seconds: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            kind: kind.to_string(),
            interval_seconds,
            next_execution_time: now,
            lease_owner: None,
            lease_expiry: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_execution_time <= now
    }

    /// 租约存在且尚未过期
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.lease_expiry) {
            (Some(_), Some(expiry)) => expiry > now,
            _ => false,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.is_leased(now)
    }
}

/// 持久化的一次性延迟任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayedTaskRecord {
    pub id: i64,
    /// 任务类型的稳定标识
    pub kind: String,
    /// 任务参数（JSON）
    pub payload: String,
    pub insert_time: DateTime<Utc>,
    pub delay_seconds: i64,
    pub execution_time: DateTime<Utc>,
    pub tag: String,
}

impl DelayedTaskRecord {
    pub fn new(kind: &str, payload: String, delay_seconds: i64, tag: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            kind: kind.to_string(),
            payload,
            insert_time: now,
            delay_seconds,
            execution_time: now + Duration::seconds(delay_seconds),
            tag: tag.to_string(),
        }
    }

    /// 到期，或插入时间位于未来（本机时钟被回拨）时视为可执行
    pub fn is_executable(&self, now: DateTime<Utc>) -> bool {
        self.execution_time <= now || self.insert_time > now
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PoolState {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "REMOVABLE")]
    Removable,
    #[serde(rename = "REMOVED")]
    Removed,
}

/// 服务池（桌面发布定义）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pool {
    pub id: i64,
    pub name: String,
    pub state: PoolState,
    pub initial_size: i32,
    pub cache_l1_target: i32,
    pub cache_l2_target: i32,
    /// 为 0 时关闭缓存
    pub max_size: i32,
    /// 服务类型需要发布才能部署实例
    pub requires_publication: bool,
    pub current_publication_revision: i32,
}

impl Pool {
    pub fn is_active(&self) -> bool {
        self.state == PoolState::Active
    }

    pub fn wants_caching(&self) -> bool {
        self.max_size > 0 && (self.initial_size > 0 || self.cache_l1_target > 0)
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ID: {})", self.name, self.id)
    }
}

/// 发布状态机
///
/// LAUNCHING → PREPARING → {USABLE, ERROR}; USABLE → REMOVABLE → REMOVING → REMOVED;
/// {LAUNCHING, PREPARING, REMOVING} → CANCELING → CANCELED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PublicationState {
    #[serde(rename = "LAUNCHING")]
    Launching,
    #[serde(rename = "PREPARING")]
    Preparing,
    #[serde(rename = "USABLE")]
    Usable,
    #[serde(rename = "REMOVABLE")]
    Removable,
    #[serde(rename = "REMOVING")]
    Removing,
    #[serde(rename = "REMOVED")]
    Removed,
    #[serde(rename = "CANCELING")]
    Canceling,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "ERROR")]
    Error,
}

impl PublicationState {
    /// 非终态集合，每个服务池同时至多一个发布处于其中
    pub const PUBLISHING: [PublicationState; 4] = [
        PublicationState::Launching,
        PublicationState::Preparing,
        PublicationState::Removing,
        PublicationState::Canceling,
    ];

    pub fn is_publishing(&self) -> bool {
        Self::PUBLISHING.contains(self)
    }

    /// 可以取消的状态；CANCELING 已在取消中
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            PublicationState::Launching | PublicationState::Preparing | PublicationState::Removing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationState::Launching => "LAUNCHING",
            PublicationState::Preparing => "PREPARING",
            PublicationState::Usable => "USABLE",
            PublicationState::Removable => "REMOVABLE",
            PublicationState::Removing => "REMOVING",
            PublicationState::Removed => "REMOVED",
            PublicationState::Canceling => "CANCELING",
            PublicationState::Canceled => "CANCELED",
            PublicationState::Error => "ERROR",
        }
    }
}

impl FromStr for PublicationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LAUNCHING" => Ok(PublicationState::Launching),
            "PREPARING" => Ok(PublicationState::Preparing),
            "USABLE" => Ok(PublicationState::Usable),
            "REMOVABLE" => Ok(PublicationState::Removable),
            "REMOVING" => Ok(PublicationState::Removing),
            "REMOVED" => Ok(PublicationState::Removed),
            "CANCELING" => Ok(PublicationState::Canceling),
            "CANCELED" => Ok(PublicationState::Canceled),
            "ERROR" => Ok(PublicationState::Error),
            _ => Err(format!("Invalid publication state: {s}")),
        }
    }
}

impl fmt::Display for PublicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务池模板在某个修订版本上的可部署快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Publication {
    pub id: i64,
    pub pool_id: i64,
    pub state: PublicationState,
    pub state_date: DateTime<Utc>,
    pub publish_date: DateTime<Utc>,
    pub revision: i32,
    /// 服务提供者的不透明进度数据
    pub data: Option<String>,
}

impl Publication {
    pub fn new(pool_id: i64, revision: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            pool_id,
            state: PublicationState::Launching,
            state_date: now,
            publish_date: now,
            revision,
            data: None,
        }
    }

    pub fn set_state(&mut self, state: PublicationState, now: DateTime<Utc>) {
        self.state = state;
        self.state_date = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    /// 已就绪，可立即分配
    #[serde(rename = "L1")]
    L1,
    /// 预置但未完全就绪，可提升到 L1
    #[serde(rename = "L2")]
    L2,
    #[serde(rename = "ASSIGNED")]
    Assigned,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::L1 => "L1",
            CacheLevel::L2 => "L2",
            CacheLevel::Assigned => "ASSIGNED",
        }
    }
}

impl FromStr for CacheLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L1" => Ok(CacheLevel::L1),
            "L2" => Ok(CacheLevel::L2),
            "ASSIGNED" => Ok(CacheLevel::Assigned),
            _ => Err(format!("Invalid cache level: {s}")),
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户服务实例的生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UserServiceState {
    #[serde(rename = "PREPARING")]
    Preparing,
    #[serde(rename = "USABLE")]
    Usable,
    #[serde(rename = "REMOVABLE")]
    Removable,
    #[serde(rename = "REMOVING")]
    Removing,
    #[serde(rename = "REMOVED")]
    Removed,
    #[serde(rename = "CANCELING")]
    Canceling,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "ERROR")]
    Error,
}

impl UserServiceState {
    /// 计入缓存数量的状态（正在准备或已可用）
    pub const COUNTABLE: [UserServiceState; 2] =
        [UserServiceState::Preparing, UserServiceState::Usable];

    /// 终态信息状态，处于这些状态的实例不再有进行中的操作
    pub const INFO: [UserServiceState; 3] = [
        UserServiceState::Removed,
        UserServiceState::Canceled,
        UserServiceState::Error,
    ];

    pub fn is_countable(&self) -> bool {
        Self::COUNTABLE.contains(self)
    }

    pub fn is_info(&self) -> bool {
        Self::INFO.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserServiceState::Preparing => "PREPARING",
            UserServiceState::Usable => "USABLE",
            UserServiceState::Removable => "REMOVABLE",
            UserServiceState::Removing => "REMOVING",
            UserServiceState::Removed => "REMOVED",
            UserServiceState::Canceling => "CANCELING",
            UserServiceState::Canceled => "CANCELED",
            UserServiceState::Error => "ERROR",
        }
    }
}

impl FromStr for UserServiceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARING" => Ok(UserServiceState::Preparing),
            "USABLE" => Ok(UserServiceState::Usable),
            "REMOVABLE" => Ok(UserServiceState::Removable),
            "REMOVING" => Ok(UserServiceState::Removing),
            "REMOVED" => Ok(UserServiceState::Removed),
            "CANCELING" => Ok(UserServiceState::Canceling),
            "CANCELED" => Ok(UserServiceState::Canceled),
            "ERROR" => Ok(UserServiceState::Error),
            _ => Err(format!("Invalid user service state: {s}")),
        }
    }
}

impl fmt::Display for UserServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(PoolState::Active),
            "REMOVABLE" => Ok(PoolState::Removable),
            "REMOVED" => Ok(PoolState::Removed),
            _ => Err(format!("Invalid pool state: {s}")),
        }
    }
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Active => "ACTIVE",
            PoolState::Removable => "REMOVABLE",
            PoolState::Removed => "REMOVED",
        }
    }
}

/// 服务池下的用户服务实例（缓存或已分配）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheItem {
    pub id: i64,
    pub pool_id: i64,
    pub publication_id: Option<i64>,
    pub level: CacheLevel,
    pub state: UserServiceState,
    pub creation_time: DateTime<Utc>,
    pub state_date: DateTime<Utc>,
}

impl CacheItem {
    pub fn new(
        pool_id: i64,
        publication_id: Option<i64>,
        level: CacheLevel,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            pool_id,
            publication_id,
            level,
            state: UserServiceState::Preparing,
            creation_time: now,
            state_date: now,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.level, CacheLevel::L1 | CacheLevel::L2)
    }
}

/// 通用键值缓存条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilityCacheEntry {
    pub owner: String,
    pub key: String,
    pub value: String,
    pub created: DateTime<Utc>,
    pub validity_seconds: i64,
}

impl UtilityCacheEntry {
    pub const DEFAULT_VALIDITY_SECONDS: i64 = 60;

    pub fn new(
        owner: &str,
        key: &str,
        value: String,
        validity_seconds: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            key: key.to_string(),
            value,
            created: now,
            validity_seconds,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.created + Duration::seconds(self.validity_seconds)
    }
}
