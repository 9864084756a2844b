pub mod config;
pub mod errors;

pub use config::models::{
    AppConfig, CacheConfig, DatabaseConfig, ObservabilityConfig, SchedulerConfig,
};
pub use errors::*;

/// 统一的Result类型
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
