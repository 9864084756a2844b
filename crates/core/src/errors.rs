use thiserror::Error;

/// 代理后台错误类型定义
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("服务池未找到: {id}")]
    PoolNotFound { id: i64 },

    #[error("发布未找到: {id}")]
    PublicationNotFound { id: i64 },

    #[error("缓存实例未找到: {id}")]
    CacheItemNotFound { id: i64 },

    #[error("未注册的作业类型: {0}")]
    JobKindNotRegistered(String),

    #[error("未注册的延迟任务类型: {0}")]
    TaskKindNotRegistered(String),

    #[error("已有发布正在进行: {0}")]
    AlreadyPublishing(String),

    #[error("无法取消发布: {0}")]
    CannotCancel(String),

    #[error("无法撤销发布: {0}")]
    CannotUnpublish(String),

    #[error("服务池 {pool_id} 已达到最大部署数 {max}")]
    MaxServicesReached { pool_id: i64, max: u32 },

    #[error("服务提供者错误: {0}")]
    Provider(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl BrokerError {
    /// 领域冲突，直接报告给调用方，不产生任何状态修改
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BrokerError::AlreadyPublishing(_)
                | BrokerError::CannotCancel(_)
                | BrokerError::CannotUnpublish(_)
        )
    }

    /// 存储层的瞬时错误，可有限次重试
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            BrokerError::DatabaseOperation(_) => true,
            _ => false,
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        BrokerError::Provider(message.into())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}
