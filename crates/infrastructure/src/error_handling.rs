//! 仓储操作的错误上下文
//!
//! 数据库错误在返回前附带实体与操作信息写入日志，错误本身保持 `sqlx::Error`
//! 以便调用方判断是否可重试。

use std::fmt;

use broker_core::BrokerError;
use sqlx::Error as SqlxError;
use tracing::error;

#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    Claim,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "统计"),
            RepositoryOperation::Claim => write!(f, "认领"),
        }
    }
}

/// 一次仓储操作的上下文
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: RepositoryOperation,
    pub entity: &'static str,
    pub entity_id: Option<String>,
}

impl OperationContext {
    pub fn new(operation: RepositoryOperation, entity: &'static str) -> Self {
        Self {
            operation,
            entity,
            entity_id: None,
        }
    }

    pub fn with_id(mut self, id: impl fmt::Display) -> Self {
        self.entity_id = Some(id.to_string());
        self
    }

    pub fn entity_description(&self) -> String {
        match &self.entity_id {
            Some(id) => format!("{} ({})", self.entity, id),
            None => self.entity.to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    pub fn database_error(context: OperationContext, error: SqlxError) -> BrokerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation;

        match &error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some(constraint) => error!(
                    error = %error,
                    constraint = constraint,
                    "{}{}时发生数据库约束冲突",
                    operation_desc,
                    entity_desc
                ),
                None => error!(error = %error, "{}{}时发生数据库错误", operation_desc, entity_desc),
            },
            SqlxError::PoolClosed => error!("{}{}时数据库连接池已关闭", operation_desc, entity_desc),
            SqlxError::PoolTimedOut => error!("{}{}时数据库连接池超时", operation_desc, entity_desc),
            _ => error!(error = %error, "{}{}时发生数据库错误", operation_desc, entity_desc),
        }

        BrokerError::Database(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_description() {
        let context = OperationContext::new(RepositoryOperation::Update, "发布").with_id(7);
        assert_eq!(context.entity_description(), "发布 (7)");
        assert_eq!(
            OperationContext::new(RepositoryOperation::Read, "作业").entity_description(),
            "作业"
        );
    }

    #[test]
    fn test_database_error_keeps_source() {
        let context = OperationContext::new(RepositoryOperation::Claim, "延迟任务");
        let err = RepositoryErrorHelpers::database_error(context, SqlxError::PoolTimedOut);
        assert!(matches!(err, BrokerError::Database(SqlxError::PoolTimedOut)));
        assert!(err.is_retryable());
    }
}
