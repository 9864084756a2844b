//! 延迟任务类型注册表
//!
//! 延迟任务以 `kind` + JSON 参数的形式持久化。执行时按 `kind` 找到处理器，
//! 处理器自带执行所需的环境（仓储、服务提供者等），参数里只存标识。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// 可持久化的延迟任务参数
pub trait DelayedTask: Serialize + DeserializeOwned + Send + Sync {
    /// 稳定的类型标识，写入数据库，修改后旧任务将无法执行
    const KIND: &'static str;
}

/// 某一类延迟任务的执行器
#[async_trait]
pub trait DelayedTaskHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn execute(&self, payload: &str) -> BrokerResult<()>;
}

pub fn encode_payload<T: DelayedTask>(task: &T) -> BrokerResult<String> {
    Ok(serde_json::to_string(task)?)
}

pub fn decode_payload<T: DelayedTask>(payload: &str) -> BrokerResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        BrokerError::Serialization(format!("解析延迟任务 {} 的参数失败: {e}", T::KIND))
    })
}

#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn DelayedTaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn DelayedTaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: &str) -> BrokerResult<Arc<dyn DelayedTaskHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| BrokerError::TaskKindNotRegistered(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        target: i64,
    }

    impl DelayedTask for Ping {
        const KIND: &'static str = "ping";
    }

    struct PingHandler;

    #[async_trait]
    impl DelayedTaskHandler for PingHandler {
        fn kind(&self) -> &'static str {
            Ping::KIND
        }

        async fn execute(&self, payload: &str) -> BrokerResult<()> {
            let ping: Ping = decode_payload(payload)?;
            if ping.target < 0 {
                return Err(BrokerError::Internal("negative target".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_payload_codec() {
        let payload = encode_payload(&Ping { target: 7 }).unwrap();
        assert_eq!(decode_payload::<Ping>(&payload).unwrap(), Ping { target: 7 });
        assert!(matches!(
            decode_payload::<Ping>("not json"),
            Err(BrokerError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(PingHandler));

        let handler = registry.get("ping").unwrap();
        assert!(handler.execute(r#"{"target":1}"#).await.is_ok());
        assert!(handler.execute(r#"{"target":-1}"#).await.is_err());
        assert!(matches!(
            registry.get("pong"),
            Err(BrokerError::TaskKindNotRegistered(_))
        ));
    }
}
