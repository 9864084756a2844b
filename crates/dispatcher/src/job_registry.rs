use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use broker_core::{BrokerError, BrokerResult};

/// 周期作业的业务逻辑
#[async_trait]
pub trait Job: Send + Sync {
    /// 执行一次；返回的错误只记录日志，作业在下一个周期照常执行
    async fn run(&self) -> BrokerResult<()>;
}

/// 作业类型到实现的映射
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, job: Arc<dyn Job>) {
        self.jobs.insert(kind.to_string(), job);
    }

    pub fn get(&self, kind: &str) -> BrokerResult<Arc<dyn Job>> {
        self.jobs
            .get(kind)
            .cloned()
            .ok_or_else(|| BrokerError::JobKindNotRegistered(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.jobs.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopJob;

    #[async_trait]
    impl Job for NoopJob {
        async fn run(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = JobRegistry::new();
        registry.register("noop", Arc::new(NoopJob));

        assert!(registry.contains("noop"));
        assert!(registry.get("noop").unwrap().run().await.is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(BrokerError::JobKindNotRegistered(kind)) if kind == "missing"
        ));
        assert_eq!(registry.kinds(), vec!["noop"]);
    }
}
