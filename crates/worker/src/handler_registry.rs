use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use jobqueue_domain::JobType;
use jobqueue_errors::JobQueueResult;

use crate::context::JobContext;

/// 作业处理器
///
/// 执行语义为至少一次：同一作业可能在崩溃恢复后被再次执行，处理器需自行保证幂等。
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;

    fn job_type(&self) -> JobType;

    /// 返回可重试错误时由重试策略决定重新排队或进入死信队列
    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> JobQueueResult<()>;
}

/// 按作业类型注册的处理器集合
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一类型的旧处理器会被替换
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type();
        if let Some(previous) = self.handlers.insert(job_type, handler.clone()) {
            warn!(
                "Replacing handler '{}' for job type {} with '{}'",
                previous.name(),
                job_type,
                handler.name()
            );
        } else {
            info!("Registered handler '{}' for job type {}", handler.name(), job_type);
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn supported_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler(JobType);

    #[async_trait]
    impl JobHandler for NoopHandler {
        fn name(&self) -> &str {
            "noop"
        }

        fn job_type(&self) -> JobType {
            self.0
        }

        async fn handle(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> JobQueueResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new()
            .with_handler(Arc::new(NoopHandler(JobType::Backtest)))
            .with_handler(Arc::new(NoopHandler(JobType::Migration)));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(JobType::Migration));
        assert_eq!(
            registry.supported_types(),
            vec![JobType::Migration, JobType::Backtest]
        );
        assert_eq!(registry.get(JobType::Backtest).unwrap().name(), "noop");
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler(JobType::Migration)));
        registry.register(Arc::new(NoopHandler(JobType::Migration)));
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(JobType::Backtest));
    }
}
