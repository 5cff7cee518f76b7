use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use jobqueue_domain::JobType;
use jobqueue_errors::{JobQueueError, JobQueueResult};

use crate::context::JobContext;
use crate::handler_registry::{HandlerRegistry, JobHandler};

/// 模拟处理器识别的载荷字段，其余字段原样忽略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationParams {
    /// 前N次尝试在第一个工作单元后失败
    #[serde(default)]
    pub fail_attempts: u32,
    #[serde(default)]
    pub always_fail: bool,
    /// 覆盖每个工作单元的耗时
    #[serde(default)]
    pub step_delay_ms: Option<u64>,
}

/// 迁移与回测的模拟处理器
///
/// 真实的数据读写与回测计算由外部处理器提供，这里按固定步长推进进度，
/// 每个工作单元都经过依赖熔断器，并在单元之间检查取消标记。
pub struct SimulatedHandler {
    name: String,
    job_type: JobType,
    dependency: String,
    step: u8,
    step_delay: Duration,
}

impl SimulatedHandler {
    pub const PROGRESS_STEP: u8 = 20;

    pub fn migration(step_delay: Duration) -> Self {
        Self {
            name: "simulated-migration".to_string(),
            job_type: JobType::Migration,
            dependency: "database".to_string(),
            step: Self::PROGRESS_STEP,
            step_delay,
        }
    }

    pub fn backtest(step_delay: Duration) -> Self {
        Self {
            name: "simulated-backtest".to_string(),
            job_type: JobType::Backtest,
            dependency: "broker".to_string(),
            step: Self::PROGRESS_STEP,
            step_delay,
        }
    }

    fn unit_label(&self) -> &'static str {
        match self.job_type {
            JobType::Migration => "迁移批次",
            JobType::Backtest => "回测窗口",
        }
    }
}

#[async_trait]
impl JobHandler for SimulatedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> JobQueueResult<()> {
        let params: SimulationParams = if payload.is_null() {
            SimulationParams::default()
        } else {
            serde_json::from_value(payload.clone()).map_err(|e| {
                JobQueueError::validation_error(format!("解析{}作业参数失败: {e}", self.job_type))
            })?
        };
        let step_delay = params
            .step_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.step_delay);
        let units = 100u8.div_ceil(self.step);

        info!(
            job_id = %ctx.job_id(),
            attempt = ctx.attempt(),
            handler = %self.name,
            "开始执行模拟作业"
        );

        for unit in 1..=units {
            ctx.check_cancelled().await?;

            ctx.guard(&self.dependency, || async {
                sleep(step_delay).await;
                Ok(())
            })
            .await?;

            if params.always_fail || ctx.attempt() <= params.fail_attempts {
                warn!(job_id = %ctx.job_id(), attempt = ctx.attempt(), "模拟作业失败");
                return Err(JobQueueError::handler(format!(
                    "simulated transient failure on attempt {}",
                    ctx.attempt()
                )));
            }

            let progress = unit.saturating_mul(self.step).min(100);
            ctx.report_progress(progress, format!("{} {}/{}", self.unit_label(), unit, units))
                .await?;
        }

        Ok(())
    }
}

/// 注册两种模拟处理器
pub fn simulated_registry(step_delay: Duration) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler(std::sync::Arc::new(SimulatedHandler::migration(step_delay)))
        .with_handler(std::sync::Arc::new(SimulatedHandler::backtest(step_delay)))
}
