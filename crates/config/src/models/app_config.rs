use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    observability::{LoggingConfig, MetricsConfig},
    retry::RetryConfig,
    store::StoreConfig,
    worker::{HeartbeatConfig, JobsConfig, WorkerConfig},
};
use crate::circuit_breaker::CircuitBreakerSettings;
use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub jobs: JobsConfig,
    pub retry: RetryConfig,
    pub heartbeat: HeartbeatConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("加载默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/jobqueue.toml", "jobqueue.toml", "/etc/jobqueue/config.toml"];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBQUEUE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.job_types")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.store.validate()?;
        self.worker.validate()?;
        self.jobs.validate()?;
        self.retry.validate()?;
        self.heartbeat.validate()?;
        self.circuit_breaker.validate()?;
        self.metrics.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}
