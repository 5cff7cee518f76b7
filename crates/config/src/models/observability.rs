use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
    pub sample_interval_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "0.0.0.0:9091".to_string(),
            sample_interval_seconds: 15,
        }
    }
}

impl ConfigValidator for MetricsConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.enabled {
            self.listen_address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| {
                    crate::ConfigError::Validation(format!(
                        "metrics.listen_address is invalid: {e}"
                    ))
                })?;
        }
        ValidationUtils::validate_timeout_seconds(
            self.sample_interval_seconds,
            "metrics.sample_interval_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {s}. Valid formats: pretty, json")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ConfigValidator for LoggingConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(crate::ConfigError::Validation(format!(
                "Invalid log level: {}. Valid levels: {:?}",
                self.level, valid_levels
            )));
        }
        Ok(())
    }
}
