use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            _ => Err(format!("Invalid store backend: {s}. Valid options: memory, redis")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// 所有Redis键的前缀，为空时不加前缀
    pub key_prefix: String,
    pub connection_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            connection_timeout_seconds: 10,
        }
    }
}

impl ConfigValidator for StoreConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.backend == StoreBackend::Redis {
            ValidationUtils::validate_url(&self.redis_url, "store.redis_url")?;
            if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://")
            {
                return Err(crate::ConfigError::Validation(
                    "store.redis_url must start with redis:// or rediss://".to_string(),
                ));
            }
        }
        ValidationUtils::validate_timeout_seconds(
            self.connection_timeout_seconds,
            "store.connection_timeout_seconds",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_validation() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.backend = StoreBackend::Redis;
        invalid.redis_url = "http://localhost:6379".to_string();
        assert!(invalid.validate().is_err());

        let mut redis = config;
        redis.backend = StoreBackend::Redis;
        assert!(redis.validate().is_ok());
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("redis".parse::<StoreBackend>(), Ok(StoreBackend::Redis));
        assert_eq!("Memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }
}
