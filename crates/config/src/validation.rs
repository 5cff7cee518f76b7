use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 86400 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 86400"
            )));
        }
        Ok(())
    }

    /// Validate that a count is within (0, max]
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate that a ratio lies in (0.0, 1.0]
    pub fn validate_ratio(value: f64, field_name: &str) -> ConfigResult<()> {
        if !(value > 0.0 && value <= 1.0) {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be in (0.0, 1.0], got {value}"
            )));
        }
        Ok(())
    }

    /// Validate that a URL has a valid format
    pub fn validate_url(url: &str, field_name: &str) -> ConfigResult<()> {
        if url.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }

        if !url.contains("://") {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        }

        Ok(())
    }
}
