use crate::{ConfigError, ConfigResult};

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
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(
        timeout_seconds: u64,
        field_name: &str,
        max: u64,
    ) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate that a count is reasonable
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate that a URL has a protocol and uses one of the allowed schemes
    pub fn validate_url(url: &str, field_name: &str, schemes: &[&str]) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;

        let Some((scheme, _)) = url.split_once("://") else {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        };
        if !schemes.contains(&scheme) {
            return Err(ConfigError::Validation(format!(
                "{field_name} must use one of the schemes {schemes:?}, got {scheme}"
            )));
        }
        Ok(())
    }

    /// File extension without a leading dot, e.g. `xdce`
    pub fn validate_extension(extension: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(extension, field_name)?;
        if extension.starts_with('.') || extension.contains('/') {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be a bare extension without '.' or '/'"
            )));
        }
        Ok(())
    }
}
