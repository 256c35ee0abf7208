use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validation::ConfigValidator;

/// 存储调用的有界重试参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub storage_max_retries: u32,
    pub storage_base_delay_ms: u64,
    pub storage_max_delay_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            storage_max_retries: 3,
            storage_base_delay_ms: 100,
            storage_max_delay_ms: 5_000,
        }
    }
}

impl ResilienceConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.storage_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.storage_max_delay_ms)
    }
}

impl ConfigValidator for ResilienceConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.storage_max_retries > 10 {
            return Err(crate::ConfigError::Validation(
                "resilience.storage_max_retries must be less than or equal to 10".to_string(),
            ));
        }
        if self.storage_base_delay_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "resilience.storage_base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.storage_max_delay_ms < self.storage_base_delay_ms {
            return Err(crate::ConfigError::Validation(
                "resilience.storage_max_delay_ms must not be less than storage_base_delay_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
