use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// 控制面REST服务的连接参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub url: String,
    /// 存放访问令牌的环境变量名
    pub token_env_var: String,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            token_env_var: "ARCHIVER_TOKEN".to_string(),
            request_timeout_seconds: 300,
            max_retries: 10,
            retry_delay_seconds: 5,
        }
    }
}

impl ControlPlaneConfig {
    /// 从配置的环境变量中读取访问令牌
    pub fn token(&self) -> ConfigResult<String> {
        std::env::var(&self.token_env_var).map_err(|_| {
            ConfigError::Environment(format!(
                "{} environment variable not set",
                self.token_env_var
            ))
        })
    }
}

impl ConfigValidator for ControlPlaneConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_url(&self.url, "control_plane.url")?;
        ValidationUtils::validate_not_empty(&self.token_env_var, "control_plane.token_env_var")?;
        ValidationUtils::validate_seconds(
            self.request_timeout_seconds,
            "control_plane.request_timeout_seconds",
            3600,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_validation() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.url = "localhost:8080".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.request_timeout_seconds = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_missing_token_variable() {
        let config = ControlPlaneConfig {
            token_env_var: "ARCHIVER_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.token(), Err(ConfigError::Environment(_))));
    }
}
