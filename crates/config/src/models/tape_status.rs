use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigResult;

/// 磁带服务器状态API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TapeStatusConfig {
    pub status_url: String,
    pub cache_seconds: u64,
    /// 服务器短名 -> 状态API中的系统名
    pub server_names: HashMap<String, String>,
}

impl Default for TapeStatusConfig {
    fn default() -> Self {
        Self {
            status_url: "https://api.nersc.gov/api/v1.2/status".to_string(),
            cache_seconds: 30,
            server_names: HashMap::from([
                ("hpss".to_string(), "regent".to_string()),
                ("archive".to_string(), "archive".to_string()),
            ]),
        }
    }
}

impl ConfigValidator for TapeStatusConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_url(&self.status_url, "tape_status.status_url")?;
        ValidationUtils::validate_seconds(self.cache_seconds, "tape_status.cache_seconds", 3600)?;
        for (server, system) in &self.server_names {
            ValidationUtils::validate_not_empty(server, "tape_status.server_names")?;
            ValidationUtils::validate_not_empty(system, "tape_status.server_names")?;
        }
        Ok(())
    }
}
