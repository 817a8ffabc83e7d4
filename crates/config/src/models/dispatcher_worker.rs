use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// Worker能执行的全部任务名称
pub const KNOWN_TASKS: &[&str] = &[
    "ingest", "copy", "md5", "put", "pull", "prep", "tar", "general", "purge", "delete",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub staleness_threshold_seconds: u64,
    pub monitor_interval_seconds: u64,
    /// 每个特性同时占用的上限，未列出的特性不限制
    #[serde(default)]
    pub max_resources: HashMap<String, usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_seconds: 600,
            monitor_interval_seconds: 60,
            max_resources: HashMap::new(),
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.staleness_threshold_seconds,
            "dispatcher.staleness_threshold_seconds",
            86400,
        )?;
        ValidationUtils::validate_seconds(
            self.monitor_interval_seconds,
            "dispatcher.monitor_interval_seconds",
            3600,
        )?;
        if self.monitor_interval_seconds > self.staleness_threshold_seconds {
            return Err(ConfigError::Validation(
                "dispatcher.monitor_interval_seconds must not exceed staleness_threshold_seconds"
                    .to_string(),
            ));
        }
        if let Some((feature, _)) = self.max_resources.iter().find(|(_, max)| **max == 0) {
            return Err(ConfigError::Validation(format!(
                "dispatcher.max_resources.{feature} must be greater than 0"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub service_name: String,
    pub division: String,
    pub threads: usize,
    pub features: Vec<String>,
    pub tasks: Vec<String>,
    /// 服务运行的秒数，0表示一直运行
    pub run_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    #[serde(default)]
    pub debug: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: "dt_service".to_string(),
            division: "jgi".to_string(),
            threads: 1,
            features: Vec::new(),
            tasks: KNOWN_TASKS.iter().map(|t| t.to_string()).collect(),
            run_seconds: 36000,
            heartbeat_interval_seconds: 240,
            debug: false,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.service_name, "worker.service_name")?;
        ValidationUtils::validate_not_empty(&self.division, "worker.division")?;
        ValidationUtils::validate_count(self.threads, "worker.threads", 256)?;
        ValidationUtils::validate_seconds(
            self.heartbeat_interval_seconds,
            "worker.heartbeat_interval_seconds",
            3600,
        )?;

        if self.tasks.is_empty() {
            return Err(ConfigError::Validation(
                "worker.tasks cannot be empty".to_string(),
            ));
        }
        for task in &self.tasks {
            if !KNOWN_TASKS.contains(&task.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Unknown task: {task}. Valid tasks: {KNOWN_TASKS:?}"
                )));
            }
        }
        for feature in &self.features {
            ValidationUtils::validate_not_empty(feature, "worker.features")?;
        }
        Ok(())
    }
}
