//! 测试数据构造器

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use archiver_domain::{
    BackupRecordStatus, BackupService, BackupServiceType, ControlledVocabulary, FileStatus,
    QueueStatus, TapeSettings, Task, VocabularyTables,
};
use archiver_worker::HandlerContext;

use crate::mocks::{MockCommandRunner, MockControlPlane, StaticProbe};

/// 构造已领取的任务
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(task_name: &str) -> Self {
        Self {
            task: Task {
                task_id: "T0000001".to_string(),
                task_name: task_name.to_string(),
                data: serde_json::json!({}),
                required_features: vec![],
                service_id: "1".to_string(),
                created_at: Utc::now(),
                division: "jgi".to_string(),
                records: None,
            },
        }
    }

    pub fn with_id(mut self, task_id: &str) -> Self {
        self.task.task_id = task_id.to_string();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.task.data = data;
        self
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.task.required_features = features.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

pub fn hpss_service(backup_service_id: i64, server: &str, default_path: &str) -> BackupService {
    BackupService {
        backup_service_id,
        name: format!("hpss_{backup_service_id}"),
        service_type: BackupServiceType::Hpss,
        server: Some(server.to_string()),
        default_path: default_path.to_string(),
    }
}

pub fn globus_service(backup_service_id: i64, name: &str, default_path: &str) -> BackupService {
    BackupService {
        backup_service_id,
        name: name.to_string(),
        service_type: BackupServiceType::Globus,
        server: None,
        default_path: default_path.to_string(),
    }
}

/// 以 `temp_dir` 为临时目录、其余取默认值的站点配置
pub fn tape_settings(temp_dir: &Path) -> TapeSettings {
    TapeSettings {
        temp_dir: temp_dir.to_path_buf(),
        ..Default::default()
    }
}

/// 与 [`ControlledVocabulary::sequential`] 编号一致的原始词表
pub fn vocabulary_tables() -> VocabularyTables {
    fn numbered<T: ToString>(names: &[T]) -> std::collections::HashMap<String, i64> {
        names
            .iter()
            .zip(1..)
            .map(|(name, id)| (name.to_string(), id))
            .collect()
    }
    VocabularyTables {
        file_status: numbered(FileStatus::ALL),
        backup_record_status: numbered(BackupRecordStatus::ALL),
        queue_status: numbered(QueueStatus::ALL),
    }
}

/// 处理器测试环境：替身实例保留在外部以便断言
pub struct TestContext {
    pub control_plane: MockControlPlane,
    pub runner: MockCommandRunner,
    pub probe: StaticProbe,
    pub ctx: Arc<HandlerContext>,
}

impl TestContext {
    pub fn new(
        control_plane: MockControlPlane,
        runner: MockCommandRunner,
        settings: TapeSettings,
    ) -> Self {
        Self::with_probe(control_plane, runner, StaticProbe::new(), settings)
    }

    pub fn with_probe(
        control_plane: MockControlPlane,
        runner: MockCommandRunner,
        probe: StaticProbe,
        settings: TapeSettings,
    ) -> Self {
        let ctx = HandlerContext::new(
            Arc::new(control_plane.clone()),
            Arc::new(runner.clone()),
            Arc::new(probe.clone()),
            Arc::new(settings),
            Arc::new(ControlledVocabulary::sequential()),
            "jgi",
        );
        Self {
            control_plane,
            runner,
            probe,
            ctx: Arc::new(ctx),
        }
    }

    pub fn vocabulary(&self) -> &ControlledVocabulary {
        &self.ctx.vocabulary
    }
}
