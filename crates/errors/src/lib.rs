use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("源文件不存在: {path}")]
    SourceMissing { path: String },
    #[error("远端校验失败: {path} 大小 {actual} 与期望 {expected} 不符")]
    VerificationFailed {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("外部工具 {tool} 执行失败 (退出码 {code:?}): {message}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        message: String,
    },
    #[error("资源不可用: {resource}")]
    ResourceUnavailable { resource: String },
    #[error("备份服务配置错误: {0}")]
    ServiceConfiguration(String),
    #[error("控制面请求失败: {0}")]
    ControlPlane(String),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("未知的任务类型: {0}")]
    UnknownTask(String),
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ArchiverResult<T> = Result<T, ArchiverError>;

impl ArchiverError {
    pub fn source_missing<S: Into<String>>(path: S) -> Self {
        Self::SourceMissing { path: path.into() }
    }
    pub fn tool_failed<T: Into<String>, M: Into<String>>(
        tool: T,
        code: Option<i32>,
        message: M,
    ) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            code,
            message: message.into(),
        }
    }
    pub fn resource_unavailable<S: Into<String>>(resource: S) -> Self {
        Self::ResourceUnavailable {
            resource: resource.into(),
        }
    }
    pub fn service_config<S: Into<String>>(msg: S) -> Self {
        Self::ServiceConfiguration(msg.into())
    }
    pub fn control_plane<S: Into<String>>(msg: S) -> Self {
        Self::ControlPlane(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn is_resource_unavailable(&self) -> bool {
        matches!(self, ArchiverError::ResourceUnavailable { .. })
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArchiverError::ResourceUnavailable { .. } | ArchiverError::ControlPlane(_)
        )
    }
}

impl From<serde_json::Error> for ArchiverError {
    fn from(err: serde_json::Error) -> Self {
        ArchiverError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ArchiverError {
    fn from(err: anyhow::Error) -> Self {
        ArchiverError::Internal(err.to_string())
    }
}
