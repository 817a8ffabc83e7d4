//! 外部工具调用
//!
//! 所有子进程（hsi、htar、tar、rsync、md5sum）都经由 [`CommandRunner`] 启动，
//! 测试中可以替换为脚本化的实现。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use archiver_domain::{ArchiverError, ArchiverResult};

/// 一次子进程调用的完整描述
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 用于日志的命令行（不含环境变量，避免泄露口令）
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// 退出码非0时转换为 [`ArchiverError::ToolFailed`]
    pub fn check(self, tool: &str) -> ArchiverResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            let message = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(ArchiverError::tool_failed(tool, self.exit_code, message))
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// 运行命令直到结束；非0退出码不视为错误，由调用方决定
    async fn run(&self, spec: &CommandSpec) -> ArchiverResult<CommandOutput>;

    /// 运行命令并要求退出码为0
    async fn run_checked(&self, spec: &CommandSpec) -> ArchiverResult<CommandOutput> {
        self.run(spec).await?.check(&spec.program)
    }
}

/// 基于 `tokio::process` 的实现
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> ArchiverResult<CommandOutput> {
        let start_time = Instant::now();
        debug!(command = %spec.display(), "启动外部命令");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ArchiverError::tool_failed(&spec.program, None, format!("启动命令失败: {e}"))
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArchiverError::Internal("无法获取stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ArchiverError::Internal("无法获取stderr".to_string()))?;

        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (out_read, err_read) =
                tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            out_read?;
            err_read?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, out, err) = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(command = %spec.display(), timeout_seconds = limit.as_secs(), "外部命令超时");
                    return Err(ArchiverError::tool_failed(
                        &spec.program,
                        None,
                        format!("命令执行超时 ({}秒)", limit.as_secs()),
                    ));
                }
            },
            None => collect.await?,
        };

        let output = CommandOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        };
        info!(
            command = %spec.program,
            exit_code = ?output.exit_code,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "外部命令执行完成"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_command_with_stdin_and_env() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "cat; printf \"$GREETING\""])
            .stdin("ls -P -N /a\n")
            .env("GREETING", "hello");
        let output = runner.run_checked(&spec).await.unwrap();
        assert_eq!(output.stdout, "ls -P -N /a\nhello");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.exit_code, Some(3));

        let err = runner.run_checked(&spec).await.unwrap_err();
        match err {
            ArchiverError::ToolFailed { tool, code, message } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, Some(3));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_and_spawn_failure() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50));
        assert!(matches!(
            runner.run(&spec).await,
            Err(ArchiverError::ToolFailed { code: None, .. })
        ));

        let missing = CommandSpec::new("definitely-not-a-real-archiver-tool");
        assert!(runner.run(&missing).await.is_err());
    }

    #[test]
    fn test_display_omits_environment() {
        let spec = CommandSpec::new("rsync")
            .args(["-aL", "--stats"])
            .env("RSYNC_PASSWORD", "secret");
        assert_eq!(spec.display(), "rsync -aL --stats");
    }
}
