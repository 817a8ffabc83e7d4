//! 磁带客户端（hsi/htar）封装与会话批处理
//!
//! hsi 每次建立会话的固定开销很高，因此多个逻辑请求通过 [`SessionQueue`]
//! 合并成一次调用，再把结果分发回各个调用方。

use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use archiver_domain::{ArchiverError, ArchiverResult};

use crate::command::{CommandRunner, CommandSpec};

pub const HSI_PROGRAM: &str = "hsi";
pub const HTAR_PROGRAM: &str = "htar";

/// 批量读取脚本的超时
pub const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 3);

/// 批量定位在输出中没有任何 `FILE` 行时的最大尝试次数
pub const LOCATE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct HsiClient {
    runner: Arc<dyn CommandRunner>,
}

impl HsiClient {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// 单文件写入磁带
    pub async fn put(&self, server: &str, local: &Path, remote: &str) -> ArchiverResult<()> {
        let spec = CommandSpec::new(HSI_PROGRAM).args([
            "-h".to_string(),
            server.to_string(),
            format!("put -p -P {} : {remote}", local.display()),
        ]);
        info!(server, remote, "hsi put");
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// 在 `working_dir` 中把当前目录打包成远端tar对象
    pub async fn htar_create(
        &self,
        server: &str,
        working_dir: &Path,
        tar_location: &str,
    ) -> ArchiverResult<()> {
        let spec = CommandSpec::new(HTAR_PROGRAM)
            .args([
                "-P".to_string(),
                "-h".to_string(),
                "-H".to_string(),
                format!("server={server}"),
                "-cf".to_string(),
                tar_location.to_string(),
                "-T".to_string(),
                "10".to_string(),
                ".".to_string(),
            ])
            .current_dir(working_dir);
        info!(server, tar_location, "htar 打包写入磁带");
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// 查询远端对象大小（`ls -1s` 输出的第一列）
    pub async fn remote_size(&self, server: &str, path: &str) -> ArchiverResult<u64> {
        let spec = CommandSpec::new(HSI_PROGRAM).args([
            "-P".to_string(),
            "-q".to_string(),
            "-h".to_string(),
            server.to_string(),
            format!("ls -1s {path}"),
        ]);
        let output = self.runner.run_checked(&spec).await?;
        output
            .stdout
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<u64>().ok())
            .ok_or_else(|| {
                ArchiverError::tool_failed(
                    HSI_PROGRAM,
                    output.exit_code,
                    format!("无法解析 {path} 的大小: {}", output.stdout.trim()),
                )
            })
    }

    /// 校验远端对象大小：`exact` 时要求相等，否则要求不小于期望值
    ///
    /// 结果可能来自hsi缓存，不代表已经落到磁带上。
    pub async fn verify(
        &self,
        server: &str,
        path: &str,
        expected: u64,
        exact: bool,
    ) -> ArchiverResult<()> {
        let actual = self.remote_size(server, path).await?;
        let ok = if exact {
            actual == expected
        } else {
            actual >= expected
        };
        if ok {
            debug!(path, actual, expected, "远端大小校验通过");
            Ok(())
        } else {
            Err(ArchiverError::VerificationFailed {
                path: path.to_string(),
                expected,
                actual,
            })
        }
    }

    /// 执行 `working_dir` 中的批量脚本：`hsi -h <server> "in <script>"`
    pub async fn run_script(
        &self,
        server: &str,
        working_dir: &Path,
        script_name: &str,
        timeout: Duration,
    ) -> ArchiverResult<()> {
        let spec = CommandSpec::new(HSI_PROGRAM)
            .args([
                "-h".to_string(),
                server.to_string(),
                format!("in {script_name}"),
            ])
            .current_dir(working_dir)
            .timeout(timeout);
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// 一次会话执行多行命令，返回标准输出
    ///
    /// 部分文件不存在时hsi也会返回非0退出码，因此这里不检查退出码。
    pub async fn session(&self, server: &str, lines: &[String]) -> ArchiverResult<String> {
        let mut script = lines.join("\n");
        script.push('\n');
        let spec = CommandSpec::new(HSI_PROGRAM)
            .args(["-P", "-q", "-h", server])
            .stdin(script);
        let output = self.runner.run(&spec).await?;
        Ok(output.stdout)
    }
}

/// 可以批量执行的会话
#[async_trait]
pub trait BatchSession: Send + Sync {
    type Request: Clone + Eq + Hash + Send + Sync;
    type Response: Clone + Send + Sync;

    /// 一次调用处理全部请求；没有得到结果的请求不出现在返回表中
    async fn execute(
        &self,
        requests: &[Self::Request],
    ) -> ArchiverResult<HashMap<Self::Request, Self::Response>>;
}

/// 一次 `flush` 的结果
#[derive(Debug)]
pub struct FlushOutcome<R, I> {
    pub resolved: Vec<(I, R)>,
    pub unresolved: Vec<I>,
}

/// 请求/响应队列：`queue` 积攒请求，`flush` 合并成一次会话调用
pub struct SessionQueue<S: BatchSession, I> {
    session: S,
    pending: Vec<(S::Request, I)>,
}

impl<S: BatchSession, I: Send> SessionQueue<S, I> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            pending: Vec::new(),
        }
    }

    pub fn queue(&mut self, request: S::Request, info: I) {
        self.pending.push((request, info));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 相同请求只发送一次，结果分发给所有排队者
    pub async fn flush(&mut self) -> ArchiverResult<FlushOutcome<S::Response, I>> {
        let pending = std::mem::take(&mut self.pending);
        let mut unique: Vec<S::Request> = Vec::new();
        for (request, _) in &pending {
            if !unique.contains(request) {
                unique.push(request.clone());
            }
        }
        let responses = if unique.is_empty() {
            HashMap::new()
        } else {
            self.session.execute(&unique).await?
        };

        let mut outcome = FlushOutcome {
            resolved: Vec::new(),
            unresolved: Vec::new(),
        };
        for (request, info) in pending {
            match responses.get(&request) {
                Some(response) => outcome.resolved.push((info, response.clone())),
                None => outcome.unresolved.push(info),
            }
        }
        Ok(outcome)
    }
}

/// 文件在磁带卷上的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeLocation {
    pub volume: String,
    pub position_a: i64,
    pub position_b: i64,
}

/// `ls -P -N` 批量定位会话
pub struct HsiLocateSession {
    hsi: HsiClient,
    server: String,
}

impl HsiLocateSession {
    pub fn new(hsi: HsiClient, server: impl Into<String>) -> Self {
        Self {
            hsi,
            server: server.into(),
        }
    }
}

/// 解析一行 `FILE\t<path>\t...\t<a>+<b>\t<volume>...`，卷号只取前6个字符
pub fn parse_locate_line(line: &str) -> Option<(String, TapeLocation)> {
    if !line.contains("FILE\t") {
        return None;
    }
    let fields: Vec<&str> = line.split('\t').collect();
    let tape_file = fields.get(1)?.to_string();
    let (a, b) = fields.get(4)?.split_once('+')?;
    let volume: String = fields.get(5)?.chars().take(6).collect();
    Some((
        tape_file,
        TapeLocation {
            volume,
            position_a: a.trim().parse().ok()?,
            position_b: b.trim().parse().ok()?,
        },
    ))
}

#[async_trait]
impl BatchSession for HsiLocateSession {
    type Request = String;
    type Response = TapeLocation;

    async fn execute(
        &self,
        requests: &[String],
    ) -> ArchiverResult<HashMap<String, TapeLocation>> {
        let lines: Vec<String> = requests.iter().map(|f| format!("ls -P -N {f}")).collect();
        let mut output = String::new();
        for attempt in 1..=LOCATE_ATTEMPTS {
            output = self.hsi.session(&self.server, &lines).await?;
            if output.contains("FILE") {
                break;
            }
            warn!(server = %self.server, attempt, "hsi 批量定位没有返回任何FILE行");
        }
        info!(server = %self.server, files = requests.len(), "hsi 批量定位完成");
        Ok(output.lines().filter_map(parse_locate_line).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_locate_line() {
        let line = "FILE\t/hpss/backup_2026/a.fastq.1\t1024\t1024\t4501+12\tAG1234L6\t0\t1\t";
        let (file, location) = parse_locate_line(line).unwrap();
        assert_eq!(file, "/hpss/backup_2026/a.fastq.1");
        assert_eq!(
            location,
            TapeLocation {
                volume: "AG1234".to_string(),
                position_a: 4501,
                position_b: 12,
            }
        );
        assert!(parse_locate_line("*** HPSS_ENOENT /hpss/missing").is_none());
        assert!(parse_locate_line("FILE\t/short").is_none());
    }

    struct EchoSession {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchSession for EchoSession {
        type Request = String;
        type Response = usize;

        async fn execute(&self, requests: &[String]) -> ArchiverResult<HashMap<String, usize>> {
            self.calls.lock().unwrap().push(requests.to_vec());
            Ok(requests
                .iter()
                .filter(|r| !r.starts_with("missing"))
                .map(|r| (r.clone(), r.len()))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_session_queue_batches_and_fans_out() {
        let mut queue = SessionQueue::new(EchoSession {
            calls: Mutex::new(Vec::new()),
        });
        queue.queue("abc".to_string(), 1);
        queue.queue("missing-x".to_string(), 2);
        queue.queue("abc".to_string(), 3);
        queue.queue("de".to_string(), 4);
        assert_eq!(queue.len(), 4);

        let outcome = queue.flush().await.unwrap();
        assert_eq!(outcome.resolved, vec![(1, 3), (3, 3), (4, 2)]);
        assert_eq!(outcome.unresolved, vec![2]);
        assert!(queue.is_empty());

        let calls = queue.session.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["abc", "missing-x", "de"]);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_call_session() {
        let mut queue: SessionQueue<EchoSession, u32> = SessionQueue::new(EchoSession {
            calls: Mutex::new(Vec::new()),
        });
        let outcome = queue.flush().await.unwrap();
        assert!(outcome.resolved.is_empty());
        assert!(queue.session.calls.lock().unwrap().is_empty());
    }
}
