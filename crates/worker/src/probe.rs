use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 磁带服务器可用性探测
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn is_up(&self, server: &str) -> bool;
}

/// 只取完全限定名的第一段：`archive.nersc.gov` -> `archive`
pub fn short_server_name(server: &str) -> &str {
    server.split('.').next().unwrap_or(server)
}

const UP_STATES: &[&str] = &["Up", "active", "up", "degraded"];

#[derive(Debug, Deserialize)]
struct SystemStatus {
    status: String,
}

#[derive(Debug, Clone, Copy)]
struct CachedState {
    expires_at: Instant,
    up: bool,
}

/// 通过中心状态API查询服务器状态，每个结果缓存一段时间
pub struct HttpStatusProbe {
    client: reqwest::Client,
    status_url: String,
    server_names: HashMap<String, String>,
    cache_for: Duration,
    state: Mutex<HashMap<String, CachedState>>,
}

impl HttpStatusProbe {
    pub fn new(
        status_url: impl Into<String>,
        server_names: HashMap<String, String>,
        cache_for: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            status_url: status_url.into(),
            server_names,
            cache_for,
            state: Mutex::new(HashMap::new()),
        }
    }

    async fn query(&self, system: &str) -> bool {
        let url = format!("{}/{}", self.status_url.trim_end_matches('/'), system);
        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(system, status = %response.status(), "状态API返回错误");
                return false;
            }
            Err(e) => {
                warn!(system, error = %e, "查询状态API失败");
                return false;
            }
        };
        match response.json::<SystemStatus>().await {
            Ok(status) => UP_STATES.contains(&status.status.as_str()),
            Err(e) => {
                warn!(system, error = %e, "解析状态API响应失败");
                false
            }
        }
    }
}

#[async_trait]
impl ServiceProbe for HttpStatusProbe {
    async fn is_up(&self, server: &str) -> bool {
        let server = short_server_name(server);
        let Some(system) = self.server_names.get(server) else {
            debug!(server, "未知的磁带服务器");
            return false;
        };

        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(cached) = state.get(server) {
            if now < cached.expires_at {
                return cached.up;
            }
        }
        let up = self.query(system).await;
        state.insert(
            server.to_string(),
            CachedState {
                expires_at: now + self.cache_for,
                up,
            },
        );
        debug!(server, up, "磁带服务器状态已刷新");
        up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 返回固定状态的最小HTTP服务，记录请求次数
    async fn status_server(status: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let body = format!("{{\"name\":\"archive\",\"status\":\"{status}\"}}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn names() -> HashMap<String, String> {
        HashMap::from([
            ("archive".to_string(), "archive".to_string()),
            ("hpss".to_string(), "regent".to_string()),
        ])
    }

    #[test]
    fn test_short_server_name() {
        assert_eq!(short_server_name("archive.nersc.gov"), "archive");
        assert_eq!(short_server_name("hpss"), "hpss");
    }

    #[tokio::test]
    async fn test_degraded_counts_as_up_and_is_cached() {
        let (url, hits) = status_server("degraded").await;
        let probe = HttpStatusProbe::new(url, names(), Duration::from_secs(30));

        assert!(probe.is_up("archive.nersc.gov").await);
        assert!(probe.is_up("archive").await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_down_state_and_unknown_server() {
        let (url, hits) = status_server("down").await;
        let probe = HttpStatusProbe::new(url, names(), Duration::from_millis(0));

        assert!(!probe.is_up("hpss.nersc.gov").await);
        assert!(!probe.is_up("tape9").await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // 缓存过期后重新查询
        assert!(!probe.is_up("hpss").await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_api_means_down() {
        let probe = HttpStatusProbe::new("http://127.0.0.1:1", names(), Duration::from_secs(30));
        assert!(!probe.is_up("archive").await);
    }
}
