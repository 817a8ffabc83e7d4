use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use archiver_dispatcher::{LostTaskMonitor, LostTaskMonitorConfig, Queue, QueueCallbacks, TaskManager};
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Default)]
struct LostLog(StdMutex<Vec<Value>>);

impl QueueCallbacks for LostLog {
    fn on_lost(&self, data: &Value) {
        self.0.lock().unwrap().push(data.clone());
    }
}

fn manager_with_claims(log: Arc<LostLog>) -> TaskManager {
    let mut manager =
        TaskManager::new("jgi").with_staleness_threshold(chrono::Duration::milliseconds(1));
    let mut pull = Queue::new("pull", 4).with_callbacks(log);
    pull.add(json!([{"pull_queue_id": 11}]), &["hsi_1".to_string()], true);
    manager.set_queues(vec![pull]);
    manager.heartbeat("dead");
    manager
        .get_task(&["hsi_1".to_string()], &["pull".to_string()], None, "dead", true)
        .expect("task should be claimed");
    manager
}

#[test]
fn test_lost_task_monitor_config_default() {
    let config = LostTaskMonitorConfig::default();
    assert_eq!(config.check_interval, Duration::from_secs(60));
}

#[tokio::test]
async fn test_run_once_reclaims_stale_service() {
    let log = Arc::new(LostLog::default());
    let manager = Arc::new(Mutex::new(manager_with_claims(log.clone())));
    let monitor = LostTaskMonitor::new(manager.clone(), None);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let reclaimed = monitor.run_once().await;

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].records, Some(1));
    assert_eq!(*log.0.lock().unwrap(), vec![json!([{"pull_queue_id": 11}])]);
    assert_eq!(manager.lock().await.in_flight_count(), 0);
    assert!(monitor.run_once().await.is_empty());
}

#[tokio::test]
async fn test_monitor_loop_start_and_stop() {
    let log = Arc::new(LostLog::default());
    let manager = Arc::new(Mutex::new(manager_with_claims(log.clone())));
    let monitor = Arc::new(LostTaskMonitor::new(
        manager.clone(),
        Some(LostTaskMonitorConfig {
            check_interval: Duration::from_millis(10),
        }),
    ));

    let handle = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.start().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(monitor.is_running().await);
    monitor.stop().await;
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("monitor loop should exit")
        .unwrap();

    assert_eq!(log.0.lock().unwrap().len(), 1);
    assert_eq!(manager.lock().await.in_flight_count(), 0);
}
