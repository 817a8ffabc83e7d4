use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use archiver_domain::{QueueSnapshot, ServiceInfo, Task};

use crate::queue::{Queue, QueueItem};

/// 默认心跳超时（秒）
pub const DEFAULT_STALENESS_THRESHOLD_SECONDS: i64 = 600;

struct InFlightTask {
    task: Task,
    queue_index: usize,
    item: QueueItem,
}

/// 调度器的完整状态，供运维查看
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub tasks: HashMap<String, QueueSnapshot>,
    pub current_used_resources: HashMap<String, usize>,
    pub current_tasks: HashMap<String, Task>,
    pub services: HashMap<String, ServiceInfo>,
}

/// 任务管理器
///
/// 持有按优先级排序的队列，保证每个逻辑任务同一时间至多被一个Worker领取，
/// 并通过心跳检测失联的服务、回收其在途任务。所有方法都是同步的，
/// 调用方负责串行化访问。
pub struct TaskManager {
    division: String,
    queues: Vec<Queue>,
    queue_index: HashMap<String, usize>,
    /// 允许任务集合 -> 各优先级层的队列下标
    level_cache: HashMap<String, Vec<Vec<usize>>>,
    /// 允许任务集合 -> 各优先级层的轮询游标
    level_cursors: HashMap<String, Vec<usize>>,
    in_flight: HashMap<String, InFlightTask>,
    resource_counts: HashMap<String, usize>,
    max_resources: HashMap<String, usize>,
    services: HashMap<String, ServiceInfo>,
    staleness_threshold: Duration,
    task_prefix: String,
    task_counter: u64,
}

impl TaskManager {
    pub fn new(division: impl Into<String>) -> Self {
        let task_prefix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self {
            division: division.into(),
            queues: Vec::new(),
            queue_index: HashMap::new(),
            level_cache: HashMap::new(),
            level_cursors: HashMap::new(),
            in_flight: HashMap::new(),
            resource_counts: HashMap::new(),
            max_resources: HashMap::new(),
            services: HashMap::new(),
            staleness_threshold: Duration::seconds(DEFAULT_STALENESS_THRESHOLD_SECONDS),
            task_prefix,
            task_counter: 0,
        }
    }

    /// 限制特性的同时占用数；未列出的特性不受限制
    pub fn with_max_resources(mut self, max_resources: HashMap<String, usize>) -> Self {
        self.max_resources = max_resources;
        self
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn task_prefix(&self) -> &str {
        &self.task_prefix
    }

    /// 替换全部队列，按 (优先级, 名称) 升序保存
    pub fn set_queues(&mut self, mut queues: Vec<Queue>) {
        queues.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        self.queue_index = queues
            .iter()
            .enumerate()
            .map(|(i, q)| (q.name().to_string(), i))
            .collect();
        self.queues = queues;
        self.level_cache.clear();
        self.level_cursors.clear();
        info!(
            queues = ?self.queues.iter().map(Queue::name).collect::<Vec<_>>(),
            "队列已更新"
        );
    }

    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queue_index.get(name).map(|&i| &self.queues[i])
    }

    pub fn queue_mut(&mut self, name: &str) -> Option<&mut Queue> {
        match self.queue_index.get(name) {
            Some(&i) => Some(&mut self.queues[i]),
            None => None,
        }
    }

    fn allowed_key(allowed_tasks: &[String]) -> String {
        let mut names: Vec<&str> = allowed_tasks.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names.join(",")
    }

    /// 把允许的队列按优先级分层，同一优先级的队列放在同一层
    fn build_levels(&self, allowed_tasks: &[String]) -> Vec<Vec<usize>> {
        let mut levels: Vec<Vec<usize>> = Vec::new();
        let mut current_priority = None;
        for (index, queue) in self.queues.iter().enumerate() {
            if !allowed_tasks.iter().any(|t| t == queue.name()) {
                continue;
            }
            if current_priority != Some(queue.priority()) {
                current_priority = Some(queue.priority());
                levels.push(Vec::new());
            }
            if let Some(level) = levels.last_mut() {
                level.push(index);
            }
        }
        levels
    }

    fn usable_features(&self, available_features: &[String]) -> Vec<String> {
        available_features
            .iter()
            .filter(|feature| match self.max_resources.get(*feature) {
                Some(max) => self.resource_counts.get(*feature).copied().unwrap_or(0) < *max,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// 领取下一个任务
    ///
    /// 若给出 `prior_task_id`，先按 `prior_success` 结束该任务。之后按优先级逐层查找，
    /// 层内在各队列之间轮询。
    pub fn get_task(
        &mut self,
        available_features: &[String],
        allowed_tasks: &[String],
        prior_task_id: Option<&str>,
        service_id: &str,
        prior_success: bool,
    ) -> Option<Task> {
        if let Some(prior) = prior_task_id {
            self.set_task_complete(prior, prior_success);
        }

        let usable = self.usable_features(available_features);
        let key = Self::allowed_key(allowed_tasks);
        if !self.level_cache.contains_key(&key) {
            let levels = self.build_levels(allowed_tasks);
            self.level_cursors.insert(key.clone(), vec![0; levels.len()]);
            self.level_cache.insert(key.clone(), levels);
        }
        let levels = self.level_cache.get(&key).cloned().unwrap_or_default();

        for (level_no, level) in levels.iter().enumerate() {
            let cursor = self
                .level_cursors
                .get(&key)
                .and_then(|c| c.get(level_no))
                .copied()
                .unwrap_or(0);
            for offset in 0..level.len() {
                let position = (cursor + offset) % level.len();
                let queue_index = level[position];
                if self.queues[queue_index].record_count() == 0 {
                    continue;
                }
                if let Some(cursors) = self.level_cursors.get_mut(&key) {
                    cursors[level_no] = position + 1;
                }
                if let Some(item) = self.queues[queue_index].next(&usable) {
                    return Some(self.start_task(queue_index, item, service_id));
                }
            }
        }
        None
    }

    fn start_task(&mut self, queue_index: usize, item: QueueItem, service_id: &str) -> Task {
        self.task_counter += 1;
        let task_id = format!("{}{}", self.task_prefix, self.task_counter);
        let task_name = self.queues[queue_index].name().to_string();
        let records = if task_name == "pull" {
            item.data.as_array().map(Vec::len)
        } else {
            None
        };
        let task = Task {
            task_id: task_id.clone(),
            task_name,
            data: item.data.clone(),
            required_features: item.uses_resources.clone(),
            service_id: service_id.to_string(),
            created_at: Utc::now(),
            division: self.division.clone(),
            records,
        };
        for resource in &item.uses_resources {
            *self.resource_counts.entry(resource.clone()).or_insert(0) += 1;
        }
        debug!(task_id = %task.task_id, task = %task.task_name, service_id, "任务已领取");
        self.in_flight.insert(
            task_id,
            InFlightTask {
                task: task.clone(),
                queue_index,
                item,
            },
        );
        task
    }

    fn release_resources(&mut self, features: &[String]) {
        for feature in features {
            if let Some(count) = self.resource_counts.get_mut(feature) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// 结束一个在途任务；未知的任务id被忽略
    pub fn set_task_complete(&mut self, task_id: &str, success: bool) {
        let Some(entry) = self.in_flight.remove(task_id) else {
            debug!(task_id, "结束未知任务，忽略");
            return;
        };
        self.release_resources(&entry.task.required_features);
        let queue = &mut self.queues[entry.queue_index];
        if success {
            queue.finished(&entry.item);
        } else {
            queue.failed(&entry.item);
        }
    }

    /// 在首次心跳前登记服务
    pub fn add_service(&mut self, service_id: &str, threads: usize, host: &str) {
        let mut service = ServiceInfo::new(service_id, Utc::now());
        service.thread_count = Some(threads);
        service.host = Some(host.to_string());
        self.services.insert(service_id.to_string(), service);
    }

    pub fn heartbeat(&mut self, service_id: &str) -> HashMap<String, QueueSnapshot> {
        self.heartbeat_at(service_id, Utc::now())
    }

    pub fn heartbeat_at(
        &mut self,
        service_id: &str,
        now: DateTime<Utc>,
    ) -> HashMap<String, QueueSnapshot> {
        self.services
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceInfo::new(service_id, now))
            .last_heartbeat = Some(now);
        self.get_short_status()
    }

    pub fn monitor_lost_tasks(&mut self) -> Vec<Task> {
        self.monitor_lost_tasks_at(Utc::now())
    }

    /// 移除心跳超时的服务，并把它们持有的在途任务作为lost回收
    ///
    /// 被回收的任务不会自动重新入队。
    pub fn monitor_lost_tasks_at(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        let lost_services: Vec<String> = self
            .services
            .values()
            .filter(|s| s.is_stale(now, self.staleness_threshold))
            .map(|s| s.service_id.clone())
            .collect();
        if lost_services.is_empty() {
            return Vec::new();
        }

        let lost_ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| lost_services.contains(&entry.task.service_id))
            .map(|(task_id, _)| task_id.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(lost_ids.len());
        for task_id in lost_ids {
            if let Some(entry) = self.in_flight.remove(&task_id) {
                self.release_resources(&entry.task.required_features);
                self.queues[entry.queue_index].lost(&entry.item);
                reclaimed.push(entry.task);
            }
        }
        for service_id in &lost_services {
            self.services.remove(service_id);
            warn!(service_id = %service_id, "服务心跳超时，已移除");
        }
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "回收失联服务的在途任务");
            metrics::counter!("archiver_lost_tasks_total").increment(reclaimed.len() as u64);
        }
        reclaimed
    }

    /// 把所有队列的在途负载放回队列，并清空在途任务表
    pub fn reset(&mut self) {
        for queue in &mut self.queues {
            queue.reset();
        }
        self.in_flight.clear();
        self.resource_counts.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn resource_count(&self, feature: &str) -> usize {
        self.resource_counts.get(feature).copied().unwrap_or(0)
    }

    pub fn get_short_status(&self) -> HashMap<String, QueueSnapshot> {
        self.queues
            .iter()
            .map(|q| (q.name().to_string(), q.get_status()))
            .collect()
    }

    pub fn get_status(&self) -> ManagerStatus {
        ManagerStatus {
            tasks: self.get_short_status(),
            current_used_resources: self.resource_counts.clone(),
            current_tasks: self
                .in_flight
                .iter()
                .map(|(id, entry)| (id.clone(), entry.task.clone()))
                .collect(),
            services: self.services.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueCallbacks;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Default)]
    struct LostRecorder {
        lost: Mutex<Vec<Value>>,
        finished: Mutex<Vec<Value>>,
        failed: Mutex<Vec<Value>>,
    }

    impl QueueCallbacks for LostRecorder {
        fn on_lost(&self, data: &Value) {
            self.lost.lock().unwrap().push(data.clone());
        }
        fn on_finished(&self, data: &Value) {
            self.finished.lock().unwrap().push(data.clone());
        }
        fn on_failed(&self, data: &Value) {
            self.failed.lock().unwrap().push(data.clone());
        }
    }

    #[test]
    fn test_queues_sorted_by_priority_then_name() {
        let mut manager = TaskManager::new("jgi");
        let mut md5 = Queue::new("md5", 3);
        md5.add(json!({"n": "md5"}), &[], true);
        let mut copy = Queue::new("copy", 1);
        copy.add(json!({"n": "copy"}), &[], true);
        let mut put = Queue::new("put", 2);
        put.add(json!({"n": "put"}), &[], true);
        manager.set_queues(vec![md5, put, copy]);

        let allowed = names(&["md5", "put", "copy"]);
        let order: Vec<String> =
            std::iter::from_fn(|| manager.get_task(&[], &allowed, None, "1", true))
                .map(|t| t.task_name)
                .collect();
        assert_eq!(order, names(&["copy", "put", "md5"]));
    }

    #[test]
    fn test_task_ids_use_prefix_and_counter() {
        let mut manager = TaskManager::new("jgi");
        let mut queue = Queue::new("md5", 1);
        queue.add_all(vec![json!({}), json!({})], &[], true);
        manager.set_queues(vec![queue]);

        let allowed = names(&["md5"]);
        let first = manager.get_task(&[], &allowed, None, "7", true).unwrap();
        let second = manager.get_task(&[], &allowed, None, "7", true).unwrap();
        assert_eq!(manager.task_prefix().len(), 8);
        assert_eq!(first.task_id, format!("{}1", manager.task_prefix()));
        assert_eq!(second.task_id, format!("{}2", manager.task_prefix()));
        assert_eq!(first.division, "jgi");
        assert_eq!(first.service_id, "7");
    }

    #[test]
    fn test_same_priority_queues_round_robin() {
        let mut manager = TaskManager::new("jgi");
        let mut copy = Queue::new("copy", 1);
        copy.add_all(vec![json!({"q": "copy"}), json!({"q": "copy"})], &[], true);
        let mut md5 = Queue::new("md5", 1);
        md5.add_all(vec![json!({"q": "md5"}), json!({"q": "md5"})], &[], true);
        manager.set_queues(vec![copy, md5]);

        let allowed = names(&["copy", "md5"]);
        let order: Vec<String> =
            std::iter::from_fn(|| manager.get_task(&[], &allowed, None, "1", true))
                .map(|t| t.task_name)
                .collect();
        assert_eq!(order, names(&["copy", "md5", "copy", "md5"]));
    }

    #[test]
    fn test_disallowed_queue_is_not_served() {
        let mut manager = TaskManager::new("jgi");
        let mut put = Queue::new("put", 1);
        put.add(json!({}), &[], true);
        manager.set_queues(vec![put]);

        assert!(manager.get_task(&[], &names(&["md5"]), None, "1", true).is_none());
        assert!(manager.get_task(&[], &names(&["put"]), None, "1", true).is_some());
    }

    #[test]
    fn test_pull_task_carries_record_count() {
        let mut manager = TaskManager::new("jgi");
        let mut pull = Queue::new("pull", 4);
        pull.add(json!([{"pull_queue_id": 1}, {"pull_queue_id": 2}]), &names(&["hsi_1"]), true);
        manager.set_queues(vec![pull]);

        let task = manager
            .get_task(&names(&["hsi_1"]), &names(&["pull"]), None, "1", true)
            .unwrap();
        assert_eq!(task.records, Some(2));
        assert_eq!(task.required_features, names(&["hsi_1"]));
    }

    #[test]
    fn test_completion_releases_resources_and_notifies_queue() {
        let recorder = Arc::new(LostRecorder::default());
        let mut manager = TaskManager::new("jgi");
        let mut put = Queue::new("put", 2).with_callbacks(recorder.clone());
        put.add_all(vec![json!({"n": 1}), json!({"n": 2})], &names(&["hsi_1"]), true);
        manager.set_queues(vec![put]);

        let available = names(&["hsi_1"]);
        let allowed = names(&["put"]);
        let first = manager.get_task(&available, &allowed, None, "1", true).unwrap();
        assert_eq!(manager.resource_count("hsi_1"), 1);

        let second = manager
            .get_task(&available, &allowed, Some(&first.task_id), "1", false)
            .unwrap();
        assert_eq!(*recorder.failed.lock().unwrap(), vec![json!({"n": 1})]);
        assert_eq!(manager.resource_count("hsi_1"), 1);

        manager.set_task_complete(&second.task_id, true);
        assert_eq!(*recorder.finished.lock().unwrap(), vec![json!({"n": 2})]);
        assert_eq!(manager.resource_count("hsi_1"), 0);
        assert_eq!(manager.in_flight_count(), 0);
        assert_eq!(manager.queue("put").unwrap().currently_running(), 0);

        // 未知或重复的任务id不产生影响
        manager.set_task_complete(&second.task_id, true);
        assert_eq!(recorder.finished.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_max_resources_withholds_saturated_feature() {
        let mut manager = TaskManager::new("jgi")
            .with_max_resources(HashMap::from([("hsi_1".to_string(), 1)]));
        let mut put = Queue::new("put", 2);
        put.add_all(vec![json!({"n": 1}), json!({"n": 2})], &names(&["hsi_1"]), true);
        manager.set_queues(vec![put]);

        let available = names(&["hsi_1"]);
        let allowed = names(&["put"]);
        let first = manager.get_task(&available, &allowed, None, "1", true).unwrap();
        assert!(manager.get_task(&available, &allowed, None, "1", true).is_none());

        manager.set_task_complete(&first.task_id, true);
        assert!(manager.get_task(&available, &allowed, None, "1", true).is_some());
    }

    #[test]
    fn test_heartbeat_registers_and_reports_status() {
        let mut manager = TaskManager::new("jgi");
        let mut put = Queue::new("put", 2);
        put.add(json!({"file_size": 99}), &[], true);
        manager.set_queues(vec![put]);

        let status = manager.heartbeat("3");
        assert_eq!(status["put"].record_count, 1);
        assert_eq!(status["put"].total_bytes, 99);
        assert!(manager.get_status().services["3"].last_heartbeat.is_some());
    }

    #[test]
    fn test_monitor_lost_tasks_reclaims_once() {
        let recorder = Arc::new(LostRecorder::default());
        let mut manager = TaskManager::new("jgi");
        let mut copy = Queue::new("copy", 1).with_callbacks(recorder.clone());
        copy.add_all(
            vec![json!({"file_id": 1}), json!({"file_id": 2}), json!({"file_id": 3})],
            &names(&["dna_w"]),
            true,
        );
        manager.set_queues(vec![copy]);

        let start = Utc::now();
        manager.add_service("stale", 2, "dtn01");
        manager.heartbeat_at("stale", start);
        manager.heartbeat_at("alive", start);

        let available = names(&["dna_w"]);
        let allowed = names(&["copy"]);
        manager.get_task(&available, &allowed, None, "stale", true).unwrap();
        manager.get_task(&available, &allowed, None, "stale", true).unwrap();
        manager.get_task(&available, &allowed, None, "alive", true).unwrap();

        // 阈值之前不会回收
        assert!(manager
            .monitor_lost_tasks_at(start + Duration::seconds(599))
            .is_empty());

        manager.heartbeat_at("alive", start + Duration::seconds(500));
        let reclaimed = manager.monitor_lost_tasks_at(start + Duration::seconds(600));
        assert_eq!(reclaimed.len(), 2);
        assert!(reclaimed.iter().all(|t| t.service_id == "stale"));

        let mut lost = recorder.lost.lock().unwrap().clone();
        lost.sort_by_key(|v| v["file_id"].as_i64());
        assert_eq!(lost, vec![json!({"file_id": 1}), json!({"file_id": 2})]);

        let status = manager.get_status();
        assert!(!status.services.contains_key("stale"));
        assert!(status.services.contains_key("alive"));
        assert_eq!(manager.in_flight_count(), 1);
        assert_eq!(manager.resource_count("dna_w"), 1);
        assert_eq!(manager.queue("copy").unwrap().currently_running(), 1);

        // 第二次检测不会重复回调
        assert!(manager
            .monitor_lost_tasks_at(start + Duration::seconds(1200))
            .iter()
            .all(|t| t.service_id == "alive"));
        assert_eq!(recorder.lost.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_reset_requeues_in_flight_work() {
        let mut manager = TaskManager::new("jgi");
        let mut md5 = Queue::new("md5", 1);
        md5.add_all(vec![json!({"n": 1}), json!({"n": 2})], &[], true);
        manager.set_queues(vec![md5]);

        let allowed = names(&["md5"]);
        let task = manager.get_task(&[], &allowed, None, "1", true).unwrap();
        manager.reset();
        assert_eq!(manager.in_flight_count(), 0);
        assert_eq!(manager.get_short_status()["md5"].record_count, 2);

        let again = manager.get_task(&[], &allowed, None, "1", true).unwrap();
        assert_eq!(again.data, task.data);
        assert_ne!(again.task_id, task.task_id);
    }
}
