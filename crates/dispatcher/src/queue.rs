//! 按任务类型划分的内存队列
//!
//! 每个队列内部按"所需特性集合"分组，每组是一个FIFO；分组之间轮询出队，
//! 避免某个备份服务的大量积压饿死其他服务。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use archiver_domain::QueueSnapshot;

/// 出队钩子的决定
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// 原样交给Worker
    Keep,
    /// 用新的负载替换
    Replace(Value),
    /// 丢弃该负载，继续查找下一个
    Skip,
}

/// 队列事件回调
///
/// 所有方法都有空的默认实现，只需覆盖关心的事件。
pub trait QueueCallbacks: Send + Sync {
    fn on_selected(&self, _data: &Value) -> Selection {
        Selection::Keep
    }

    fn on_lost(&self, _data: &Value) {}

    fn on_failed(&self, _data: &Value) {}

    fn on_finished(&self, _data: &Value) {}
}

/// 根据负载推导所需特性，用于构造时批量加入的初始记录
pub type FeatureExtractor = Box<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// 一次出队的结果
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub claim_id: u64,
    pub uses_resources: Vec<String>,
    pub data: Value,
}

struct Claimed {
    feature_key: String,
    data: Value,
}

pub struct Queue {
    name: String,
    priority: u32,
    default_features: Vec<String>,
    feature_groups: HashMap<String, VecDeque<Value>>,
    rotation: Vec<String>,
    rotation_cursor: usize,
    record_count: usize,
    total_bytes: u64,
    in_flight: HashMap<u64, Claimed>,
    next_claim_id: u64,
    callbacks: Option<Arc<dyn QueueCallbacks>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("record_count", &self.record_count)
            .field("currently_running", &self.in_flight.len())
            .finish()
    }
}

fn payload_size(data: &Value) -> u64 {
    data.get("file_size").and_then(Value::as_u64).unwrap_or(0)
}

impl Queue {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            default_features: Vec::new(),
            feature_groups: HashMap::new(),
            rotation: Vec::new(),
            rotation_cursor: 0,
            record_count: 0,
            total_bytes: 0,
            in_flight: HashMap::new(),
            next_claim_id: 0,
            callbacks: None,
        }
    }

    pub fn with_default_features(mut self, features: Vec<String>) -> Self {
        self.default_features = features;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn QueueCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// 批量加入初始记录；没有提取器时每条记录只使用默认特性
    pub fn with_items(mut self, items: Vec<Value>, extractor: Option<FeatureExtractor>) -> Self {
        for item in items {
            let features = extractor.as_ref().map(|f| f(&item)).unwrap_or_default();
            self.add(item, &features, true);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    fn feature_key(&self, features: &[String], include_default_features: bool) -> String {
        let mut all: Vec<&str> = features.iter().map(String::as_str).collect();
        if include_default_features {
            all.extend(self.default_features.iter().map(String::as_str));
        }
        all.retain(|f| !f.is_empty());
        all.sort_unstable();
        all.dedup();
        all.join(",")
    }

    pub fn add(&mut self, item: Value, features: &[String], include_default_features: bool) {
        let key = self.feature_key(features, include_default_features);
        self.total_bytes += payload_size(&item);
        self.record_count += 1;
        match self.feature_groups.get_mut(&key) {
            Some(group) => group.push_back(item),
            None => {
                self.feature_groups.insert(key.clone(), VecDeque::from([item]));
                self.rotation.push(key);
            }
        }
    }

    pub fn add_all(&mut self, items: Vec<Value>, features: &[String], include_default_features: bool) {
        for item in items {
            self.add(item, features, include_default_features);
        }
    }

    fn pop_front(&mut self, key: &str) -> Option<Value> {
        let item = self.feature_groups.get_mut(key)?.pop_front()?;
        self.record_count -= 1;
        self.total_bytes = self.total_bytes.saturating_sub(payload_size(&item));
        Some(item)
    }

    /// 取出下一个可以由 `available_features` 满足的负载
    pub fn next(&mut self, available_features: &[String]) -> Option<QueueItem> {
        loop {
            let key = self.next_eligible_key(available_features)?;
            let Some(data) = self.pop_front(&key) else {
                continue;
            };

            let selection = match &self.callbacks {
                Some(callbacks) => callbacks.on_selected(&data),
                None => Selection::Keep,
            };
            let data = match selection {
                Selection::Keep => data,
                Selection::Replace(replacement) => replacement,
                Selection::Skip => {
                    debug!(queue = %self.name, features = %key, "出队钩子丢弃了负载");
                    continue;
                }
            };

            self.next_claim_id += 1;
            let claim_id = self.next_claim_id;
            self.in_flight.insert(
                claim_id,
                Claimed {
                    feature_key: key.clone(),
                    data: data.clone(),
                },
            );
            let uses_resources = if key.is_empty() {
                Vec::new()
            } else {
                key.split(',').map(str::to_string).collect()
            };
            return Some(QueueItem {
                claim_id,
                uses_resources,
                data,
            });
        }
    }

    /// 从上次服务的分组之后开始扫描，命中后游标移到该分组之后
    fn next_eligible_key(&mut self, available_features: &[String]) -> Option<String> {
        let len = self.rotation.len();
        for offset in 0..len {
            let index = (self.rotation_cursor + offset) % len;
            let key = &self.rotation[index];
            let non_empty = self
                .feature_groups
                .get(key)
                .is_some_and(|group| !group.is_empty());
            let satisfied = key.is_empty()
                || key
                    .split(',')
                    .all(|f| available_features.iter().any(|a| a == f));
            if non_empty && satisfied {
                self.rotation_cursor = index + 1;
                return Some(key.clone());
            }
        }
        None
    }

    fn settle(&mut self, item: &QueueItem) -> Option<Value> {
        self.in_flight.remove(&item.claim_id).map(|claimed| claimed.data)
    }

    /// 领取者失联，任务被回收
    pub fn lost(&mut self, item: &QueueItem) {
        if self.settle(item).is_some() {
            if let Some(callbacks) = &self.callbacks {
                callbacks.on_lost(&item.data);
            }
        }
    }

    pub fn failed(&mut self, item: &QueueItem) {
        if self.settle(item).is_some() {
            if let Some(callbacks) = &self.callbacks {
                callbacks.on_failed(&item.data);
            }
        }
    }

    pub fn finished(&mut self, item: &QueueItem) {
        if self.settle(item).is_some() {
            if let Some(callbacks) = &self.callbacks {
                callbacks.on_finished(&item.data);
            }
        }
    }

    /// 把所有仍被视为在途的负载放回各自FIFO的队首（保持原有顺序）
    pub fn reset(&mut self) {
        let mut claimed: Vec<(u64, Claimed)> = self.in_flight.drain().collect();
        claimed.sort_by_key(|(claim_id, _)| std::cmp::Reverse(*claim_id));
        let restored = claimed.len();
        for (_, item) in claimed {
            self.total_bytes += payload_size(&item.data);
            self.record_count += 1;
            match self.feature_groups.get_mut(&item.feature_key) {
                Some(group) => group.push_front(item.data),
                None => {
                    self.feature_groups
                        .insert(item.feature_key.clone(), VecDeque::from([item.data]));
                    self.rotation.push(item.feature_key);
                }
            }
        }
        if restored > 0 {
            debug!(queue = %self.name, restored, "在途负载已放回队列");
        }
    }

    pub fn currently_running(&self) -> usize {
        self.in_flight.len()
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn get_status(&self) -> QueueSnapshot {
        QueueSnapshot {
            record_count: self.record_count,
            total_bytes: self.total_bytes,
            currently_running: self.currently_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn features(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Default)]
    struct Recorder {
        lost: Mutex<Vec<Value>>,
        failed: Mutex<Vec<Value>>,
        finished: Mutex<Vec<Value>>,
    }

    impl QueueCallbacks for Recorder {
        fn on_lost(&self, data: &Value) {
            self.lost.lock().unwrap().push(data.clone());
        }
        fn on_failed(&self, data: &Value) {
            self.failed.lock().unwrap().push(data.clone());
        }
        fn on_finished(&self, data: &Value) {
            self.finished.lock().unwrap().push(data.clone());
        }
    }

    #[test]
    fn test_feature_key_is_sorted_and_merged_with_defaults() {
        let mut queue = Queue::new("put", 2).with_default_features(features(&["dna_w"]));
        queue.add(json!({"id": 1}), &features(&["hsi_1"]), true);
        queue.add(json!({"id": 2}), &features(&["dna_w", "hsi_1"]), true);
        queue.add(json!({"id": 3}), &features(&["hsi_1"]), false);

        let item = queue.next(&features(&["hsi_1", "dna_w"])).unwrap();
        assert_eq!(item.uses_resources, features(&["dna_w", "hsi_1"]));
        assert_eq!(item.data["id"], 1);
        // 前两条共享同一个分组
        let item = queue.next(&features(&["hsi_1", "dna_w"])).unwrap();
        assert_eq!(item.data["id"], 3);
        assert_eq!(item.uses_resources, features(&["hsi_1"]));
    }

    #[test]
    fn test_counts_track_adds_and_claims() {
        let mut queue = Queue::new("md5", 1);
        for i in 0..5 {
            queue.add(json!({"id": i, "file_size": 10}), &features(&["a"]), true);
        }
        queue.add(json!({"id": 5}), &features(&["b"]), true);
        assert_eq!(queue.record_count(), 6);
        assert_eq!(queue.total_bytes(), 50);

        let mut claimed = Vec::new();
        while let Some(item) = queue.next(&features(&["a"])) {
            claimed.push(item);
        }
        assert_eq!(claimed.len(), 5);
        assert_eq!(queue.record_count(), 6 - claimed.len());
        assert_eq!(queue.total_bytes(), 0);
        assert_eq!(queue.currently_running(), 5);

        queue.finished(&claimed[0]);
        queue.failed(&claimed[1]);
        assert_eq!(queue.currently_running(), 3);
        // 重复结束同一个领取不会再次扣减
        queue.finished(&claimed[0]);
        assert_eq!(queue.currently_running(), 3);

        let status = queue.get_status();
        assert_eq!(status.record_count, 1);
        assert_eq!(status.currently_running, 3);
    }

    #[test]
    fn test_round_robin_alternates_groups() {
        let mut queue = Queue::new("put", 2);
        queue.add(json!({"group": "a", "n": 1}), &features(&["hsi_1"]), true);
        queue.add(json!({"group": "a", "n": 2}), &features(&["hsi_1"]), true);
        queue.add(json!({"group": "b", "n": 1}), &features(&["hsi_2"]), true);
        queue.add(json!({"group": "b", "n": 2}), &features(&["hsi_2"]), true);

        let available = features(&["hsi_1", "hsi_2"]);
        let order: Vec<String> = std::iter::from_fn(|| queue.next(&available))
            .map(|item| format!("{}{}", item.data["group"].as_str().unwrap(), item.data["n"]))
            .collect();
        assert_eq!(order, vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_unsatisfied_features_are_skipped() {
        let mut queue = Queue::new("put", 2);
        queue.add(json!({"n": 1}), &features(&["hsi_1"]), true);
        queue.add(json!({"n": 2}), &features(&["hsi_2"]), true);

        assert!(queue.next(&features(&["globus"])).is_none());
        let item = queue.next(&features(&["hsi_2"])).unwrap();
        assert_eq!(item.data["n"], 2);
        assert!(queue.next(&features(&["hsi_2"])).is_none());
        assert_eq!(queue.record_count(), 1);
    }

    struct SkipOdd;

    impl QueueCallbacks for SkipOdd {
        fn on_selected(&self, data: &Value) -> Selection {
            match data["n"].as_i64() {
                Some(n) if n % 2 == 1 => Selection::Skip,
                Some(n) => Selection::Replace(json!({"n": n, "checked": true})),
                None => Selection::Keep,
            }
        }
    }

    #[test]
    fn test_selection_hook_replaces_and_skips() {
        let mut queue = Queue::new("pull", 3).with_callbacks(Arc::new(SkipOdd));
        queue.add_all(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})], &[], true);

        let item = queue.next(&[]).unwrap();
        assert_eq!(item.data, json!({"n": 2, "checked": true}));
        assert!(queue.next(&[]).is_none());
        assert_eq!(queue.record_count(), 0);
        assert_eq!(queue.currently_running(), 1);
    }

    #[test]
    fn test_callbacks_receive_payload() {
        let recorder = Arc::new(Recorder::default());
        let mut queue = Queue::new("copy", 1).with_callbacks(recorder.clone());
        queue.add_all(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})], &[], true);

        let a = queue.next(&[]).unwrap();
        let b = queue.next(&[]).unwrap();
        let c = queue.next(&[]).unwrap();
        queue.lost(&a);
        queue.failed(&b);
        queue.finished(&c);

        assert_eq!(*recorder.lost.lock().unwrap(), vec![json!({"n": 1})]);
        assert_eq!(*recorder.failed.lock().unwrap(), vec![json!({"n": 2})]);
        assert_eq!(*recorder.finished.lock().unwrap(), vec![json!({"n": 3})]);
        assert_eq!(queue.currently_running(), 0);
    }

    #[test]
    fn test_reset_restores_in_flight_at_head() {
        let mut queue = Queue::new("put", 2);
        queue.add_all(
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
            &features(&["hsi_1"]),
            true,
        );
        let available = features(&["hsi_1"]);
        let first = queue.next(&available).unwrap();
        queue.next(&available).unwrap();
        queue.finished(&first);

        queue.reset();
        assert_eq!(queue.currently_running(), 0);
        assert_eq!(queue.record_count(), 2);
        assert_eq!(queue.next(&available).unwrap().data["n"], 2);
        assert_eq!(queue.next(&available).unwrap().data["n"], 3);
    }

    #[test]
    fn test_with_items_uses_extractor() {
        let extractor: FeatureExtractor = Box::new(|data: &Value| {
            vec![format!("hsi_{}", data["service"].as_i64().unwrap_or(0))]
        });
        let mut queue = Queue::new("put", 2)
            .with_items(vec![json!({"service": 1}), json!({"service": 2})], Some(extractor));

        let item = queue.next(&features(&["hsi_2"])).unwrap();
        assert_eq!(item.data["service"], 2);
        assert_eq!(queue.record_count(), 1);
    }
}
