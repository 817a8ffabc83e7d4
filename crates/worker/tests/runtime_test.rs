use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use archiver_domain::{ArchiverError, ArchiverResult, Task};
use archiver_testing_utils::*;
use archiver_worker::handlers::{HandlerContext, HandlerRegistry, TaskHandler};
use archiver_worker::WorkerRuntime;

const SERVER: &str = "archive.nersc.gov";

/// 按负载中的 `outcome` 返回结果的处理器
struct ScriptedHandler;

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn handle(&self, _ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        match task.data["outcome"].as_str() {
            Some("ok") => Ok(true),
            Some("tape_down") => Err(ArchiverError::resource_unavailable("hsi_1")),
            Some("error") => Err(ArchiverError::Internal("boom".to_string())),
            _ => Ok(false),
        }
    }
}

fn task(id: &str, name: &str, outcome: &str) -> Task {
    TaskBuilder::new(name)
        .with_id(id)
        .with_data(json!({ "outcome": outcome }))
        .build()
}

fn runtime(env: &TestContext, features: &[&str]) -> Arc<WorkerRuntime> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ScriptedHandler));
    Arc::new(WorkerRuntime::new(
        env.ctx.clone(),
        Arc::new(registry),
        "svc-1",
        vec!["scripted".to_string()],
        features.iter().map(|f| f.to_string()).collect(),
    ))
}

fn env_with_tasks(tasks: Vec<Task>) -> (tempfile::TempDir, TestContext) {
    let temp = tempfile::tempdir().unwrap();
    let env = TestContext::new(
        MockControlPlane::new()
            .with_tasks(tasks)
            .with_backup_service(hpss_service(1, SERVER, "/home/projects/jgi")),
        MockCommandRunner::new(),
        tape_settings(temp.path()),
    );
    (temp, env)
}

#[tokio::test]
async fn test_worker_reports_each_outcome_before_next_claim() {
    let (_temp, env) = env_with_tasks(vec![
        task("A1", "scripted", "ok"),
        task("A2", "scripted", "no"),
    ]);
    let runtime = runtime(&env, &["hsi_1"]);

    assert_eq!(runtime.set_threads(1).await, 1);
    runtime.wait().await;

    let state = env.control_plane.state();
    assert_eq!(state.claims.len(), 3);
    assert_eq!(state.claims[0].features, vec!["hsi_1".to_string()]);
    assert_eq!(state.claims[0].tasks, vec!["scripted".to_string()]);
    assert_eq!(state.claims[0].service_id, "svc-1");
    assert_eq!(
        state
            .completed
            .iter()
            .map(|o| (o.task_id.as_str(), o.success))
            .collect::<Vec<_>>(),
        vec![("A1", true), ("A2", false)]
    );
    drop(state);
    assert_eq!(runtime.active_count(), 0);
}

#[tokio::test]
async fn test_resource_unavailable_requeues_task() {
    let (_temp, env) = env_with_tasks(vec![
        task("B1", "scripted", "tape_down"),
        task("B2", "scripted", "ok"),
    ]);
    let runtime = runtime(&env, &[]);

    runtime.set_threads(1).await;
    runtime.wait().await;

    let state = env.control_plane.state();
    assert_eq!(state.requeued.len(), 1);
    assert_eq!(state.requeued[0].task_id, "B1");
    assert!(state.completed.is_empty());
    // 第二个任务留在队列中，等待下一次启动Worker
    assert_eq!(state.pending_tasks.len(), 1);
}

#[tokio::test]
async fn test_handler_error_and_unknown_task_report_failure() {
    let (_temp, env) = env_with_tasks(vec![
        task("C1", "scripted", "error"),
        task("C2", "no_such_task", "ok"),
    ]);
    let runtime = runtime(&env, &[]);

    runtime.set_threads(1).await;
    runtime.wait().await;
    runtime.set_threads(1).await;
    runtime.wait().await;

    let state = env.control_plane.state();
    assert_eq!(
        state
            .completed
            .iter()
            .map(|o| (o.task_id.as_str(), o.success))
            .collect::<Vec<_>>(),
        vec![("C1", false), ("C2", false)]
    );
}

#[tokio::test]
async fn test_stopped_runtime_does_not_start_workers() {
    let (_temp, env) = env_with_tasks(vec![task("D1", "scripted", "ok")]);
    let runtime = runtime(&env, &[]);
    runtime.stop();

    assert_eq!(runtime.set_threads(4).await, 0);
    runtime.wait().await;
    assert!(env.control_plane.state().claims.is_empty());
}

#[tokio::test]
async fn test_claim_failure_ends_worker() {
    let (_temp, env) = env_with_tasks(vec![]);
    env.control_plane.state().fail_claims = true;
    let runtime = runtime(&env, &[]);

    runtime.set_threads(2).await;
    runtime.wait().await;
    assert_eq!(runtime.active_count(), 0);
    assert_eq!(env.control_plane.state().claims.len(), 2);
}

#[tokio::test]
async fn test_check_services_withdraws_and_restores_tape_feature() {
    let (_temp, env) = env_with_tasks(vec![]);
    let runtime = runtime(&env, &["hsi_1", "dna_w"]);

    env.probe.set(SERVER, false);
    runtime.check_services().await;
    assert_eq!(runtime.features().await, vec!["dna_w".to_string()]);
    // 已经下线的资源不重复上报
    runtime.check_services().await;

    env.probe.set(SERVER, true);
    runtime.check_services().await;
    assert_eq!(
        runtime.features().await,
        vec!["dna_w".to_string(), "hsi_1".to_string()]
    );

    assert_eq!(
        env.control_plane.state().resource_events,
        vec![("hsi_1".to_string(), false), ("hsi_1".to_string(), true)]
    );
}
