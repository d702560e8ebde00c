//! Task service tests over the pipeline test harness.

use std::collections::HashMap;
use std::time::Duration;

use super::*;
use crate::judge::pid::ProblemRef;
use crate::pipeline::e2e_tests::harness::TestHarness;
use crate::storage::crypto::SecretKey;

fn spec_for(raw: &str) -> TaskSpec {
    TaskSpec {
        problems: vec![ProblemRef {
            raw: raw.to_string(),
            source_adapter: Some("mock".to_string()),
        }],
        stages: StageSet::all(),
        disable_solve: false,
        target_adapter: "mock".to_string(),
        llm_provider: None,
    }
}

fn service(harness: &TestHarness) -> TaskService {
    TaskService::new(harness.deps(), SecretKey::from_secret("test-harness"))
}

async fn wait_for_status(
    service: &TaskService,
    user_id: i64,
    task_id: &str,
    want: &str,
) -> TaskDetail {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let detail = service.get_task(user_id, task_id).await.expect("get task");
        if detail.task.status == want {
            return detail;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "task never reached '{want}', stuck at '{}' ({:?})",
            detail.task.status,
            detail
                .problems
                .iter()
                .map(|p| (p.state.clone(), p.last_error_message.clone()))
                .collect::<Vec<_>>(),
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[test]
fn upload_implies_solve_unless_cleared() {
    let mut spec = spec_for("1001");
    spec.stages = StageSet::parse_csv("fetch,gen,upload").expect("stages");
    assert!(spec.normalized_stages().contains(Stage::Solve));

    spec.disable_solve = true;
    assert!(!spec.normalized_stages().contains(Stage::Solve));

    // Empty set means all four.
    spec.stages = StageSet::empty();
    spec.disable_solve = false;
    assert_eq!(spec.normalized_stages(), StageSet::all());
}

#[tokio::test]
async fn create_task_runs_to_completion() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let service = service(&harness);

    let task_id = service
        .create_task(harness.user_id, spec_for("1001"))
        .await
        .expect("create");
    let detail = wait_for_status(&service, harness.user_id, &task_id, "completed").await;

    assert_eq!(detail.problems.len(), 1);
    assert_eq!(detail.problems[0].state, "completed");
    assert!(detail.problems[0]
        .uploaded_url
        .as_deref()
        .is_some_and(|url| url.contains("/d/alpha/p/")));
}

#[tokio::test]
async fn create_task_validates_input() {
    let harness = TestHarness::new().await;
    let service = service(&harness);

    let mut empty = spec_for("1001");
    empty.problems.clear();
    assert!(matches!(
        service.create_task(harness.user_id, empty).await,
        Err(TaskError::Validation(_))
    ));

    let mut bad_target = spec_for("1001");
    bad_target.target_adapter = "nope".to_string();
    assert!(matches!(
        service.create_task(harness.user_id, bad_target).await,
        Err(TaskError::UnknownAdapter(_))
    ));

    let mut bad_ref = spec_for("1001");
    bad_ref.problems[0].raw = "not a problem".to_string();
    bad_ref.problems[0].source_adapter = None;
    assert!(matches!(
        service.create_task(harness.user_id, bad_ref).await,
        Err(TaskError::Validation(_))
    ));
}

#[tokio::test]
async fn failed_solve_retried_from_generate_preserves_receipt() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    // First submission comes back wrong, so the task fails at Solve.
    harness
        .judge
        .script_verdicts([crate::judge::Verdict::WrongAnswer]);
    let service = service(&harness);

    let task_id = service
        .create_task(harness.user_id, spec_for("1001"))
        .await
        .expect("create");
    let detail = wait_for_status(&service, harness.user_id, &task_id, "failed").await;
    assert_eq!(detail.problems[0].state, "failed_solve");
    assert_eq!(
        detail.problems[0].last_error_kind.as_deref(),
        Some("solve_wrong_answer")
    );
    let uploads_before = harness.judge.upload_calls();
    assert_eq!(uploads_before, 1);

    // Retry from Generate: gen data is cleared, the receipt is kept.
    let retried = service
        .retry(harness.user_id, &task_id, Some(Stage::Generate))
        .await
        .expect("retry");
    assert_eq!(retried, 1);
    wait_for_status(&service, harness.user_id, &task_id, "completed").await;

    // The preserved receipt satisfied the Upload skip oracle.
    assert_eq!(harness.judge.upload_calls(), uploads_before);
    let ctx = harness.ctx("1001").await;
    assert!(ctx.workspace.has_generated_data(), "gen was re-run");
    assert!(ctx.workspace.get_upload_receipt("mock").expect("read").is_some());
}

#[tokio::test]
async fn retry_without_failures_is_a_no_op() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let service = service(&harness);

    let task_id = service
        .create_task(harness.user_id, spec_for("1001"))
        .await
        .expect("create");
    wait_for_status(&service, harness.user_id, &task_id, "completed").await;

    let retried = service
        .retry(harness.user_id, &task_id, None)
        .await
        .expect("retry");
    assert_eq!(retried, 0);
}

#[tokio::test]
async fn delete_removes_the_task() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let service = service(&harness);

    let task_id = service
        .create_task(harness.user_id, spec_for("1001"))
        .await
        .expect("create");
    wait_for_status(&service, harness.user_id, &task_id, "completed").await;

    service.delete(harness.user_id, &task_id).await.expect("delete");
    assert!(matches!(
        service.get_task(harness.user_id, &task_id).await,
        Err(TaskError::NotFound)
    ));
    // Deleting a task leaves the workspace on disk.
    let ctx = harness.ctx("1001").await;
    assert!(ctx.workspace.has_statement());
}

#[tokio::test]
async fn download_bundles_workspaces() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let service = service(&harness);

    let task_id = service
        .create_task(harness.user_id, spec_for("1001"))
        .await
        .expect("create");
    wait_for_status(&service, harness.user_id, &task_id, "completed").await;

    let bytes = service
        .download_workspace(harness.user_id, &task_id)
        .await
        .expect("zip");
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("archive");
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).expect("entry").name().to_string())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("statement.json")));
    assert!(names.iter().any(|n| n.contains("/gen/")));
    assert!(names.iter().all(|n| n.starts_with("mock-1001/")));
}

#[tokio::test]
async fn stats_reflect_finished_work() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let service = service(&harness);

    let task_id = service
        .create_task(harness.user_id, spec_for("1001"))
        .await
        .expect("create");
    wait_for_status(&service, harness.user_id, &task_id, "completed").await;

    let queue = service.queue_stats().await.expect("queue stats");
    assert_eq!(queue.completed, 1);
    assert_eq!(queue.total, 1);

    let system = service.system_stats().await.expect("system stats");
    assert_eq!(system.tasks.total, 1);
    assert_eq!(system.tasks.success, 1);
    assert_eq!(system.users.total, 1);
}

#[tokio::test]
async fn provider_editing_requires_admin() {
    let harness = TestHarness::new().await;
    let service = service(&harness);

    let mut credentials = HashMap::new();
    credentials.insert("api_key".to_string(), "sk-new".to_string());
    let err = service
        .save_provider(harness.user_id, "openai", None, None, Some(&credentials))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Forbidden(_)));

    let admin = crate::storage::users::create_user(&harness.db, "root", "hash", true)
        .await
        .expect("admin");
    service
        .save_provider(admin, "openai", None, Some("gpt-4o"), Some(&credentials))
        .await
        .expect("admin save");

    let listed = service.list_providers().await.expect("list");
    let openai = listed.iter().find(|p| p.id == "openai").expect("openai");
    assert_eq!(openai.model, "gpt-4o");
    assert!(openai.has_credentials);
    assert_eq!(openai.credential_fields, vec!["api_key".to_string()]);
}

#[tokio::test]
async fn concurrency_surface_round_trips() {
    let harness = TestHarness::new().await;
    let service = service(&harness);

    let mut config = service.concurrency_get();
    config.stage_fetch = 3;
    service.concurrency_set(&config);
    assert_eq!(service.concurrency_get().stage_fetch, 3);

    service.apply_preset("conservative").expect("preset");
    assert_eq!(service.concurrency_get().global_tasks, 10);
    assert!(matches!(
        service.apply_preset("warp-speed"),
        Err(TaskError::Validation(_))
    ));
}

#[tokio::test]
async fn draining_rejects_new_tasks() {
    let harness = TestHarness::new().await;
    let service = service(&harness);
    service.shutdown().await;
    assert!(matches!(
        service.create_task(harness.user_id, spec_for("1001")).await,
        Err(TaskError::Draining)
    ));
}
