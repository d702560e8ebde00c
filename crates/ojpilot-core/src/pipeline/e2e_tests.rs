//! End-to-end pipeline tests over mock judges and a mock LLM endpoint.
//!
//! The harness wires a real in-memory database, real gates, a real
//! workspace store on a tempdir, the mock judge, and an
//! OpenAI-compatible wiremock endpoint for the LLM pool. Generator
//! scripts run under `sh`, so no Python toolchain is needed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::judge::Verdict;
use crate::pipeline::runner;
use crate::pipeline::ProblemState;
use crate::storage::problems;

pub(crate) mod harness {
    use std::sync::Arc;

    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::Config;
    use crate::events::EventBus;
    use crate::gate::GateSet;
    use crate::judge::mock::MockJudge;
    use crate::judge::pid::NormalizedPid;
    use crate::judge::registry::AdapterRegistry;
    use crate::llm::pool::LlmPool;
    use crate::llm::providers::seed_providers;
    use crate::pipeline::runner::RunnerDeps;
    use crate::pipeline::ProblemCtx;
    use crate::storage::adapter_configs::{self, DbCredentials};
    use crate::storage::crypto::SecretKey;
    use crate::storage::{init_test_db, problems, tasks, users, DbPool};
    use crate::workspace::WorkspaceStore;
    use tokio_util::sync::CancellationToken;

    /// Everything a pipeline test needs, wired like production.
    pub(crate) struct TestHarness {
        pub db: DbPool,
        pub user_id: i64,
        pub judge: Arc<MockJudge>,
        pub registry: Arc<AdapterRegistry>,
        pub server: MockServer,
        pub gates: Arc<GateSet>,
        pub llm: Arc<LlmPool>,
        pub bus: EventBus,
        pub credentials: Arc<DbCredentials>,
        pub store: WorkspaceStore,
        pub config: Arc<Config>,
        _tmp: tempfile::TempDir,
    }

    impl TestHarness {
        pub(crate) async fn new() -> Self {
            let db = init_test_db().await.expect("db");
            seed_providers(&db).await.expect("seed providers");
            let key = SecretKey::from_secret("test-harness");
            let server = MockServer::start().await;
            crate::storage::providers::save(
                &db,
                &key,
                "ollama",
                Some(server.uri().as_str()),
                None,
                None,
            )
            .await
            .expect("point ollama at mock");

            let user_id = users::create_user(&db, "alice", "hash", false)
                .await
                .expect("user");
            let mut bag = std::collections::HashMap::new();
            bag.insert("base_url".to_string(), "https://oj.test".to_string());
            bag.insert("domain".to_string(), "alpha".to_string());
            bag.insert("username".to_string(), "alice".to_string());
            bag.insert("password".to_string(), "pw".to_string());
            adapter_configs::save_config(&db, &key, user_id, "mock", &bag)
                .await
                .expect("adapter config");

            let tmp = tempfile::tempdir().expect("tempdir");
            let mut config = Config::default();
            config.workspace.root = tmp.path().to_string_lossy().to_string();
            config.concurrency.task_timeout_secs = 30;
            config.retry.base_delay_ms = 10;
            config.retry.max_delay_ms = 50;
            config.gen.cases = 3;
            config.gen.case_floor = 2;
            config.gen.python_cmd = "sh".to_string();
            config.gen.generator_timeout_ms = 5000;
            config.solve.run_timeout_ms = 2000;
            config.solve.judge_poll_timeout_secs = 5;
            config.llm.request_timeout_secs = 5;
            config.llm.generation_provider = "ollama".to_string();
            config.llm.solution_provider = "ollama".to_string();
            // OCR stays bound to openai, which has no saved key: any OCR
            // call in a test fails loudly, proving it was not invoked.
            config.llm.ocr_provider = "openai".to_string();
            let config = Arc::new(config);

            let gates = Arc::new(GateSet::from_config(&config.concurrency));
            let llm = Arc::new(LlmPool::new(
                db.clone(),
                key.clone(),
                Arc::clone(&gates),
                config.llm.clone(),
            ));
            let judge = Arc::new(MockJudge::named("mock"));
            let mut registry = AdapterRegistry::new();
            registry.register(Arc::clone(&judge) as Arc<dyn crate::judge::JudgeAdapter>);
            let registry = Arc::new(registry);
            let credentials = DbCredentials::new(db.clone(), key.clone());
            let store = WorkspaceStore::new(&config.workspace.root);

            Self {
                db,
                user_id,
                judge,
                registry,
                server,
                gates,
                llm,
                bus: EventBus::new(),
                credentials,
                store,
                config,
                _tmp: tmp,
            }
        }

        /// Mount a generation-endpoint response (generator script).
        pub(crate) async fn respond_generation(&self, content: &str) {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(body_string_contains("Write the generator script now"))
                .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(content)))
                .mount(&self.server)
                .await;
        }

        /// Mount solution-endpoint responses (per-input answers and
        /// solution code).
        pub(crate) async fn respond_solution(&self, content: &str) {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(body_string_contains("You are the reference solution"))
                .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(content)))
                .mount(&self.server)
                .await;
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(body_string_contains("Write the solution now"))
                .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(content)))
                .mount(&self.server)
                .await;
        }

        /// Build a stage-test context for a bare numeric pid.
        pub(crate) async fn ctx(&self, short_id: &str) -> ProblemCtx {
            let pid = NormalizedPid {
                source_adapter: "mock".to_string(),
                short_id: short_id.to_string(),
            };
            let workspace = self.store.open_or_create(self.user_id, &pid.workspace_key());
            ProblemCtx {
                user_id: self.user_id,
                task_id: "t-1".to_string(),
                problem_id: 1,
                pid,
                source: Arc::clone(&self.judge) as Arc<dyn crate::judge::JudgeAdapter>,
                target: Arc::clone(&self.judge) as Arc<dyn crate::judge::JudgeAdapter>,
                workspace,
                llm: Arc::clone(&self.llm),
                llm_provider: None,
                gates: Arc::clone(&self.gates),
                db: self.db.clone(),
                credentials: self.credentials.clone(),
                cancel: CancellationToken::new(),
                bus: self.bus.clone(),
                config: Arc::clone(&self.config),
            }
        }

        /// Write the statement the mock judge would have served.
        pub(crate) fn seed_statement(&self, ctx: &ProblemCtx) {
            let statement = MockJudge::sample_statement(&format!("Problem {}", ctx.pid.short_id));
            ctx.workspace.write_statement(&statement).expect("statement");
        }

        /// Shared runner dependencies.
        pub(crate) fn deps(&self) -> RunnerDeps {
            RunnerDeps {
                db: self.db.clone(),
                config: Arc::clone(&self.config),
                gates: Arc::clone(&self.gates),
                llm: Arc::clone(&self.llm),
                registry: Arc::clone(&self.registry),
                store: self.store.clone(),
                bus: self.bus.clone(),
                credentials: self.credentials.clone(),
            }
        }

        /// Insert task and problem rows, returning the records.
        pub(crate) async fn seed_task(
            &self,
            task_id: &str,
            short_id: &str,
            stages: &str,
        ) -> (tasks::TaskRecord, i64) {
            tasks::insert(&self.db, task_id, self.user_id, "mock", None, stages)
                .await
                .expect("task row");
            let problem_id = problems::insert(
                &self.db,
                task_id,
                self.user_id,
                short_id,
                "mock",
                short_id,
                "mock",
            )
            .await
            .expect("problem row");
            let task = tasks::get(&self.db, self.user_id, task_id)
                .await
                .expect("get task")
                .expect("task");
            (task, problem_id)
        }
    }

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"content": content}}],
            "model": "llama3.1",
            "usage": {"prompt_tokens": 50, "completion_tokens": 20}
        })
    }
}

use harness::TestHarness;

#[tokio::test]
async fn full_pipeline_reaches_completed() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch,gen,upload,solve").await;

    let state = runner::run_problem(
        &harness.deps(),
        &task,
        problem_id,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(state, ProblemState::Completed);

    let record = problems::get(&harness.db, problem_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(record.state, "completed");
    let url = record.uploaded_url.expect("uploaded url");
    let url_re = regex::Regex::new(r"^https?://.+/d/[^/]+/p/\d+$").expect("regex");
    assert!(url_re.is_match(&url), "unexpected url: {url}");

    let ctx = harness.ctx("1001").await;
    assert!(ctx.workspace.has_statement());
    assert!(ctx.workspace.has_generated_data());
    assert!(ctx.workspace.get_upload_receipt("mock").expect("read").is_some());
    assert!(ctx.workspace.has_accepted_solve("mock"));
}

#[tokio::test]
async fn fully_cached_workspace_skips_every_stage() {
    let harness = TestHarness::new().await;
    let ctx = harness.ctx("1001").await;
    harness.seed_statement(&ctx);
    ctx.workspace.put_generated_case(1, "1 2\n", "3\n").expect("case");
    ctx.workspace
        .put_upload_receipt(&crate::judge::UploadReceipt {
            adapter: "mock".to_string(),
            real_id: "900".to_string(),
            url: "https://oj.test/d/alpha/p/900".to_string(),
            uploaded_at: "2025-01-01T00:00:00Z".to_string(),
        })
        .expect("receipt");
    ctx.workspace
        .put_solve_marker(&crate::workspace::SolveMarker {
            adapter: "mock".to_string(),
            real_id: "900".to_string(),
            submission_id: "sub-900".to_string(),
            verdict: Verdict::Accepted,
            checked_at: "2025-01-01T00:00:00Z".to_string(),
        })
        .expect("marker");

    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch,gen,upload,solve").await;
    let state = runner::run_problem(
        &harness.deps(),
        &task,
        problem_id,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, ProblemState::Completed);
    // Zero adapter calls and zero LLM calls for a fully-cached problem.
    assert_eq!(harness.judge.fetch_calls(), 0);
    assert_eq!(harness.judge.upload_calls(), 0);
    assert_eq!(harness.judge.search_calls(), 0);
    assert_eq!(harness.judge.submit_calls(), 0);
    assert_eq!(harness.server.received_requests().await.unwrap_or_default().len(), 0);

    let record = problems::get(&harness.db, problem_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(record.uploaded_url.as_deref(), Some("https://oj.test/d/alpha/p/900"));
}

#[tokio::test]
async fn second_run_for_same_pid_reuses_upload() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;

    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch,gen,upload,solve").await;
    let first = runner::run_problem(
        &harness.deps(),
        &task,
        problem_id,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(first, ProblemState::Completed);
    assert_eq!(harness.judge.upload_calls(), 1);
    let first_url = problems::get(&harness.db, problem_id)
        .await
        .expect("get")
        .expect("row")
        .uploaded_url
        .expect("url");

    // A second task for the same pid finds the cached workspace.
    let (task2, problem2) = harness.seed_task("t-2", "1001", "fetch,gen,upload,solve").await;
    let second = runner::run_problem(
        &harness.deps(),
        &task2,
        problem2,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(second, ProblemState::Completed);
    assert_eq!(harness.judge.upload_calls(), 1, "no second upload");
    let second_url = problems::get(&harness.db, problem2)
        .await
        .expect("get")
        .expect("row")
        .uploaded_url
        .expect("url");
    assert_eq!(first_url, second_url);
}

#[tokio::test]
async fn transient_failures_exhaust_into_stage_exhausted() {
    let harness = TestHarness::new().await;
    for _ in 0..3 {
        harness.judge.push_fetch_failure(crate::error::AdapterError::Api {
            status: 503,
            message: "unavailable".to_string(),
        });
    }
    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch").await;

    let state = runner::run_problem(
        &harness.deps(),
        &task,
        problem_id,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(state, ProblemState::Failed(crate::pipeline::Stage::Fetch));

    let record = problems::get(&harness.db, problem_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(record.state, "failed_fetch");
    assert_eq!(record.last_error_kind.as_deref(), Some("stage_exhausted(fetch)"));
    assert_eq!(harness.judge.fetch_calls(), 3);
    assert_eq!(record.retry_count_map().get("fetch"), Some(&3));
}

#[tokio::test]
async fn non_retryable_failure_surfaces_immediately() {
    let harness = TestHarness::new().await;
    harness.judge.push_fetch_failure(crate::error::AdapterError::NotFound {
        pid: "1001".to_string(),
    });
    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch").await;

    let state = runner::run_problem(
        &harness.deps(),
        &task,
        problem_id,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(state, ProblemState::Failed(crate::pipeline::Stage::Fetch));
    assert_eq!(harness.judge.fetch_calls(), 1, "no retry for not_found");

    let record = problems::get(&harness.db, problem_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(record.last_error_kind.as_deref(), Some("not_found"));
}

#[tokio::test]
async fn cancel_while_blocked_on_gate_is_prompt() {
    let harness = TestHarness::new().await;
    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch").await;

    // Saturate the fetch gate so the runner parks on acquisition.
    harness.gates.reconfigure(crate::gate::STAGE_FETCH, 1).expect("narrow");
    let blocker = harness
        .gates
        .acquire(crate::gate::STAGE_FETCH, &CancellationToken::new())
        .await
        .expect("blocker");

    let cancel = CancellationToken::new();
    let deps = harness.deps();
    let cancel_clone = cancel.clone();
    let run = tokio::spawn(async move {
        runner::run_problem(&deps, &task, problem_id, cancel_clone).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = std::time::Instant::now();
    cancel.cancel();
    let state = tokio::time::timeout(Duration::from_millis(100), run)
        .await
        .expect("cancel observed within 100ms")
        .expect("no panic");
    assert_eq!(state, ProblemState::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(100));
    drop(blocker);

    let record = problems::get(&harness.db, problem_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(record.state, "cancelled");
    // The fetch gate never admitted the cancelled runner.
    assert_eq!(harness.judge.fetch_calls(), 0);
}

#[tokio::test]
async fn concurrent_users_see_their_own_credentials() {
    let harness = TestHarness::new().await;

    // A second user with a different target domain.
    let user_b = crate::storage::users::create_user(&harness.db, "bob", "hash", false)
        .await
        .expect("bob");
    let key = crate::storage::crypto::SecretKey::from_secret("test-harness");
    let mut bag = std::collections::HashMap::new();
    bag.insert("base_url".to_string(), "https://oj.test".to_string());
    bag.insert("domain".to_string(), "beta".to_string());
    crate::storage::adapter_configs::save_config(&harness.db, &key, user_b, "mock", &bag)
        .await
        .expect("bob config");

    let ctx_a = harness.ctx("2001").await;
    harness.seed_statement(&ctx_a);
    let mut ctx_b = harness.ctx("2002").await;
    ctx_b.user_id = user_b;
    // Give user B a distinct title so uploads do not collide.
    let statement = crate::judge::mock::MockJudge::sample_statement("Problem 2002");
    ctx_b.workspace.write_statement(&statement).expect("statement");

    let (a, b) = tokio::join!(
        crate::pipeline::stages::upload::run(&ctx_a),
        crate::pipeline::stages::upload::run(&ctx_b),
    );
    let a = a.expect("upload a");
    let b = b.expect("upload b");

    assert!(a.url.contains("/d/alpha/"), "a saw {}", a.url);
    assert!(b.url.contains("/d/beta/"), "b saw {}", b.url);
}

#[tokio::test]
async fn disabled_stages_are_never_entered() {
    let harness = TestHarness::new().await;
    harness.respond_generation("```python\necho \"$1 2\"\n```").await;
    harness.respond_solution("3").await;
    let (task, problem_id) = harness.seed_task("t-1", "1001", "fetch,gen").await;

    let state = runner::run_problem(
        &harness.deps(),
        &task,
        problem_id,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(state, ProblemState::Completed);
    assert_eq!(harness.judge.upload_calls(), 0);
    assert_eq!(harness.judge.submit_calls(), 0);

    let ctx = harness.ctx("1001").await;
    assert!(ctx.workspace.has_generated_data());
    assert!(ctx.workspace.get_upload_receipt("mock").expect("read").is_none());
}
