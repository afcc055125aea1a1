// Deep-mode web research scenarios with scripted search/fetch/LLM fakes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use astra_brain::{BrainError, LlmClient, LlmRequest, LlmResponse, ResponseStatus};
use astra_core::SqliteStore;
use astra_skills::{
    FetchedPage, PageFetcher, SearchClient, SearchResult, Skill, SkillContext, WebResearchSkill,
};
use astra_types::{PlanStep, Run, RunMode, RunStatus, StepKind, StepStatus, Task, TaskStatus};

struct FakeSearchClient {
    responses: HashMap<String, Vec<SearchResult>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSearchClient {
    fn new(responses: HashMap<String, Vec<SearchResult>>) -> Self {
        Self {
            responses,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SearchClient for FakeSearchClient {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchResult>> {
        self.calls.lock().unwrap().push(query.to_string());
        Ok(self.responses.get(query).cloned().unwrap_or_default())
    }
}

struct FakeFetcher {
    errors: HashMap<String, String>,
    text_for: fn(&str) -> String,
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedPage> {
        if let Some(error) = self.errors.get(url) {
            return Ok(FetchedPage {
                final_url: url.to_string(),
                extracted_text: String::new(),
                error: Some(error.clone()),
            });
        }
        Ok(FetchedPage {
            final_url: url.to_string(),
            extracted_text: (self.text_for)(url),
            error: None,
        })
    }
}

fn default_text(url: &str) -> String {
    format!("text for initial query про {}", url)
}

/// Scripted judge responses; compose always fails so the deterministic
/// fallback composer runs (as it would without a local model).
struct ScriptedLlm {
    judge_responses: Mutex<Vec<Result<Value, ()>>>,
}

impl ScriptedLlm {
    fn new(judge_responses: Vec<Result<Value, ()>>) -> Self {
        Self {
            judge_responses: Mutex::new(judge_responses),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, BrainError> {
        if request.purpose == "web_research_judge" {
            let mut responses = self.judge_responses.lock().unwrap();
            let next = if responses.is_empty() {
                Err(())
            } else {
                responses.remove(0)
            };
            return match next {
                Ok(payload) => Ok(LlmResponse {
                    text: payload.to_string(),
                    usage: None,
                    provider: "local".to_string(),
                    model_id: "stub".to_string(),
                    latency_ms: 1,
                    cache_hit: false,
                    route_reason: "strict_local".to_string(),
                    status: ResponseStatus::Ok,
                    error_type: None,
                    http_status: None,
                    retry_count: 0,
                }),
                Err(()) => Err(BrainError::InvalidJson),
            };
        }
        Err(BrainError::Connection("compose offline".to_string()))
    }
}

fn ctx(base_dir: PathBuf, query: &str) -> SkillContext {
    let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
    SkillContext {
        run: Run {
            id: "run-web-1".to_string(),
            project_id: "p-1".to_string(),
            query_text: query.to_string(),
            mode: RunMode::Research,
            purpose: None,
            parent_run_id: None,
            status: RunStatus::Running,
            meta: json!({}),
            created_at: chrono::Utc::now(),
        },
        step: PlanStep {
            id: "step-1".to_string(),
            run_id: "run-web-1".to_string(),
            step_index: 0,
            kind: StepKind::WebResearch,
            skill_name: "web_research".to_string(),
            title: None,
            inputs: json!({}),
            depends_on: vec![],
            status: StepStatus::Running,
            success_criteria: None,
            danger_flags: vec![],
            requires_approval: false,
            artifacts_expected: vec![],
        },
        task: Task {
            id: "task-1".to_string(),
            run_id: "run-web-1".to_string(),
            step_id: "step-1".to_string(),
            attempt: 1,
            status: TaskStatus::Running,
            created_at: chrono::Utc::now(),
        },
        settings: json!({ "search": { "provider": "ddgs" } }),
        base_dir,
        store,
    }
}

fn result(url: &str, title: &str) -> SearchResult {
    SearchResult {
        url: url.to_string(),
        title: Some(title.to_string()),
        snippet: Some(format!("snippet {}", title)),
    }
}

fn enough_verdict(urls: &[&str], score: f64) -> Value {
    json!({
        "decision": "ENOUGH",
        "score": score,
        "why": "enough",
        "next_query": null,
        "missing_topics": [],
        "need_sources": 0,
        "used_urls": urls,
    })
}

#[tokio::test]
async fn deep_mode_single_round_enough() {
    let tmp = tempfile::tempdir().unwrap();
    let search = Arc::new(FakeSearchClient::new(HashMap::from([(
        "initial query".to_string(),
        vec![
            result("https://example.org/a", "A"),
            result("https://example.net/b", "B"),
        ],
    )])));
    let fetcher = Arc::new(FakeFetcher {
        errors: HashMap::new(),
        text_for: default_text,
    });
    let llm = Arc::new(ScriptedLlm::new(vec![Ok(enough_verdict(
        &["https://example.org/a", "https://example.net/b"],
        0.9,
    ))]));
    let skill = WebResearchSkill::new(search, fetcher, llm);
    let ctx = ctx(tmp.path().to_path_buf(), "initial query");

    let result = skill
        .run(json!({ "query": "initial query", "mode": "deep" }), &ctx)
        .await
        .unwrap();

    assert!(result.confidence > 0.0);
    assert!(result.sources.len() >= 2);
    assert!(!result.artifacts.is_empty());
    assert!(PathBuf::from(&result.artifacts[0].content_uri).exists());
}

#[tokio::test]
async fn deep_mode_two_rounds_until_enough() {
    let tmp = tempfile::tempdir().unwrap();
    let search = Arc::new(FakeSearchClient::new(HashMap::from([
        (
            "initial query".to_string(),
            vec![result("https://example.org/a", "A")],
        ),
        (
            "refined query".to_string(),
            vec![result("https://example.net/b", "B")],
        ),
    ])));
    let fetcher = Arc::new(FakeFetcher {
        errors: HashMap::new(),
        text_for: default_text,
    });
    let llm = Arc::new(ScriptedLlm::new(vec![
        Ok(json!({
            "decision": "NOT_ENOUGH",
            "score": 0.3,
            "why": "need more",
            "next_query": "refined query",
            "missing_topics": ["details"],
            "need_sources": 1,
            "used_urls": ["https://example.org/a"],
        })),
        Ok(enough_verdict(
            &["https://example.org/a", "https://example.net/b"],
            0.8,
        )),
    ]));
    let skill = WebResearchSkill::new(search.clone(), fetcher, llm);
    let ctx = ctx(tmp.path().to_path_buf(), "initial query");

    let outcome = skill
        .run(
            json!({ "query": "initial query", "mode": "deep", "max_rounds": 3 }),
            &ctx,
        )
        .await
        .unwrap();

    assert!(outcome.confidence > 0.0);
    assert!(outcome.sources.len() >= 2);
    assert_eq!(
        search.calls.lock().unwrap().as_slice(),
        &["initial query".to_string(), "refined query".to_string()]
    );
}

#[tokio::test]
async fn invalid_judge_json_uses_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let search = Arc::new(FakeSearchClient::new(HashMap::from([(
        "initial query".to_string(),
        vec![result("https://example.org/a", "A")],
    )])));
    let fetcher = Arc::new(FakeFetcher {
        errors: HashMap::new(),
        text_for: default_text,
    });
    let llm = Arc::new(ScriptedLlm::new(vec![Err(())]));
    let skill = WebResearchSkill::new(search, fetcher, llm);
    let ctx = ctx(tmp.path().to_path_buf(), "initial query");

    let outcome = skill
        .run(json!({ "query": "initial query", "mode": "deep" }), &ctx)
        .await
        .unwrap();

    assert!(outcome.confidence > 0.0);
    assert!(outcome
        .assumptions
        .iter()
        .any(|item| item.starts_with("judge_fallback:invalid_json")));
    assert!(!outcome.artifacts.is_empty());
    assert!(outcome
        .events
        .iter()
        .any(|event| event.reason_code.as_deref() == Some("judge_fallback")));
}

#[tokio::test]
async fn fetch_error_keeps_other_sources() {
    let tmp = tempfile::tempdir().unwrap();
    let search = Arc::new(FakeSearchClient::new(HashMap::from([(
        "initial query".to_string(),
        vec![
            result("https://example.org/a", "A"),
            result("https://example.net/b", "B"),
        ],
    )])));
    let fetcher = Arc::new(FakeFetcher {
        errors: HashMap::from([(
            "https://example.org/a".to_string(),
            "request_failed:Timeout".to_string(),
        )]),
        text_for: default_text,
    });
    let llm = Arc::new(ScriptedLlm::new(vec![Ok(enough_verdict(
        &["https://example.net/b"],
        0.6,
    ))]));
    let skill = WebResearchSkill::new(search, fetcher, llm);
    let ctx = ctx(tmp.path().to_path_buf(), "initial query");

    let outcome = skill
        .run(json!({ "query": "initial query", "mode": "deep" }), &ctx)
        .await
        .unwrap();

    assert!(outcome.confidence > 0.0);
    assert_eq!(outcome.sources.len(), 1);
    assert_eq!(outcome.sources[0].url, "https://example.net/b");
    assert!(outcome
        .assumptions
        .iter()
        .any(|item| item.contains("request_failed:Timeout")));
}

#[tokio::test]
async fn not_enough_without_next_query_returns_fallback_answer() {
    let tmp = tempfile::tempdir().unwrap();
    let search = Arc::new(FakeSearchClient::new(HashMap::from([(
        "initial query".to_string(),
        vec![result("https://example.org/a", "A")],
    )])));
    let fetcher = Arc::new(FakeFetcher {
        errors: HashMap::new(),
        text_for: default_text,
    });
    let llm = Arc::new(ScriptedLlm::new(vec![Ok(json!({
        "decision": "NOT_ENOUGH",
        "score": 0.2,
        "why": "need more",
        "next_query": null,
        "missing_topics": ["details"],
        "need_sources": 1,
        "used_urls": ["https://example.org/a"],
    }))]));
    let skill = WebResearchSkill::new(search, fetcher, llm);
    let ctx = ctx(tmp.path().to_path_buf(), "initial query");

    let outcome = skill
        .run(json!({ "query": "initial query", "mode": "deep" }), &ctx)
        .await
        .unwrap();

    assert!(!outcome.sources.is_empty());
    assert!(!outcome.artifacts.is_empty());
    assert!(outcome
        .assumptions
        .iter()
        .any(|item| item.contains("judge_next_query_missing")));
}

#[tokio::test]
async fn invalid_judge_decision_and_score_use_fallback() {
    for (verdict, marker) in [
        (
            json!({
                "decision": "",
                "score": 0.0,
                "why": "invalid payload",
                "next_query": null,
                "missing_topics": [],
                "need_sources": 0,
                "used_urls": [],
            }),
            "judge_fallback:invalid_decision:empty",
        ),
        (
            json!({
                "decision": "ENOUGH",
                "score": 5,
                "why": "bad score",
                "next_query": null,
                "missing_topics": [],
                "need_sources": 0,
                "used_urls": ["https://example.org/a"],
            }),
            "judge_fallback:invalid_score:5",
        ),
    ] {
        let tmp = tempfile::tempdir().unwrap();
        let search = Arc::new(FakeSearchClient::new(HashMap::from([(
            "initial query".to_string(),
            vec![result("https://example.org/a", "A")],
        )])));
        let fetcher = Arc::new(FakeFetcher {
            errors: HashMap::new(),
            text_for: default_text,
        });
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(verdict)]));
        let skill = WebResearchSkill::new(search, fetcher, llm);
        let ctx = ctx(tmp.path().to_path_buf(), "initial query");

        let outcome = skill
            .run(
                json!({ "query": "initial query", "mode": "deep", "max_rounds": 2 }),
                &ctx,
            )
            .await
            .unwrap();

        assert!(!outcome.sources.is_empty());
        assert!(!outcome.artifacts.is_empty());
        assert!(
            outcome.assumptions.iter().any(|item| item == marker),
            "missing assumption {} in {:?}",
            marker,
            outcome.assumptions
        );
        assert!(outcome
            .events
            .iter()
            .any(|event| event.reason_code.as_deref() == Some("judge_fallback")));
    }
}

#[tokio::test]
async fn off_topic_sources_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let query = "сюжет хентая эйфория";
    let search = Arc::new(FakeSearchClient::new(HashMap::from([(
        query.to_string(),
        vec![result("https://ru.wikipedia.org/wiki/term", "Сюжет")],
    )])));
    let fetcher = Arc::new(FakeFetcher {
        errors: HashMap::new(),
        text_for: |_| "Погода в Москве завтра солнечная, ожидается потепление и лёгкий ветер.".to_string(),
    });
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let skill = WebResearchSkill::new(search, fetcher, llm);
    let ctx = ctx(tmp.path().to_path_buf(), query);

    let outcome = skill
        .run(json!({ "query": query, "mode": "deep", "max_rounds": 1 }), &ctx)
        .await
        .unwrap();

    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.confidence, 0.0);
    assert!(outcome
        .assumptions
        .iter()
        .any(|item| item.contains("source_off_topic")));
    assert!(outcome
        .events
        .iter()
        .any(|event| event.reason_code.as_deref() == Some("source_off_topic")));
}
