// Web Research Skill
// Iterative search -> fetch -> judge -> compose. URL normalization and the
// text/markdown cleaners are pure functions; the judge and composer go through
// the brain with strict JSON contracts and deterministic fallbacks.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use astra_brain::{ChatMessage, LlmClient, LlmRequest};
use astra_persona::relevance;
use astra_types::{ArtifactCandidate, SkillEvent, SkillResult, SourceCandidate};

use crate::adapters::{PageFetcher, SearchClient};
use crate::{Skill, SkillContext, SkillError};

const FETCH_CONCURRENCY: usize = 3;
const MAX_CLEAN_TEXT_CHARS: usize = 20_000;

/// Domains whose results are dropped before fetch.
const BLOCKED_DOMAINS: &[&str] = &["baidu.com", "zhihu.com", "weibo.com", "so.com"];

/// Tracking parameters stripped during normalization.
const TRACKING_PARAMS: &[&str] = &[
    "gclid", "yclid", "fbclid", "igshid", "mc_cid", "mc_eid", "ref", "ref_src", "spm",
];

static NUMBERED_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+[.)]\s").expect("numbered line pattern"));

#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub domain: String,
}

#[derive(Debug, Clone)]
struct CorpusEntry {
    url: String,
    title: Option<String>,
    domain: String,
    snippet: Option<String>,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JudgeDecision {
    Enough,
    NotEnough,
}

#[derive(Debug, Clone)]
struct JudgeVerdict {
    decision: JudgeDecision,
    score: f64,
    why: String,
    next_query: Option<String>,
    used_urls: Vec<String>,
}

// ============================================================================
// Pure helpers
// ============================================================================

fn is_tracking_param(name: &str) -> bool {
    let lowered = name.to_lowercase();
    lowered.starts_with("utm_") || TRACKING_PARAMS.contains(&lowered.as_str())
}

/// Normalize one URL: lowercase host, strip tracking params, canonical path
/// (no trailing slash), sorted query, no fragment. Idempotent.
pub fn normalize_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_lowercase();

    let mut path = parsed.path().to_string();
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    let mut normalized = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(&path);
    if !pairs.is_empty() {
        let query = pairs
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{}={}", name, value)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        normalized.push('?');
        normalized.push_str(&query);
    }
    Some(normalized)
}

/// Normalize and deduplicate, preserving first-seen order.
pub fn normalize_urls(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in urls {
        if let Some(normalized) = normalize_url(raw) {
            if seen.insert(normalized.clone()) {
                out.push(normalized);
            }
        }
    }
    out
}

fn is_blocked_domain(host: &str) -> bool {
    BLOCKED_DOMAINS
        .iter()
        .any(|blocked| host == *blocked || host.ends_with(&format!(".{}", blocked)))
}

/// Map one search result to a candidate; None for blocked or unparseable URLs.
pub fn candidate_from_result(result: &Value) -> Option<Candidate> {
    let raw_url = result.get("url").and_then(Value::as_str)?.trim();
    let normalized = normalize_url(raw_url)?;
    let parsed = url::Url::parse(&normalized).ok()?;
    let domain = parsed.host_str()?.to_string();
    if is_blocked_domain(&domain) {
        return None;
    }
    Some(Candidate {
        url: normalized,
        title: result
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string),
        snippet: result
            .get("snippet")
            .and_then(Value::as_str)
            .map(str::to_string),
        domain,
    })
}

fn is_cjk_char(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF)
}

fn cjk_ratio(text: &str) -> f64 {
    let mut letters = 0usize;
    let mut cjk = 0usize;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            letters += 1;
            if is_cjk_char(ch) {
                cjk += 1;
            }
        }
    }
    if letters == 0 {
        0.0
    } else {
        cjk as f64 / letters as f64
    }
}

fn query_is_cjk(query: &str) -> bool {
    cjk_ratio(query) > 0.2
}

fn is_garbage_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.chars().any(char::is_alphanumeric)
}

/// Reject CJK-only noise for non-CJK queries and drop garbage delimiter lines.
pub fn clean_extracted_text(text: &str, query: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    if !query_is_cjk(query) && cjk_ratio(text) > 0.3 {
        return String::new();
    }
    let cleaned: Vec<&str> = text
        .lines()
        .filter(|line| !is_garbage_line(line))
        .filter(|line| query_is_cjk(query) || cjk_ratio(line) <= 0.5)
        .collect();
    let joined = cleaned.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    trimmed.chars().take(MAX_CLEAN_TEXT_CHARS).collect()
}

/// Strip noise lines, CJK noise for non-CJK queries, and duplicate numbered
/// lines from a composed answer.
pub fn clean_answer_markdown(markdown: &str, query: &str) -> String {
    let mut seen_numbered: HashSet<String> = HashSet::new();
    let mut out: Vec<&str> = Vec::new();
    for line in markdown.lines() {
        if is_garbage_line(line) {
            continue;
        }
        if !query_is_cjk(query) && cjk_ratio(line) > 0.3 {
            continue;
        }
        if NUMBERED_LINE_RE.is_match(line) {
            let key = line.trim().to_string();
            if !seen_numbered.insert(key) {
                continue;
            }
        }
        out.push(line);
    }
    out.join("\n").trim().to_string()
}

fn fallback_answer_markdown(query: &str, corpus: &[CorpusEntry]) -> String {
    let mut lines = vec![format!(
        "Краткий итог: по запросу «{}» собраны материалы из {} источник(ов).",
        query.trim(),
        corpus.len()
    )];
    lines.push(String::new());
    for (index, entry) in corpus.iter().enumerate() {
        let fragment = entry
            .snippet
            .clone()
            .filter(|snippet| !snippet.trim().is_empty())
            .unwrap_or_else(|| entry.text.chars().take(200).collect());
        let label = entry.title.clone().unwrap_or_else(|| entry.domain.clone());
        lines.push(format!("{}. {}: {}", index + 1, label, fragment.trim()));
    }
    lines.push(String::new());
    lines.push("## Источники".to_string());
    for (index, entry) in corpus.iter().enumerate() {
        lines.push(format!("[{}] {}", index + 1, entry.url));
    }
    lines.join("\n")
}

// ============================================================================
// Skill
// ============================================================================

pub struct WebResearchSkill {
    search: Arc<dyn SearchClient>,
    fetcher: Arc<dyn PageFetcher>,
    llm: Arc<dyn LlmClient>,
}

impl WebResearchSkill {
    pub fn new(
        search: Arc<dyn SearchClient>,
        fetcher: Arc<dyn PageFetcher>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self { search, fetcher, llm }
    }

    async fn judge_research(
        &self,
        ctx: &SkillContext,
        query: &str,
        corpus: &[CorpusEntry],
        assumptions: &mut Vec<String>,
        events: &mut Vec<SkillEvent>,
    ) -> JudgeVerdict {
        let fallback = |reason: String, assumptions: &mut Vec<String>, events: &mut Vec<SkillEvent>| {
            assumptions.push(format!("judge_fallback:{}", reason));
            events.push(SkillEvent {
                message: "Оценка достаточности выполнена эвристикой".to_string(),
                phase: Some("web_research_judge".to_string()),
                reason_code: Some("judge_fallback".to_string()),
                payload: json!({ "reason": reason }),
            });
            JudgeVerdict {
                decision: JudgeDecision::Enough,
                score: 0.35,
                why: "judge_fallback".to_string(),
                next_query: None,
                used_urls: corpus.iter().map(|entry| entry.url.clone()).collect(),
            }
        };

        let digest: Vec<Value> = corpus
            .iter()
            .map(|entry| {
                json!({
                    "url": entry.url,
                    "title": entry.title,
                    "fragment": entry.text.chars().take(700).collect::<String>(),
                })
            })
            .collect();
        let schema = json!({
            "type": "object",
            "properties": {
                "decision": { "type": "string", "enum": ["ENOUGH", "NOT_ENOUGH"] },
                "score": { "type": "number" },
                "why": { "type": "string" },
                "next_query": { "type": ["string", "null"] },
                "missing_topics": { "type": "array", "items": { "type": "string" } },
                "need_sources": { "type": "integer" },
                "used_urls": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["decision", "score", "why"]
        });
        let mut request = LlmRequest::new(
            "web_research_judge",
            vec![
                ChatMessage::system(
                    "Ты оцениваешь, достаточно ли собранных источников для ответа. \
                     Верни строго JSON по схеме, без текста вне JSON.",
                ),
                ChatMessage::user(
                    json!({ "query": query, "sources": digest }).to_string(),
                ),
            ],
        );
        request.json_schema = Some(schema);
        request.max_tokens = Some(400);
        request.run_id = Some(ctx.run.id.clone());
        request.task_id = Some(ctx.task.id.clone());
        request.step_id = Some(ctx.step.id.clone());
        request.qa_mode = ctx.run.qa_mode();

        let response = match self.llm.call(request).await {
            Ok(response) if response.is_ok() => response,
            Ok(_) => return fallback("budget_exceeded".to_string(), assumptions, events),
            Err(error) => return fallback(error.error_type().to_string(), assumptions, events),
        };

        let Ok(payload) = serde_json::from_str::<Value>(response.text.trim()) else {
            return fallback("invalid_llm_json".to_string(), assumptions, events);
        };

        let decision_raw = payload
            .get("decision")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let decision = match decision_raw.as_str() {
            "ENOUGH" => JudgeDecision::Enough,
            "NOT_ENOUGH" => JudgeDecision::NotEnough,
            "" => return fallback("invalid_decision:empty".to_string(), assumptions, events),
            other => {
                return fallback(format!("invalid_decision:{}", other), assumptions, events);
            }
        };

        let score_value = payload.get("score").cloned().unwrap_or(Value::Null);
        let Some(score) = score_value.as_f64() else {
            return fallback(format!("invalid_score:{}", score_value), assumptions, events);
        };
        if !(0.0..=1.0).contains(&score) {
            return fallback(format!("invalid_score:{}", score_value), assumptions, events);
        }

        JudgeVerdict {
            decision,
            score,
            why: payload
                .get("why")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            next_query: payload
                .get("next_query")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            used_urls: payload
                .get("used_urls")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    async fn compose_answer(
        &self,
        ctx: &SkillContext,
        query: &str,
        corpus: &[CorpusEntry],
        style_hint: Option<&str>,
        assumptions: &mut Vec<String>,
    ) -> String {
        let digest: Vec<Value> = corpus
            .iter()
            .map(|entry| {
                json!({
                    "url": entry.url,
                    "title": entry.title,
                    "text": entry.text.chars().take(1500).collect::<String>(),
                })
            })
            .collect();
        let mut system = "Ты собираешь ответ по источникам. Формат строго: краткий итог первой \
                          строкой, детали списком, затем раздел `## Источники` с использованными \
                          URL. Только markdown, без выдуманных фактов."
            .to_string();
        if let Some(hint) = style_hint {
            system.push_str("\nСтиль: ");
            system.push_str(hint);
        }
        let mut request = LlmRequest::new(
            "web_research_compose",
            vec![
                ChatMessage::system(system),
                ChatMessage::user(json!({ "query": query, "sources": digest }).to_string()),
            ],
        );
        request.max_tokens = Some(900);
        request.run_id = Some(ctx.run.id.clone());
        request.task_id = Some(ctx.task.id.clone());
        request.step_id = Some(ctx.step.id.clone());
        request.qa_mode = ctx.run.qa_mode();

        match self.llm.call(request).await {
            Ok(response) if response.is_ok() && !response.text.trim().is_empty() => {
                response.text.trim().to_string()
            }
            Ok(_) => {
                assumptions.push("compose_fallback:empty_response".to_string());
                fallback_answer_markdown(query, corpus)
            }
            Err(error) => {
                assumptions.push(format!("compose_fallback:{}", error.error_type()));
                fallback_answer_markdown(query, corpus)
            }
        }
    }

    fn write_artifact(
        &self,
        ctx: &SkillContext,
        markdown: &str,
    ) -> Result<ArtifactCandidate, SkillError> {
        let dir: PathBuf = ctx
            .base_dir
            .join("artifacts")
            .join("web_research")
            .join(&ctx.run.id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("answer.md");
        std::fs::write(&path, markdown)?;
        Ok(ArtifactCandidate {
            artifact_type: "web_research_answer_md".to_string(),
            title: "Web research answer".to_string(),
            content_uri: path.to_string_lossy().into_owned(),
            created_at: Some(Utc::now()),
            meta: json!({}),
        })
    }
}

#[async_trait]
impl Skill for WebResearchSkill {
    fn name(&self) -> &'static str {
        "web_research"
    }

    async fn run(&self, inputs: Value, ctx: &SkillContext) -> Result<SkillResult, SkillError> {
        let initial_query = inputs
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| SkillError::InvalidInputs("query is required".to_string()))?
            .to_string();
        let max_rounds = inputs
            .get("max_rounds")
            .and_then(Value::as_u64)
            .unwrap_or(2)
            .clamp(1, 4) as usize;
        let max_sources_total = inputs
            .get("max_sources_total")
            .and_then(Value::as_u64)
            .unwrap_or(6)
            .clamp(1, 16) as usize;
        let max_pages_fetch = inputs
            .get("max_pages_fetch")
            .and_then(Value::as_u64)
            .unwrap_or(4)
            .clamp(1, 12) as usize;
        let style_hint = inputs
            .get("style_hint")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut assumptions: Vec<String> = Vec::new();
        let mut events: Vec<SkillEvent> = Vec::new();
        let mut corpus: Vec<CorpusEntry> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut query = initial_query.clone();
        let mut verdict: Option<JudgeVerdict> = None;
        let mut rounds_run = 0;

        for round in 1..=max_rounds {
            rounds_run = round;
            let results = match self.search.search(&query).await {
                Ok(results) => results,
                Err(error) => {
                    assumptions.push(format!("search_error:{}", error));
                    Vec::new()
                }
            };

            let candidates: Vec<Candidate> = results
                .iter()
                .filter_map(|result| {
                    candidate_from_result(&json!({
                        "url": result.url,
                        "title": result.title,
                        "snippet": result.snippet,
                    }))
                })
                .filter(|candidate| seen_urls.insert(candidate.url.clone()))
                .take(max_pages_fetch)
                .collect();

            events.push(SkillEvent {
                message: format!(
                    "Раунд {}: найдено {}, к загрузке {}",
                    round,
                    results.len(),
                    candidates.len()
                ),
                phase: Some("web_research_round".to_string()),
                reason_code: None,
                payload: json!({ "round": round, "query": query }),
            });

            let fetched: Vec<(Candidate, anyhow::Result<crate::adapters::FetchedPage>)> =
                stream::iter(candidates.into_iter().map(|candidate| {
                    let fetcher = self.fetcher.clone();
                    async move {
                        let page = fetcher.fetch(&candidate.url).await;
                        (candidate, page)
                    }
                }))
                .buffered(FETCH_CONCURRENCY)
                .collect()
                .await;

            for (candidate, page) in fetched {
                if corpus.len() >= max_sources_total {
                    break;
                }
                let page = match page {
                    Ok(page) => page,
                    Err(error) => {
                        assumptions.push(format!("fetch_error:{}:{}", candidate.url, error));
                        continue;
                    }
                };
                if let Some(error) = page.error.filter(|error| !error.is_empty()) {
                    assumptions.push(format!("fetch_error:{}:{}", candidate.url, error));
                    continue;
                }
                let text = clean_extracted_text(&page.extracted_text, &initial_query);
                if text.is_empty() {
                    assumptions.push(format!("empty_extract:{}", candidate.url));
                    continue;
                }
                if relevance::is_likely_off_topic(&initial_query, &text) {
                    assumptions.push(format!("source_off_topic:{}", candidate.url));
                    events.push(SkillEvent {
                        message: format!("Источник не по теме: {}", candidate.domain),
                        phase: Some("web_research_filter".to_string()),
                        reason_code: Some("source_off_topic".to_string()),
                        payload: json!({ "url": candidate.url }),
                    });
                    continue;
                }
                corpus.push(CorpusEntry {
                    url: candidate.url,
                    title: candidate.title,
                    domain: candidate.domain,
                    snippet: candidate.snippet,
                    text,
                });
            }

            if corpus.is_empty() {
                continue;
            }

            let round_verdict = self
                .judge_research(ctx, &query, &corpus, &mut assumptions, &mut events)
                .await;
            match round_verdict.decision {
                JudgeDecision::Enough => {
                    verdict = Some(round_verdict);
                    break;
                }
                JudgeDecision::NotEnough => {
                    if let Some(next_query) = round_verdict.next_query.clone() {
                        verdict = Some(round_verdict);
                        if round < max_rounds {
                            query = next_query;
                            continue;
                        }
                        break;
                    }
                    assumptions.push("judge_next_query_missing".to_string());
                    verdict = Some(round_verdict);
                    break;
                }
            }
        }

        if corpus.is_empty() {
            return Ok(SkillResult {
                what_i_did: format!(
                    "Веб-исследование по запросу «{}» не дало пригодных источников.",
                    initial_query
                ),
                sources: vec![],
                facts: vec![],
                artifacts: vec![],
                confidence: 0.0,
                assumptions,
                events,
            });
        }

        let verdict = verdict.unwrap_or(JudgeVerdict {
            decision: JudgeDecision::Enough,
            score: 0.35,
            why: "single_round".to_string(),
            next_query: None,
            used_urls: corpus.iter().map(|entry| entry.url.clone()).collect(),
        });

        let raw_markdown = self
            .compose_answer(ctx, &initial_query, &corpus, style_hint.as_deref(), &mut assumptions)
            .await;
        let markdown = clean_answer_markdown(&raw_markdown, &initial_query);
        let artifact = self.write_artifact(ctx, &markdown)?;

        let retrieved_at = Utc::now();
        let sources: Vec<SourceCandidate> = corpus
            .iter()
            .map(|entry| SourceCandidate {
                url: entry.url.clone(),
                title: entry.title.clone(),
                domain: Some(entry.domain.clone()),
                quality: Some(verdict.score),
                retrieved_at: Some(retrieved_at),
                snippet: entry.snippet.clone(),
                pinned: false,
            })
            .collect();

        events.push(SkillEvent {
            message: format!(
                "Веб-исследование завершено: {} источник(ов), {} раунд(а)",
                sources.len(),
                rounds_run
            ),
            phase: Some("web_research_done".to_string()),
            reason_code: None,
            payload: json!({
                "rounds": rounds_run,
                "score": verdict.score,
                "why": verdict.why,
            }),
        });

        Ok(SkillResult {
            what_i_did: format!(
                "Собрал ответ по запросу «{}»: {} источник(ов) за {} раунд(а).",
                initial_query,
                sources.len(),
                rounds_run
            ),
            sources,
            facts: vec![],
            artifacts: vec![artifact],
            confidence: verdict.score.max(0.05),
            assumptions,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent_and_collapses_tracking_variants() {
        let urls = vec![
            "https://example.org/path/?b=2&utm_source=ad&a=1".to_string(),
            "https://example.org/path?a=1&b=2".to_string(),
            "https://example.org/path/?a=1&b=2&utm_medium=cpc".to_string(),
        ];
        let normalized = normalize_urls(&urls);
        assert_eq!(normalized, vec!["https://example.org/path?a=1&b=2".to_string()]);

        let once = normalize_url("https://EXAMPLE.org/Path/?b=2&a=1&gclid=x").unwrap();
        assert_eq!(normalize_url(&once).unwrap(), once);
    }

    #[test]
    fn blocked_domain_candidate_is_dropped() {
        let candidate = candidate_from_result(&json!({
            "url": "https://www.baidu.com/s?wd=tokyo+ghoul"
        }));
        assert!(candidate.is_none());
    }

    #[test]
    fn candidate_keeps_title_and_domain() {
        let candidate = candidate_from_result(&json!({
            "url": "https://Example.org/a/?utm_source=x",
            "title": "A",
            "snippet": "s",
        }))
        .unwrap();
        assert_eq!(candidate.url, "https://example.org/a");
        assert_eq!(candidate.domain, "example.org");
        assert_eq!(candidate.title.as_deref(), Some("A"));
    }

    #[test]
    fn cjk_noise_is_rejected_for_non_cjk_query() {
        let noisy = "你好世界".repeat(80);
        assert_eq!(clean_extracted_text(&noisy, "кто такой кен канеки"), "");
        // CJK query keeps CJK text.
        assert!(!clean_extracted_text(&noisy, "你好世界是什么").is_empty());
    }

    #[test]
    fn markdown_cleaner_removes_noise_and_duplicates() {
        let markdown = "Краткий итог: Ответ найден.\n####!!!!!####\n你好你好你好你好你好\n1. Факт A.\n1. Факт A.\n2. Факт B.\n";
        let cleaned = clean_answer_markdown(markdown, "кто такой кен канеки");
        assert!(!cleaned.contains("你好"));
        assert!(!cleaned.contains("####!!!!!####"));
        assert_eq!(cleaned.matches("1. Факт A.").count(), 1);
        assert!(cleaned.contains("2. Факт B."));
    }

    #[test]
    fn fallback_answer_has_summary_and_sources_block() {
        let corpus = vec![CorpusEntry {
            url: "https://example.org/a".to_string(),
            title: Some("A".to_string()),
            domain: "example.org".to_string(),
            snippet: Some("snippet".to_string()),
            text: "text".to_string(),
        }];
        let markdown = fallback_answer_markdown("тестовый запрос", &corpus);
        assert!(markdown.starts_with("Краткий итог:"));
        assert!(markdown.contains("## Источники"));
        assert!(markdown.contains("https://example.org/a"));
    }
}
