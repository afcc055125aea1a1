// Planner
// Maps an ACT run onto ordered plan steps with dependency edges. Table-driven
// cue detection; MEMORY_COMMIT appears only on explicit memory-save triggers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use astra_types::{
    ActHint, IntentDecision, PlanStep, Run, RunMode, StepKind, StepStatus,
};

use crate::intent::FAST_CHAT_MEMORY_RE;

static RESEARCH_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(найди|поищи|погугли|исследуй|research|новост|источник|актуальн|сравни цены)")
        .expect("research cue pattern")
});
static BROWSER_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(браузер|browser|вкладк|сайт|страниц)").expect("browser cue pattern")
});
static FILE_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(файл|папк|folder|file|разбери загрузки|наведи порядок)")
        .expect("file cue pattern")
});
static CODE_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(код|рефактор|напиши функцию|исправь баг|ide)").expect("code cue pattern")
});
static DANGER_CUES: &[(&str, &str)] = &[
    (r"(?i)\b(удали|сотри|delete)", "delete_file"),
    (r"(?i)\b(оплати|переведи день|подписк|payment)", "payment"),
    (r"(?i)\b(отправь|напиши ему|напиши ей|send)", "send_message"),
    (r"(?i)\b(опубликуй|запость|publish)", "publish"),
    (r"(?i)\b(пароль|настройки аккаунта|учётн)", "account_settings"),
];

static DANGER_RES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    DANGER_CUES
        .iter()
        .map(|(pattern, flag)| (Regex::new(pattern).expect("danger cue pattern"), *flag))
        .collect()
});

pub fn detect_danger_flags(query: &str) -> Vec<String> {
    let mut flags = Vec::new();
    for (re, flag) in DANGER_RES.iter() {
        if re.is_match(query) && !flags.iter().any(|existing: &String| existing == flag) {
            flags.push((*flag).to_string());
        }
    }
    flags
}

pub fn has_memory_save_trigger(query: &str) -> bool {
    FAST_CHAT_MEMORY_RE.is_match(query)
}

fn computer_kind_for_query(query: &str) -> StepKind {
    if BROWSER_CUE_RE.is_match(query) {
        StepKind::BrowserResearchUi
    } else if FILE_CUE_RE.is_match(query) {
        StepKind::FileOrganize
    } else if CODE_CUE_RE.is_match(query) {
        StepKind::CodeAssist
    } else {
        StepKind::ComputerActions
    }
}

pub struct Planner;

impl Planner {
    /// Build the ordered step list for an ACT run. Steps chain linearly:
    /// research feeds actions, actions feed the final summary response.
    pub fn plan(run: &Run, decision: Option<&IntentDecision>) -> Vec<PlanStep> {
        let query = run.query_text.as_str();
        let act_hint: Option<&ActHint> = decision.and_then(|d| d.intent.act_hint());
        let hinted_kinds: Vec<StepKind> = decision
            .map(|d| d.plan_hint.clone())
            .unwrap_or_default();

        let mut danger_flags = detect_danger_flags(query);
        if let Some(hint) = act_hint {
            for flag in &hint.danger_flags {
                if !danger_flags.contains(flag) {
                    danger_flags.push(flag.clone());
                }
            }
        }
        let requires_approval = run.mode == RunMode::ExecuteConfirm || !danger_flags.is_empty();

        let mut kinds: Vec<StepKind> = Vec::new();
        if RESEARCH_CUE_RE.is_match(query) || hinted_kinds.contains(&StepKind::WebResearch) {
            kinds.push(StepKind::WebResearch);
        }
        let computer_kind = hinted_kinds
            .iter()
            .copied()
            .find(|kind| kind.is_computer_kind())
            .unwrap_or_else(|| computer_kind_for_query(query));
        if run.mode != RunMode::Research {
            kinds.push(computer_kind);
        }
        if has_memory_save_trigger(query) || hinted_kinds.contains(&StepKind::MemoryCommit) {
            kinds.push(StepKind::MemoryCommit);
        }
        kinds.push(StepKind::ChatResponse);

        let mut steps: Vec<PlanStep> = Vec::new();
        for (index, kind) in kinds.into_iter().enumerate() {
            let depends_on = steps.last().map(|prev: &PlanStep| vec![prev.id.clone()]).unwrap_or_default();
            let is_computer = kind.is_computer_kind();
            let step = PlanStep {
                id: astra_types::new_id(),
                run_id: run.id.clone(),
                step_index: index as i64,
                kind,
                skill_name: astra_skills::skill_name_for_kind(kind).to_string(),
                title: Some(step_title(kind, query)),
                inputs: step_inputs(kind, query),
                depends_on,
                status: StepStatus::Created,
                success_criteria: None,
                danger_flags: if is_computer { danger_flags.clone() } else { Vec::new() },
                requires_approval: is_computer && requires_approval,
                artifacts_expected: if kind == StepKind::WebResearch {
                    vec!["web_research_answer_md".to_string()]
                } else {
                    Vec::new()
                },
            };
            steps.push(step);
        }
        steps
    }
}

fn step_title(kind: StepKind, query: &str) -> String {
    let short: String = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let short: String = short.chars().take(60).collect();
    match kind {
        StepKind::WebResearch => format!("Исследование: {}", short),
        StepKind::MemoryCommit => "Сохранение в память".to_string(),
        StepKind::ChatResponse => "Итоговый ответ".to_string(),
        StepKind::BrowserResearchUi => format!("Работа в браузере: {}", short),
        StepKind::FileOrganize => format!("Работа с файлами: {}", short),
        StepKind::CodeAssist => format!("Работа с кодом: {}", short),
        StepKind::ComputerActions => format!("Действия на компьютере: {}", short),
    }
}

fn step_inputs(kind: StepKind, query: &str) -> serde_json::Value {
    match kind {
        StepKind::WebResearch => json!({ "query": query, "mode": "deep" }),
        StepKind::MemoryCommit => json!({ "content": query, "origin": "plan" }),
        _ => json!({ "query": query }),
    }
}

/// DAG validation: unique indices, known dependencies, no cycles.
pub fn validate_plan(steps: &[PlanStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("plan has no steps".to_string());
    }
    let mut indices = std::collections::HashSet::new();
    let ids: std::collections::HashSet<&str> = steps.iter().map(|step| step.id.as_str()).collect();
    if ids.len() != steps.len() {
        return Err("duplicate step id".to_string());
    }
    for step in steps {
        if !indices.insert(step.step_index) {
            return Err(format!("duplicate step_index {}", step.step_index));
        }
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(format!("step {} depends on unknown step {}", step.id, dep));
            }
        }
    }
    // Cycle check by repeated elimination of satisfiable steps.
    let mut resolved: std::collections::HashSet<&str> = std::collections::HashSet::new();
    loop {
        let before = resolved.len();
        for step in steps {
            if resolved.contains(step.id.as_str()) {
                continue;
            }
            if step.depends_on.iter().all(|dep| resolved.contains(dep.as_str())) {
                resolved.insert(step.id.as_str());
            }
        }
        if resolved.len() == steps.len() {
            return Ok(());
        }
        if resolved.len() == before {
            return Err("cycle detected in plan".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn act_run(query: &str, mode: RunMode) -> Run {
        Run {
            id: "run-1".to_string(),
            project_id: "p-1".to_string(),
            query_text: query.to_string(),
            mode,
            purpose: None,
            parent_run_id: None,
            status: astra_types::RunStatus::Created,
            meta: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plain_action_plan_ends_with_chat_response() {
        let run = act_run("открой браузер и проверь почту", RunMode::AutopilotSafe);
        let steps = Planner::plan(&run, None);
        assert!(validate_plan(&steps).is_ok());
        assert_eq!(steps.last().unwrap().kind, StepKind::ChatResponse);
        assert!(steps.iter().any(|step| step.kind == StepKind::BrowserResearchUi));
        assert!(!steps.iter().any(|step| step.kind == StepKind::MemoryCommit));
    }

    #[test]
    fn memory_commit_requires_explicit_trigger() {
        let run = act_run("запомни: резервные копии лежат на внешнем диске", RunMode::PlanOnly);
        let steps = Planner::plan(&run, None);
        assert!(steps.iter().any(|step| step.kind == StepKind::MemoryCommit));

        let run = act_run("разбери загрузки по папкам", RunMode::PlanOnly);
        let steps = Planner::plan(&run, None);
        assert!(!steps.iter().any(|step| step.kind == StepKind::MemoryCommit));
    }

    #[test]
    fn danger_cues_set_flags_and_approval() {
        let run = act_run("удали старые файлы из загрузок", RunMode::AutopilotSafe);
        let steps = Planner::plan(&run, None);
        let computer = steps.iter().find(|step| step.kind.is_computer_kind()).unwrap();
        assert!(computer.danger_flags.contains(&"delete_file".to_string()));
        assert!(computer.requires_approval);
    }

    #[test]
    fn research_cue_adds_web_step_before_actions() {
        let run = act_run("найди актуальные цены и открой таблицу", RunMode::AutopilotSafe);
        let steps = Planner::plan(&run, None);
        let research_index = steps.iter().position(|s| s.kind == StepKind::WebResearch).unwrap();
        let action_index = steps.iter().position(|s| s.kind.is_computer_kind()).unwrap();
        assert!(research_index < action_index);
        // Linear chain: each later step depends on the previous one.
        assert!(steps[action_index].depends_on.contains(&steps[research_index].id));
    }

    #[test]
    fn plan_indices_are_unique_and_ordered() {
        let run = act_run("найди новости и запомни выводы", RunMode::Research);
        let steps = Planner::plan(&run, None);
        for (index, step) in steps.iter().enumerate() {
            assert_eq!(step.step_index, index as i64);
        }
    }
}
