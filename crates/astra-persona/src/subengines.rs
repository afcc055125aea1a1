// Sub-engine routing cues and their prompt blocks. Each engine contributes a
// bounded block to the dynamic prompt; a disengaged engine stays one line.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use astra_types::ChatTurn;

use crate::tone::{self, Signals};

const COMPLEXITY_TOKENS: &[&str] = &[
    "разбей", "паралл", "сложн", "архитект", "декомпоз", "стратег", "многошаг", "multi-step",
    "complex", "plan",
];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineFlags {
    pub task_complex: bool,
    pub workflow: bool,
    pub conversation: bool,
    pub autonomy: bool,
    pub dev_task: bool,
    pub self_improve: bool,
}

impl EngineFlags {
    pub fn any_engaged(&self) -> bool {
        self.task_complex
            || self.workflow
            || self.conversation
            || self.autonomy
            || self.dev_task
            || self.self_improve
    }
}

fn history_user_tail_len(history: &[ChatTurn], limit: usize) -> usize {
    tone::history_user_texts(history, limit).len()
}

pub fn is_complex_task(text: &str, signals: &Signals, history: &[ChatTurn]) -> bool {
    let normalized = tone::normalized_text(text);
    if normalized.is_empty() {
        return false;
    }
    let words = normalized.split_whitespace().count();
    let token_hits = COMPLEXITY_TOKENS
        .iter()
        .filter(|token| normalized.contains(*token))
        .count();

    let mut score = 0;
    score += if words >= 18 { 2 } else { 0 };
    score += if words >= 30 { 2 } else { 0 };
    score += if token_hits >= 1 { 2 } else { 0 };
    score += if token_hits >= 2 { 1 } else { 0 };
    score += if normalized.matches('?').count() >= 2 { 1 } else { 0 };
    score += if signals.technical_density >= 3 { 1 } else { 0 };
    score += if signals.urgency >= 1 && words >= 12 { 1 } else { 0 };
    if !history.is_empty() && history_user_tail_len(history, 6) >= 3 {
        score += 1;
    }
    score >= 3
}

pub fn is_workflow_task(text: &str, signals: &Signals, task_complex: bool, history: &[ChatTurn]) -> bool {
    let normalized = tone::normalized_text(text);
    if normalized.is_empty() {
        return false;
    }
    let words = normalized.split_whitespace().count();
    let token_hits = tone::WORKFLOW_TOKENS
        .iter()
        .filter(|token| normalized.contains(*token))
        .count();

    let mut score = 0;
    score += if token_hits >= 1 { 3 } else { 0 };
    score += if token_hits >= 2 { 1 } else { 0 };
    score += if words >= 12 { 1 } else { 0 };
    score += if words >= 20 { 1 } else { 0 };
    score += if signals.technical_density >= 2 { 1 } else { 0 };
    score += if task_complex { 1 } else { 0 };
    if !history.is_empty() && history_user_tail_len(history, 6) >= 3 {
        score += 1;
    }
    score >= 4
}

pub fn detect_engine_flags(text: &str, signals: &Signals, history: &[ChatTurn]) -> EngineFlags {
    let task_complex = is_complex_task(text, signals, history);
    EngineFlags {
        task_complex,
        workflow: is_workflow_task(text, signals, task_complex, history),
        conversation: signals.conversation_cues > 0,
        autonomy: signals.autonomy_cues > 0,
        dev_task: signals.dev_task_cues > 0,
        self_improve: signals.self_improve_cues > 0,
    }
}

/// Heuristic block payloads. The engaged variants stay compact; the kernel
/// carries no multi-agent frameworks behind them.
pub fn parallel_think_block(engaged: bool, user_message: &str) -> Value {
    if !engaged {
        return json!({
            "mode": "single",
            "task_complex": false,
            "items": [],
            "summary": "Parallel crew not engaged.",
        });
    }
    let focus = crate::relevance::query_focus_tokens(user_message, 3).join(", ");
    json!({
        "mode": "parallel",
        "task_complex": true,
        "items": [
            { "role": "analyst", "view": format!("Разбор по сути: {}", focus) },
            { "role": "critic", "view": "Проверка рисков и пропущенных шагов." },
        ],
        "summary": format!("Параллельный разбор по направлениям: {}.", focus),
    })
}

pub fn workflow_block(engaged: bool) -> Value {
    if !engaged {
        return json!({
            "mode": "single",
            "workflow": false,
            "executed": false,
            "summary": "Workflow graph not engaged.",
            "state": {},
        });
    }
    json!({
        "mode": "graph",
        "workflow": true,
        "executed": true,
        "summary": "Запрос разложен в граф шагов: вход -> обработка -> проверка -> итог.",
        "state": { "nodes": 4 },
    })
}

pub fn conversation_block(engaged: bool) -> Value {
    if !engaged {
        return json!({
            "mode": "single",
            "conversation": false,
            "executed": false,
            "turns": [],
            "summary": "Dialog engine not engaged.",
        });
    }
    json!({
        "mode": "dialog",
        "conversation": true,
        "executed": true,
        "turns": [],
        "summary": "Диалоговый режим: держи нить обсуждения и уточняй развилки.",
    })
}

pub fn autonomy_block(engaged: bool) -> Value {
    if !engaged {
        return json!({
            "mode": "single",
            "autonomy": false,
            "started": false,
            "tasks": [],
            "summary": "Autonomy engine not engaged.",
        });
    }
    json!({
        "mode": "autonomy",
        "autonomy": true,
        "started": true,
        "tasks": [],
        "summary": "Автономный режим: предложи план самостоятельных шагов с контрольными точками.",
    })
}

pub fn dev_block(engaged: bool) -> Value {
    if !engaged {
        return json!({
            "mode": "single",
            "dev_task": false,
            "executed": false,
            "generated_code": "",
            "summary": "Dev pipeline not engaged.",
        });
    }
    json!({
        "mode": "dev",
        "dev_task": true,
        "executed": true,
        "generated_code": "",
        "summary": "Dev-режим: требования -> набросок решения -> проверка краёв.",
    })
}

pub fn self_improve_block(engaged: bool) -> Value {
    if !engaged {
        return json!({
            "self_improve": false,
            "updated": false,
            "preferences": [],
            "summary": "Self-improve loop not engaged.",
        });
    }
    json!({
        "self_improve": true,
        "updated": false,
        "preferences": [],
        "summary": "Цикл самоулучшения: зафиксируй обратную связь в профиле.",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tone::signal_counts;

    #[test]
    fn long_structured_request_is_complex() {
        let text = "Разбей сложную задачу на параллельные шаги: нужен план архитектуры, \
                    декомпозиция модулей и стратегия тестирования для большого сервиса";
        let signals = signal_counts(text);
        assert!(is_complex_task(text, &signals, &[]));
    }

    #[test]
    fn short_chat_is_not_complex() {
        let text = "привет как дела";
        let signals = signal_counts(text);
        assert!(!is_complex_task(text, &signals, &[]));
        assert!(!detect_engine_flags(text, &signals, &[]).any_engaged());
    }

    #[test]
    fn workflow_needs_tokens() {
        let text = "собери pipeline оркестрации задач в единый workflow граф";
        let signals = signal_counts(text);
        let complex = is_complex_task(text, &signals, &[]);
        assert!(is_workflow_task(text, &signals, complex, &[]));
    }

    #[test]
    fn disengaged_blocks_are_single_line() {
        let block = parallel_think_block(false, "");
        assert_eq!(block["mode"], "single");
        assert_eq!(block["summary"], "Parallel crew not engaged.");
    }
}
