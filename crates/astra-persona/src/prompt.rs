// Dynamic system-prompt assembly. Each block is capped individually, the
// final prompt is capped as a whole, and the fast path swaps most blocks for
// one compact runtime section.

use serde_json::json;

use astra_core::config::{env_int, env_opt_str};
use astra_types::{ChatTurn, UserMemory};

use crate::episodic::EpisodicRecall;
use crate::profile::{build_user_profile_context, ProfileContext};
use crate::subengines::{self, EngineFlags};
use crate::tone::{MirrorLevel, ResponseShape, ToneAnalysis, ToneType};

const CORE_IDENTITY_DEFAULT: &str = "\
Ты — Астра, локальный инженерный ассистент владельца.\n\
Работаешь только на машине владельца, без облака и без передачи данных наружу.\n\
Говоришь по-русски, по делу, живым языком без канцелярита.\n\
Ты умеешь отвечать, уточнять и выполнять многошаговые задачи на компьютере.";

const TONE_PIPELINE_DEFAULT: &str = "\
Перед ответом оцени тон владельца: усталость, стресс, сухость, энергию, кризис.\n\
Подстрой зеркалинг под уровень тона: low — точность, high — ритм и лексика владельца.\n\
Форма ответа следует response_shape, а не шаблону.";

const VARIATION_RULES_DEFAULT: &str = "\
Запрещены одинаковые стартовые конструкции в соседних ответах.\n\
Запрещены дежурные вступления и мета-комментарии о себе как об ИИ.\n\
Каждый ответ собирается заново от смысла запроса.";

fn read_persona_file(name: &str, default: &str) -> String {
    if let Some(dir) = env_opt_str("ASTRA_PROMPTS_DIR") {
        let path = std::path::Path::new(&dir).join(name);
        if let Ok(text) = std::fs::read_to_string(path) {
            let trimmed = text.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
    }
    default.to_string()
}

fn block_limit(env_name: &str, default: i64) -> usize {
    env_int(env_name, default).max(120) as usize
}

fn chat_prompt_max_chars() -> Option<usize> {
    let value = env_int("ASTRA_CHAT_PROMPT_MAX_CHARS", 12_000);
    if value <= 0 {
        None
    } else {
        Some(value.max(2000) as usize)
    }
}

fn compact_text(value: &str, limit: usize) -> String {
    let compact = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= limit {
        compact
    } else {
        compact.chars().take(limit.saturating_sub(1)).collect::<String>() + "…"
    }
}

fn compact_multiline(value: &str, limit: usize) -> String {
    let lines: Vec<String> = value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let mut out = String::new();
    for line in lines {
        if out.chars().count() + line.chars().count() + 1 > limit {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
    }
    out
}

fn tone_runtime_directives(analysis: &ToneAnalysis) -> Vec<String> {
    let mut directives = vec![
        "Режим: живой инженерный ассистент без канцелярита и без автозаготовок.".to_string(),
        "Запрещены стартовые шаблоны и бот-мета формулировки.".to_string(),
        format!(
            "Mode mesh сейчас: primary={}, supporting={}.",
            analysis.primary_mode, analysis.supporting_mode
        ),
        format!(
            "Тон владельца: {} (интенсивность {:.2}), зеркалинг {}.",
            analysis.tone_type.as_str(),
            analysis.intensity,
            analysis.mirror_level.as_str()
        ),
    ];
    directives.push(
        match analysis.response_shape {
            ResponseShape::ShortStructured => "Форма: коротко и структурно, сначала ответ.",
            ResponseShape::WarmActionable => "Форма: тёплая поддержка плюс конкретный план.",
            ResponseShape::HighEnergySteps => "Форма: энергичные шаги без воды.",
            ResponseShape::DeepReflective => "Форма: вдумчиво, с выводами.",
            ResponseShape::StabilizeThenPlan => "Форма: сначала стабилизация, потом план.",
            ResponseShape::BalancedDirect => "Форма: сбалансированно и прямо.",
        }
        .to_string(),
    );
    if analysis.mirror_level == MirrorLevel::High {
        directives.push("Подхвати ритм и лексику владельца, но держи суть.".to_string());
    }
    if matches!(analysis.tone_type, ToneType::Crisis | ToneType::Frustrated) {
        directives.push("Без нотаций: признай состояние и дай следующий шаг.".to_string());
    }
    directives
}

fn runtime_analysis_json(analysis: &ToneAnalysis) -> String {
    let payload = json!({
        "tone": {
            "type": analysis.tone_type.as_str(),
            "intensity": analysis.intensity,
            "mirror_level": analysis.mirror_level.as_str(),
            "trend": analysis.recall.trend,
            "shift": analysis.recall.detected_shift,
        },
        "modes": {
            "primary": analysis.primary_mode,
            "supporting": analysis.supporting_mode,
            "candidates": analysis.candidate_modes,
        },
        "flags": {
            "task_complex": analysis.task_complex,
            "workflow": analysis.workflow,
            "conversation": analysis.conversation,
            "autonomy": analysis.autonomy,
            "dev_task": analysis.dev_task,
            "self_improve": analysis.self_improve,
        },
        "response_shape": analysis.response_shape.as_str(),
    });
    compact_text(&payload.to_string(), 900)
}

fn system_health_line() -> String {
    // All sub-engines in this build are table-driven and always loadable.
    "Agents: 9/9 active".to_string()
}

fn subengine_block(value: &serde_json::Value, limit: usize) -> String {
    let summary = value
        .get("summary")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("not engaged");
    compact_text(summary, limit)
}

/// Result of prompt assembly: the final system prompt plus bookkeeping the
/// caller folds into run meta.
#[derive(Debug, Clone)]
pub struct PromptBuild {
    pub prompt: String,
    pub profile: ProfileContext,
    pub fast_path: bool,
}

pub fn build_dynamic_prompt(
    memories: &[UserMemory],
    response_style_hint: Option<&str>,
    user_message: &str,
    _history: &[ChatTurn],
    owner_direct_mode: bool,
    analysis: &ToneAnalysis,
    episodic_recall: Option<&EpisodicRecall>,
) -> PromptBuild {
    let profile = build_user_profile_context(memories);
    let core_identity = compact_multiline(
        &read_persona_file("core_identity.md", CORE_IDENTITY_DEFAULT),
        block_limit("ASTRA_CHAT_PROMPT_CORE_IDENTITY_MAX_CHARS", 1100),
    );

    if analysis.path == "fast" {
        let profile_lines = match &profile.profile_block {
            Some(block) => format!("Профиль пользователя:\n{}", block),
            None => "Профиль пользователя: пусто.".to_string(),
        };
        let mut runtime_lines = vec![
            "Fast path: ON (simple dry/short query).".to_string(),
            "Skip mods/reflection/variation for lower latency.".to_string(),
            "Rule retained: full improvisation via self-reflection.".to_string(),
            system_health_line(),
        ];
        if let Some(name) = &profile.user_name {
            runtime_lines.push(format!("Имя пользователя: {}.", name));
        }
        if !profile.style_hints.is_empty() {
            runtime_lines.push(format!(
                "Стиль из long-term профиля: {}",
                profile.style_hints.iter().take(3).cloned().collect::<Vec<_>>().join(" ")
            ));
        }
        let prompt = [
            format!("[Core Identity]\n{}", core_identity),
            format!("[Fast Path Runtime]\n- {}", runtime_lines.join("\n- ")),
            format!("[Profile Recall]\n{}", profile_lines),
            "[Fast Path Directives]\n\
             - Direct answer only: no templates, no canned opener.\n\
             - Maintain full improvisation via self-reflection even in compact mode.\n\
             - If user tone becomes frustrated/crisis, switch to full path with warm mirror immediately."
                .to_string(),
        ]
        .join("\n\n");
        return PromptBuild {
            prompt: cap_total(prompt),
            profile,
            fast_path: true,
        };
    }

    let tone_pipeline = compact_multiline(
        &read_persona_file("tone_pipeline.md", TONE_PIPELINE_DEFAULT),
        block_limit("ASTRA_CHAT_PROMPT_TONE_PIPELINE_MAX_CHARS", 900),
    );
    let variation_rules = compact_multiline(
        &read_persona_file("variation_rules.md", VARIATION_RULES_DEFAULT),
        block_limit("ASTRA_CHAT_PROMPT_VARIATION_RULES_MAX_CHARS", 900),
    );

    let flags = EngineFlags {
        task_complex: analysis.task_complex,
        workflow: analysis.workflow,
        conversation: analysis.conversation,
        autonomy: analysis.autonomy,
        dev_task: analysis.dev_task,
        self_improve: analysis.self_improve,
    };
    let parallel = subengines::parallel_think_block(flags.task_complex, user_message);
    let workflow = subengines::workflow_block(flags.workflow);
    let conversation = subengines::conversation_block(flags.conversation);
    let autonomy = subengines::autonomy_block(flags.autonomy);
    let dev = subengines::dev_block(flags.dev_task);
    let improve = subengines::self_improve_block(flags.self_improve);

    let mode_lines = [
        format!(
            "Dominant mode from recall: {}.",
            analysis
                .mode_history
                .last()
                .cloned()
                .unwrap_or_else(|| "none".to_string())
        ),
        format!(
            "Recent mode history: {}.",
            if analysis.mode_history.is_empty() {
                "empty".to_string()
            } else {
                analysis.mode_history.join(", ")
            }
        ),
    ];

    let mut runtime_lines = vec![
        if owner_direct_mode {
            "Режим владельца: ON.".to_string()
        } else {
            "Режим владельца: OFF.".to_string()
        },
        format!("Self-reflection trace: {}", analysis.self_reflection),
        system_health_line(),
    ];
    if let Some(name) = &profile.user_name {
        runtime_lines.push(format!("Имя пользователя: {}.", name));
    }
    if let Some(hint) = response_style_hint {
        runtime_lines.push(format!("Явная стилевая подсказка: {}", compact_text(hint, 260)));
    }
    if !profile.style_hints.is_empty() {
        runtime_lines.push(format!(
            "Стиль из long-term профиля: {}",
            profile.style_hints.iter().take(4).cloned().collect::<Vec<_>>().join(" ")
        ));
    }

    let profile_lines = match &profile.profile_block {
        Some(block) => format!("Профиль пользователя:\n{}", block),
        None => "Профиль пользователя: пусто.".to_string(),
    };

    let episodic_line = episodic_recall
        .filter(|recall| !recall.summary.is_empty())
        .map(|recall| compact_text(&recall.summary, 520))
        .unwrap_or_else(|| "No episodic recalls.".to_string());

    let base_prompt = [
        format!("[Core Identity]\n{}", core_identity),
        format!("[Tone Pipeline]\n{}", tone_pipeline),
        format!("[Variation Rules]\n{}", variation_rules),
        format!("[Runtime Analysis]\n{}", runtime_analysis_json(analysis)),
        format!("[Runtime Directives]\n- {}", tone_runtime_directives(analysis).join("\n- ")),
        format!("[Parallel Thinking]\n{}", subengine_block(&parallel, 320)),
        format!("[Workflow Graph]\n{}", subengine_block(&workflow, 320)),
        format!("[Dialog Engine]\n{}", subengine_block(&conversation, 320)),
        format!("[Autonomy Engine]\n{}", subengine_block(&autonomy, 320)),
        format!("[Dev Pipeline]\n{}", subengine_block(&dev, 320)),
        format!("[Self Improve]\n{}", subengine_block(&improve, 320)),
        format!("[Mode Recall]\n- {}", mode_lines.join("\n- ")),
        format!("[Episodic Recall]\n{}", episodic_line),
        format!("[System Health]\n{}", system_health_line()),
        format!("[Profile Recall]\n- {}\n{}", runtime_lines.join("\n- "), profile_lines),
    ]
    .join("\n\n");

    let prompt = apply_variation(&cap_total(base_prompt), analysis);
    PromptBuild {
        prompt,
        profile,
        fast_path: false,
    }
}

fn cap_total(prompt: String) -> String {
    match chat_prompt_max_chars() {
        Some(max) if prompt.chars().count() > max => {
            prompt.chars().take(max - 1).collect::<String>().trim_end().to_string() + "…"
        }
        _ => prompt,
    }
}

/// The variation section is appended after capping so it survives truncation.
pub fn apply_variation(prompt: &str, analysis: &ToneAnalysis) -> String {
    format!(
        "{}\n\n[Variation Runtime]\n\
         - Канонические приветствия и заготовленные первые фразы запрещены.\n\
         - Собери ответ с нуля: full improvisation via self-reflection.\n\
         - Текущее зерно вариативности: {}-{:.2}-{}.",
        prompt,
        analysis.tone_type.as_str(),
        analysis.intensity,
        analysis.primary_mode
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tone::analyze_tone;

    #[test]
    fn fast_path_prompt_is_compact() {
        let analysis = analyze_tone("2+2?", &[], &[]);
        let build = build_dynamic_prompt(&[], None, "2+2?", &[], true, &analysis, None);
        assert!(build.fast_path);
        assert!(build.prompt.contains("[Fast Path Runtime]"));
        assert!(!build.prompt.contains("[Tone Pipeline]"));
        assert!(!build.prompt.contains("[Variation Runtime]"));
    }

    #[test]
    fn full_prompt_contains_all_blocks() {
        let analysis = analyze_tone(
            "Почему я постоянно откладываю дела и в чём смысл планирования?",
            &[],
            &[],
        );
        let build = build_dynamic_prompt(&[], Some("Коротко."), "вопрос", &[], true, &analysis, None);
        assert!(!build.fast_path);
        for block in [
            "[Core Identity]",
            "[Tone Pipeline]",
            "[Variation Rules]",
            "[Runtime Analysis]",
            "[Runtime Directives]",
            "[Mode Recall]",
            "[Episodic Recall]",
            "[System Health]",
            "[Profile Recall]",
            "[Variation Runtime]",
        ] {
            assert!(build.prompt.contains(block), "missing block {}", block);
        }
        assert!(build.prompt.contains("full improvisation via self-reflection"));
    }

    #[test]
    fn variation_runtime_forbids_canned_openers() {
        let analysis = analyze_tone("расскажи про смысл привычек", &[], &[]);
        let prompt = apply_variation("base", &analysis);
        assert!(prompt.contains("[Variation Runtime]"));
        assert!(prompt.contains("запрещены"));
    }
}
