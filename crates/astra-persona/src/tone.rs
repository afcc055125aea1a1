// Tone analysis. Token-class lookup tables plus punctuation counters feed a
// priority-ordered classifier; thresholds tuned for short Russian chat turns.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use astra_types::ChatTurn;

use crate::modes::{self, ModeRecall};
use crate::subengines::{self, EngineFlags};

pub const PROFANITY_TOKENS: &[&str] = &[
    "бля", "блять", "еб", "нах", "заеб", "хер", "пизд", "fuck", "shit",
];
pub const FATIGUE_TOKENS: &[&str] = &[
    "устал", "устала", "выгорел", "выгорание", "не вывожу", "нет сил", "замотан", "измотан",
];
pub const STRESS_TOKENS: &[&str] = &[
    "бесит", "достал", "задолбал", "горит", "горю", "заебал", "не могу", "сломалось",
];
pub const DRY_TOKENS: &[&str] = &[
    "дай", "формула", "формулу", "кратко", "коротко", "без воды", "шаги", "пункты",
    "определение", "definition", "just",
];
pub const TECH_TOKENS: &[&str] = &[
    "код", "python", "js", "javascript", "typescript", "sql", "covariance", "ковариац",
    "regex", "api", "формул",
];
pub const URGENCY_TOKENS: &[&str] = &["срочно", "быстро", "прямо сейчас", "urgent", "asap"];
pub const UNCERTAINTY_TOKENS: &[&str] =
    &["не знаю", "не понял", "что делать", "как быть", "сомневаюсь"];
pub const REFLECTIVE_TOKENS: &[&str] =
    &["почему", "смысл", "осознаю", "рефлек", "вспоминая", "как вчера"];
pub const CREATIVE_TOKENS: &[&str] = &["придумай", "идея", "что если", "brainstorm", "креатив"];
pub const HUMOR_TOKENS: &[&str] = &["ахах", "лол", "шут", "ирони", "подколи"];
pub const GRATITUDE_TOKENS: &[&str] =
    &["спасибо", "благодар", "круто", "класс", "ура", "nice", "great"];
pub const TRUST_TOKENS: &[&str] =
    &["помоги", "выручи", "рассчитываю", "я с тобой", "держи меня"];
pub const CRISIS_TOKENS: &[&str] = &["пиздец", "паника", "катастроф", "всё пропало", "аврал"];
pub const POSITIVE_ENERGY_TOKENS: &[&str] = &["погнали", "давай", "огонь", "вперёд", "разъеб"];
pub const WORKFLOW_TOKENS: &[&str] = &[
    "workflow", "воркфло", "граф", "pipeline", "пайплайн", "оркестрац", "stateful",
];
pub const CONVERSATION_TOKENS: &[&str] =
    &["поговор", "диалог", "обсуд", "chat", "conversation", "brainstorm"];
pub const AUTONOMY_TOKENS: &[&str] =
    &["autonomy", "автоном", "self-task", "scheduler", "без моего участия"];
pub const DEV_TASK_TOKENS: &[&str] = &[
    "dev_task", "напиши модуль", "реализ", "feature", "код", "module", "тест",
];
pub const SELF_IMPROVE_TOKENS: &[&str] = &[
    "self_improve", "self improve", "self-improve", "самоулучш", "feedback loop", "адаптир",
    "улучши себя",
];

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-zА-Яа-яЁё0-9_+-]+").expect("word pattern"));

pub fn normalized_text(value: &str) -> String {
    let lowered = value.trim().to_lowercase().replace('ё', "е");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn words(value: &str) -> Vec<String> {
    WORD_RE
        .find_iter(value)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn count_token_hits(text: &str, tokens: &[&str]) -> u32 {
    let lowered = normalized_text(text);
    if lowered.is_empty() {
        return 0;
    }
    tokens.iter().filter(|token| lowered.contains(*token)).count() as u32
}

/// Raw signal counters for one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signals {
    pub word_count: u32,
    pub profanity: u32,
    pub fatigue: u32,
    pub stress: u32,
    pub dry_task: u32,
    pub technical_density: u32,
    pub urgency: u32,
    pub uncertainty: u32,
    pub reflective_cues: u32,
    pub creative_cues: u32,
    pub humor_cues: u32,
    pub gratitude: u32,
    pub trust_language: u32,
    pub crisis_cues: u32,
    pub workflow_cues: u32,
    pub conversation_cues: u32,
    pub autonomy_cues: u32,
    pub dev_task_cues: u32,
    pub self_improve_cues: u32,
    pub positive_energy: u32,
    pub energetic_markers: u32,
    pub brevity_request: u32,
    pub depth_request: u32,
    pub memory_callback: u32,
    pub ambiguity: u32,
    pub question: u32,
    pub exclamation: u32,
    pub uppercase: u32,
    pub ellipsis: u32,
}

pub fn signal_counts(text: &str) -> Signals {
    let word_list = words(text);
    let exclamation = text.matches('!').count() as u32;
    let question = text.matches('?').count() as u32;
    let uppercase = word_list
        .iter()
        .filter(|token| token.len() > 2 && token.chars().all(|c| !c.is_lowercase()))
        .filter(|token| token.chars().any(|c| c.is_alphabetic()))
        .count() as u32;
    let ellipsis = (text.matches("...").count() + text.matches('…').count()) as u32;
    let normalized = normalized_text(text);

    let fatigue = count_token_hits(text, FATIGUE_TOKENS);
    let stress = count_token_hits(text, STRESS_TOKENS);
    let energetic = count_token_hits(text, POSITIVE_ENERGY_TOKENS);

    Signals {
        word_count: word_list.len() as u32,
        profanity: count_token_hits(text, PROFANITY_TOKENS),
        fatigue,
        stress,
        dry_task: count_token_hits(text, DRY_TOKENS),
        technical_density: count_token_hits(text, TECH_TOKENS),
        urgency: count_token_hits(text, URGENCY_TOKENS),
        uncertainty: count_token_hits(text, UNCERTAINTY_TOKENS),
        reflective_cues: count_token_hits(text, REFLECTIVE_TOKENS),
        creative_cues: count_token_hits(text, CREATIVE_TOKENS),
        humor_cues: count_token_hits(text, HUMOR_TOKENS),
        gratitude: count_token_hits(text, GRATITUDE_TOKENS),
        trust_language: count_token_hits(text, TRUST_TOKENS),
        crisis_cues: count_token_hits(text, CRISIS_TOKENS),
        workflow_cues: count_token_hits(text, WORKFLOW_TOKENS),
        conversation_cues: count_token_hits(text, CONVERSATION_TOKENS),
        autonomy_cues: count_token_hits(text, AUTONOMY_TOKENS),
        dev_task_cues: count_token_hits(text, DEV_TASK_TOKENS),
        self_improve_cues: count_token_hits(text, SELF_IMPROVE_TOKENS),
        positive_energy: energetic,
        energetic_markers: energetic + exclamation + uppercase,
        brevity_request: u32::from(
            normalized.contains("кратко")
                || normalized.contains("коротко")
                || normalized.contains("без воды"),
        ),
        depth_request: u32::from(normalized.contains("подроб") || normalized.contains("глуб")),
        memory_callback: u32::from(
            normalized.contains("помнишь") || normalized.contains("как вчера"),
        ),
        ambiguity: u32::from(word_list.len() <= 3 && question > 0),
        question,
        exclamation,
        uppercase,
        ellipsis,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneType {
    Dry,
    Frustrated,
    Tired,
    Energetic,
    Uncertain,
    Reflective,
    Creative,
    Crisis,
    Neutral,
}

impl ToneType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dry => "dry",
            Self::Frustrated => "frustrated",
            Self::Tired => "tired",
            Self::Energetic => "energetic",
            Self::Uncertain => "uncertain",
            Self::Reflective => "reflective",
            Self::Creative => "creative",
            Self::Crisis => "crisis",
            Self::Neutral => "neutral",
        }
    }
}

fn clamp_intensity(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

pub fn classify_tone(text: &str) -> (ToneType, f64, Signals) {
    let signals = signal_counts(text);
    let word_count = signals.word_count.max(1) as f64;

    if signals.crisis_cues > 0 && (signals.stress > 0 || signals.profanity > 0) {
        let intensity = 0.74
            + signals.crisis_cues as f64 * 0.1
            + signals.profanity as f64 * 0.08
            + signals.urgency as f64 * 0.05;
        return (ToneType::Crisis, clamp_intensity(intensity), signals);
    }

    if signals.profanity > 0 || signals.stress >= 2 {
        let intensity = 0.62
            + signals.profanity as f64 * 0.12
            + signals.stress as f64 * 0.09
            + signals.exclamation as f64 * 0.03;
        return (ToneType::Frustrated, clamp_intensity(intensity), signals);
    }

    if signals.fatigue > 0 && signals.stress > 0 {
        let intensity = 0.58
            + signals.fatigue as f64 * 0.08
            + signals.stress as f64 * 0.06
            + signals.ellipsis as f64 * 0.03;
        return (ToneType::Tired, clamp_intensity(intensity), signals);
    }

    let dry_density =
        (signals.dry_task + signals.technical_density + signals.brevity_request) as f64 / word_count;
    if ((signals.dry_task + signals.technical_density) >= 2
        || (signals.brevity_request > 0 && signals.word_count <= 12))
        && signals.exclamation == 0
        && signals.humor_cues == 0
    {
        let intensity = 0.5 + dry_density * 2.2;
        return (ToneType::Dry, clamp_intensity(intensity), signals);
    }

    if signals.energetic_markers >= 3 || signals.positive_energy >= 1 {
        let intensity = 0.5
            + signals.positive_energy as f64 * 0.12
            + signals.exclamation as f64 * 0.05
            + signals.uppercase as f64 * 0.03;
        return (ToneType::Energetic, clamp_intensity(intensity), signals);
    }

    if signals.uncertainty > 0 && signals.reflective_cues == 0 {
        let intensity = 0.46 + signals.uncertainty as f64 * 0.1 + signals.question as f64 * 0.03;
        return (ToneType::Uncertain, clamp_intensity(intensity), signals);
    }

    if signals.creative_cues > 0 {
        let intensity =
            0.45 + signals.creative_cues as f64 * 0.1 + signals.positive_energy as f64 * 0.04;
        return (ToneType::Creative, clamp_intensity(intensity), signals);
    }

    if signals.reflective_cues > 0 {
        let intensity =
            0.44 + signals.reflective_cues as f64 * 0.08 + signals.question as f64 * 0.03;
        return (ToneType::Reflective, clamp_intensity(intensity), signals);
    }

    if signals.fatigue > 0 {
        let intensity = 0.45 + signals.fatigue as f64 * 0.08;
        return (ToneType::Tired, clamp_intensity(intensity), signals);
    }

    (ToneType::Neutral, 0.34, signals)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorLevel {
    Low,
    Medium,
    High,
}

impl MirrorLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

pub fn mirror_level(tone_type: ToneType, intensity: f64) -> MirrorLevel {
    match tone_type {
        ToneType::Dry => MirrorLevel::Low,
        ToneType::Frustrated | ToneType::Crisis | ToneType::Energetic if intensity >= 0.65 => {
            MirrorLevel::High
        }
        _ => MirrorLevel::Medium,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    ShortStructured,
    WarmActionable,
    HighEnergySteps,
    DeepReflective,
    StabilizeThenPlan,
    BalancedDirect,
}

impl ResponseShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortStructured => "short_structured",
            Self::WarmActionable => "warm_actionable",
            Self::HighEnergySteps => "high_energy_steps",
            Self::DeepReflective => "deep_reflective",
            Self::StabilizeThenPlan => "stabilize_then_plan",
            Self::BalancedDirect => "balanced_direct",
        }
    }
}

pub fn response_shape(tone_type: ToneType, signals: &Signals) -> ResponseShape {
    match tone_type {
        ToneType::Dry => ResponseShape::ShortStructured,
        ToneType::Frustrated | ToneType::Tired => ResponseShape::WarmActionable,
        ToneType::Energetic => ResponseShape::HighEnergySteps,
        ToneType::Reflective => ResponseShape::DeepReflective,
        ToneType::Crisis => ResponseShape::StabilizeThenPlan,
        _ if signals.depth_request > 0 => ResponseShape::DeepReflective,
        _ => ResponseShape::BalancedDirect,
    }
}

const EMOTIONAL_BLOCKERS: &[&str] = &[
    "не работает",
    "ничего не работает",
    "не вывожу",
    "нет сил",
    "устал",
    "устала",
    "выгорел",
    "выгорание",
    "сломалось",
];

/// Fast-path eligibility for simple dry/short queries, with the blocking
/// reason when ineligible.
pub fn is_simple_query_fast_path(
    text: &str,
    tone_type: ToneType,
    signals: &Signals,
    flags: &EngineFlags,
) -> (bool, &'static str) {
    let normalized = text.trim();
    let lowered = normalized_text(normalized);
    if normalized.is_empty() {
        return (false, "empty");
    }
    if matches!(tone_type, ToneType::Frustrated | ToneType::Crisis | ToneType::Tired) {
        return (false, "emotional_tone");
    }
    if signals.fatigue > 0 {
        return (false, "fatigue");
    }
    if EMOTIONAL_BLOCKERS.iter().any(|token| lowered.contains(token)) {
        return (false, "emotional_keyword");
    }
    if flags.any_engaged() {
        return (false, "advanced_route");
    }
    if normalized.chars().count() > 50 {
        return (false, "length");
    }
    if signals.word_count > 10 {
        return (false, "word_count");
    }
    if signals.profanity > 0 || signals.stress > 0 {
        return (false, "stress_or_profanity");
    }
    if signals.urgency > 0 || signals.crisis_cues > 0 {
        return (false, "urgency_or_crisis");
    }
    if ["напомни", "помни", "вспомни", "remember"]
        .iter()
        .any(|token| lowered.contains(token))
    {
        return (false, "memory_recall");
    }
    if signals.question > 1 {
        return (false, "multi_question");
    }
    if signals.reflective_cues > 0 || signals.creative_cues > 0 {
        return (false, "deep_dialog");
    }
    (true, "short_dry_simple")
}

pub fn history_user_texts(history: &[ChatTurn], limit: usize) -> Vec<String> {
    let texts: Vec<String> = history
        .iter()
        .filter(|turn| turn.role == "user")
        .map(|turn| turn.content.trim().to_string())
        .filter(|content| !content.is_empty())
        .collect();
    if texts.len() > limit {
        texts[texts.len() - limit..].to_vec()
    } else {
        texts
    }
}

pub fn dominant_label(values: &[String]) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for value in values {
        *counts.entry(value.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(label, _)| label.to_string())
}

/// Recall over the recent history tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToneRecall {
    pub history_tail_types: Vec<String>,
    pub dominant_recent_tone: Option<String>,
    pub detected_shift: bool,
    pub same_type_count: usize,
    pub recent_avg_intensity: f64,
    pub trend: String,
    pub fast_path_reason: String,
    pub episodic_hits: u32,
}

/// Full tone analysis result carried into run meta and the prompt builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToneAnalysis {
    #[serde(rename = "type")]
    pub tone_type: ToneType,
    pub intensity: f64,
    pub mirror_level: MirrorLevel,
    pub signals: Signals,
    pub recall: ToneRecall,
    pub primary_mode: String,
    pub supporting_mode: String,
    pub candidate_modes: Vec<String>,
    pub mode_history: Vec<String>,
    pub response_shape: ResponseShape,
    pub task_complex: bool,
    pub workflow: bool,
    pub conversation: bool,
    pub autonomy: bool,
    pub dev_task: bool,
    pub self_improve: bool,
    pub path: String,
    pub simple_query: bool,
    pub fast_path_reason: String,
    pub self_reflection: String,
}

fn self_reflection_text(
    tone_type: ToneType,
    intensity: f64,
    recall: &ToneRecall,
    primary_mode: &str,
    supporting_mode: &str,
    signals: &Signals,
    flags: &EngineFlags,
) -> String {
    let shift = if recall.detected_shift {
        "shift detected"
    } else {
        "tone stable"
    };
    let urgency = if signals.urgency > 0 { "urgent" } else { "normal pace" };
    format!(
        "Self-reflection: tone={} intensity={:.2}; {}; pace={}; mode_mix={} + {}; \
         planning={}; orchestration={}; dialog={}; autonomy={}; dev_mode={}; self_improve={}; \
         compose answer with full improvisation via self-reflection and no canned opener.",
        tone_type.as_str(),
        intensity,
        shift,
        urgency,
        primary_mode,
        supporting_mode,
        if flags.task_complex { "parallel" } else { "single" },
        if flags.workflow { "workflow" } else { "no-workflow" },
        if flags.conversation { "conversation" } else { "no-conversation" },
        if flags.autonomy { "autonomy" } else { "manual" },
        if flags.dev_task { "dev" } else { "general" },
        if flags.self_improve { "enabled" } else { "disabled" },
    )
}

pub fn analyze_tone(
    user_msg: &str,
    history: &[ChatTurn],
    memories: &[astra_types::UserMemory],
) -> ToneAnalysis {
    let text = user_msg.trim();
    let (tone_type, intensity, signals) = classify_tone(text);
    let flags = subengines::detect_engine_flags(text, &signals, history);
    let (simple_query, fast_path_reason) =
        is_simple_query_fast_path(text, tone_type, &signals, &flags);

    let mut history_types = Vec::new();
    let mut history_intensities = Vec::new();
    for hist_text in history_user_texts(history, 8) {
        let (hist_type, hist_intensity, _) = classify_tone(&hist_text);
        history_types.push(hist_type.as_str().to_string());
        history_intensities.push(hist_intensity);
    }

    let dominant_recent = dominant_label(&history_types);
    let same_type_count = history_types
        .iter()
        .filter(|item| item.as_str() == tone_type.as_str())
        .count();
    let recent_avg_intensity = if history_intensities.is_empty() {
        0.0
    } else {
        let avg = history_intensities.iter().sum::<f64>() / history_intensities.len() as f64;
        (avg * 1000.0).round() / 1000.0
    };
    let detected_shift = dominant_recent
        .as_deref()
        .map(|dominant| dominant != tone_type.as_str() && intensity >= 0.42)
        .unwrap_or(false);

    let trend = if history_intensities.is_empty() {
        "steady"
    } else if intensity > recent_avg_intensity + 0.14 {
        "rising"
    } else if intensity < recent_avg_intensity - 0.14 {
        "cooling"
    } else {
        "steady"
    };

    let recall = ToneRecall {
        history_tail_types: history_types,
        dominant_recent_tone: dominant_recent,
        detected_shift,
        same_type_count,
        recent_avg_intensity,
        trend: trend.to_string(),
        fast_path_reason: fast_path_reason.to_string(),
        episodic_hits: 0,
    };

    let mode_recall: ModeRecall = modes::retrieve_modes(history, memories);
    let mode_plan = modes::select_modes(tone_type, &signals, detected_shift, &mode_recall);
    let shape = response_shape(tone_type, &signals);

    let self_reflection = self_reflection_text(
        tone_type,
        intensity,
        &recall,
        &mode_plan.primary_mode,
        &mode_plan.supporting_mode,
        &signals,
        &flags,
    );

    ToneAnalysis {
        tone_type,
        intensity,
        mirror_level: mirror_level(tone_type, intensity),
        signals,
        recall,
        primary_mode: mode_plan.primary_mode,
        supporting_mode: mode_plan.supporting_mode,
        candidate_modes: mode_plan.candidate_modes,
        mode_history: mode_recall.mode_history,
        response_shape: shape,
        task_complex: flags.task_complex,
        workflow: flags.workflow,
        conversation: flags.conversation,
        autonomy: flags.autonomy,
        dev_task: flags.dev_task,
        self_improve: flags.self_improve,
        path: if simple_query { "fast" } else { "full" }.to_string(),
        simple_query,
        fast_path_reason: fast_path_reason.to_string(),
        self_reflection,
    }
}

/// Style hint derived straight from the tone, used when nothing stronger is
/// available.
pub fn style_hint_from_tone(analysis: &ToneAnalysis) -> Option<String> {
    let hint = match analysis.tone_type {
        ToneType::Dry => "Коротко и структурно: сначала ответ, затем шаги.",
        ToneType::Frustrated => "Коротко валидируй состояние и сразу предложи конкретный план.",
        ToneType::Tired => "Спокойный поддерживающий тон, без лишнего текста.",
        ToneType::Energetic => "Живой темп и деловая конкретика.",
        ToneType::Crisis => "Сначала стабилизация, затем короткий антикризисный план.",
        ToneType::Reflective => "Спокойный вдумчивый тон с ясными выводами.",
        ToneType::Creative => "Креативные варианты, но с прикладной структурой.",
        _ => {
            if analysis.mirror_level == MirrorLevel::Low {
                "Формально и точно, минимум разговорных вставок."
            } else {
                return None;
            }
        }
    };
    Some(hint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profanity_classifies_frustrated() {
        let (tone, intensity, _) = classify_tone("блять опять всё сломалось");
        assert_eq!(tone, ToneType::Frustrated);
        assert!(intensity > 0.6);
    }

    #[test]
    fn dry_technical_request_is_dry() {
        let (tone, _, _) = classify_tone("дай формулу ковариации кратко");
        assert_eq!(tone, ToneType::Dry);
    }

    #[test]
    fn plain_short_question_is_fast_path_eligible() {
        let analysis = analyze_tone("2+2?", &[], &[]);
        assert!(analysis.simple_query);
        assert_eq!(analysis.path, "fast");
        assert_eq!(analysis.fast_path_reason, "short_dry_simple");
    }

    #[test]
    fn tired_tone_blocks_fast_path() {
        let analysis = analyze_tone("я устал и нет сил", &[], &[]);
        assert!(!analysis.simple_query);
        assert!(matches!(
            analysis.fast_path_reason.as_str(),
            "emotional_tone" | "fatigue" | "emotional_keyword"
        ));
    }

    #[test]
    fn crisis_beats_frustration() {
        let (tone, _, _) = classify_tone("пиздец паника всё горит");
        assert_eq!(tone, ToneType::Crisis);
    }

    #[test]
    fn mode_mesh_is_filled() {
        let analysis = analyze_tone("придумай идею для подарка", &[], &[]);
        assert_eq!(analysis.tone_type, ToneType::Creative);
        assert!(!analysis.primary_mode.is_empty());
        assert_ne!(analysis.primary_mode, analysis.supporting_mode);
        assert!(analysis.self_reflection.contains("mode_mix="));
    }
}
