// Persona mode catalog and the mode-mesh selection tables. Modes are string
// labels with aliasing; selection is table-driven, never inheritance.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use astra_types::{ChatTurn, UserMemory};

use crate::tone::{self, Signals, ToneType};

pub const MODE_CATALOG: &[&str] = &[
    "Supportive/Empathetic",
    "Enthusiastic/Motivational",
    "Calm/Analytical",
    "Reflective/Wise",
    "Playful-lite",
    "Curious/Inquisitive",
    "Nurturing/Caring",
    "Practical/Solution",
    "Witty/Humorous-lite",
    "Introspective/Thoughtful",
    "Adventurous/Creative",
    "Loyal/Reliable",
    "Insightful/Perceptive",
    "Gentle/Soothing",
    "Bold/Decisive",
    "Humble/Learning",
    "Optimistic/Hopeful",
    "Empowered/Mentoring",
    "Playful-Deep",
    "Resilient/Steady",
    "Strategic/Architect",
    "Precision/Verifier",
    "Creative-Deep",
    "Steady",
];

static ALIAS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("alias pattern"));

static MODE_ALIAS: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    MODE_CATALOG
        .iter()
        .map(|mode| (ALIAS_RE.replace_all(&mode.to_lowercase(), "").into_owned(), *mode))
        .collect()
});

pub fn tone_mode_pair(tone_type: ToneType) -> (&'static str, &'static str) {
    match tone_type {
        ToneType::Dry => ("Calm/Analytical", "Practical/Solution"),
        ToneType::Frustrated => ("Supportive/Empathetic", "Resilient/Steady"),
        ToneType::Tired => ("Nurturing/Caring", "Gentle/Soothing"),
        ToneType::Energetic => ("Enthusiastic/Motivational", "Bold/Decisive"),
        ToneType::Uncertain => ("Curious/Inquisitive", "Humble/Learning"),
        ToneType::Reflective => ("Reflective/Wise", "Insightful/Perceptive"),
        ToneType::Creative => ("Adventurous/Creative", "Creative-Deep"),
        ToneType::Crisis => ("Resilient/Steady", "Loyal/Reliable"),
        ToneType::Neutral => ("Loyal/Reliable", "Practical/Solution"),
    }
}

pub fn normalize_mode_label(value: &str) -> Option<&'static str> {
    let raw = ALIAS_RE.replace_all(&value.to_lowercase(), "").into_owned();
    if raw.is_empty() {
        return None;
    }
    MODE_ALIAS.get(&raw).copied()
}

/// Mode labels themselves contain "/", so never split by slash.
pub fn extract_modes_from_string(value: &str) -> Vec<&'static str> {
    let mut detected = Vec::new();
    for part in value.split(|c| matches!(c, ',' | ';' | '>' | '|')) {
        if let Some(mode) = normalize_mode_label(part) {
            if !detected.contains(&mode) {
                detected.push(mode);
            }
        }
    }
    detected
}

const MODE_PREFERENCE_KEYS: &[&str] = &[
    "persona.mode.primary",
    "persona.mode.supporting",
    "persona.mode.last",
    "persona.mode.history",
    "style.mode.primary",
    "style.mode.supporting",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeRecall {
    pub mode_history: Vec<String>,
    pub dominant_mode: Option<String>,
    pub from_memory: Vec<String>,
    pub inferred_from_history: Vec<String>,
}

/// Build mode recall from stored preferences plus tones inferred from the
/// recent user turns.
pub fn retrieve_modes(history: &[ChatTurn], memories: &[UserMemory]) -> ModeRecall {
    let mut from_memory: Vec<String> = Vec::new();
    for memory in memories {
        for pref in &memory.meta.preferences {
            let (Some(key), Some(value)) = (
                pref.get("key").and_then(|v| v.as_str()),
                pref.get("value").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            if MODE_PREFERENCE_KEYS.contains(&key.trim().to_lowercase().as_str()) {
                for mode in extract_modes_from_string(value) {
                    from_memory.push(mode.to_string());
                }
            }
        }
    }

    let mut inferred_from_history: Vec<String> = Vec::new();
    for hist_text in tone::history_user_texts(history, 4) {
        let (hist_type, _, hist_signals) = tone::classify_tone(&hist_text);
        let mut base: Vec<&str> = {
            let (primary, supporting) = tone_mode_pair(hist_type);
            vec![primary, supporting]
        };
        if hist_signals.humor_cues > 0 {
            base.push("Witty/Humorous-lite");
        }
        if let Some(first) = base.first() {
            inferred_from_history.push((*first).to_string());
        }
    }

    let memory_tail: Vec<String> = from_memory
        .iter()
        .rev()
        .take(6)
        .rev()
        .cloned()
        .collect();
    let history_tail: Vec<String> = inferred_from_history
        .iter()
        .rev()
        .take(4)
        .rev()
        .cloned()
        .collect();
    let mut mode_history: Vec<String> = memory_tail.clone();
    mode_history.extend(history_tail);
    if mode_history.len() > 8 {
        mode_history = mode_history.split_off(mode_history.len() - 8);
    }
    let dominant_mode = tone::dominant_label(&mode_history);

    ModeRecall {
        mode_history,
        dominant_mode,
        from_memory: memory_tail,
        inferred_from_history,
    }
}

/// Tone table plus signal boosters, capped at six candidates.
pub fn candidate_modes(tone_type: ToneType, signals: &Signals) -> Vec<String> {
    let (primary, supporting) = tone_mode_pair(tone_type);
    let mut base: Vec<&str> = vec![primary, supporting];
    if signals.humor_cues > 0 {
        base.push("Witty/Humorous-lite");
    }
    if signals.uncertainty > 0 {
        base.push("Curious/Inquisitive");
    }
    if signals.trust_language > 0 {
        base.push("Loyal/Reliable");
    }
    if signals.creative_cues > 0 {
        base.push("Adventurous/Creative");
    }
    if signals.reflective_cues > 0 {
        base.push("Insightful/Perceptive");
    }
    if signals.technical_density > 1 {
        base.push("Precision/Verifier");
    }
    if signals.urgency > 0 {
        base.push("Bold/Decisive");
    }

    let mut result: Vec<String> = Vec::new();
    for item in base {
        if !result.iter().any(|existing| existing == item) {
            result.push(item.to_string());
        }
    }
    result.truncate(6);
    result
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModePlan {
    pub primary_mode: String,
    pub supporting_mode: String,
    pub candidate_modes: Vec<String>,
}

pub fn select_modes(
    tone_type: ToneType,
    signals: &Signals,
    detected_shift: bool,
    mode_recall: &ModeRecall,
) -> ModePlan {
    let mut candidates = candidate_modes(tone_type, signals);
    if let Some(dominant) = &mode_recall.dominant_mode {
        if !candidates.contains(dominant) {
            let index = 1.min(candidates.len());
            candidates.insert(index, dominant.clone());
        }
    }

    if candidates.is_empty() {
        let (primary, supporting) = tone_mode_pair(ToneType::Neutral);
        candidates = vec![primary.to_string(), supporting.to_string()];
    }

    let neutral_supporting = tone_mode_pair(ToneType::Neutral).1.to_string();
    let primary_mode = candidates[0].clone();
    let mut supporting_mode = candidates
        .get(1)
        .cloned()
        .unwrap_or_else(|| neutral_supporting.clone());

    if detected_shift && supporting_mode == primary_mode {
        supporting_mode = neutral_supporting;
    }

    ModePlan {
        primary_mode,
        supporting_mode,
        candidate_modes: candidates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_24_unique_modes() {
        assert_eq!(MODE_CATALOG.len(), 24);
        let mut seen = std::collections::HashSet::new();
        for mode in MODE_CATALOG {
            assert!(seen.insert(*mode));
        }
    }

    #[test]
    fn alias_normalization_is_forgiving() {
        assert_eq!(normalize_mode_label("calm analytical"), Some("Calm/Analytical"));
        assert_eq!(normalize_mode_label("CALM/ANALYTICAL"), Some("Calm/Analytical"));
        assert_eq!(normalize_mode_label("nonexistent mode"), None);
    }

    #[test]
    fn slash_is_not_a_separator() {
        let modes = extract_modes_from_string("Calm/Analytical, Practical/Solution");
        assert_eq!(modes, vec!["Calm/Analytical", "Practical/Solution"]);
    }

    #[test]
    fn boosters_extend_the_tone_pair() {
        let signals = Signals {
            technical_density: 2,
            urgency: 1,
            ..Signals::default()
        };
        let candidates = candidate_modes(ToneType::Dry, &signals);
        assert_eq!(candidates[0], "Calm/Analytical");
        assert!(candidates.iter().any(|m| m == "Precision/Verifier"));
        assert!(candidates.iter().any(|m| m == "Bold/Decisive"));
        assert!(candidates.len() <= 6);
    }
}
