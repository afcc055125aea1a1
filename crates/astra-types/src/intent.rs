// Intent routing decision model. Intent is a sum type: the ASK payload carries
// its questions and the ACT payload its hint, so illegal combinations are
// unrepresentable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RunMode, StepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentKind {
    Chat,
    Ask,
    Act,
}

/// Hint produced by the semantic classifier for ACT intents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_run_mode: Option<RunMode>,
    #[serde(default)]
    pub danger_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "UPPERCASE")]
pub enum Intent {
    Chat,
    Ask {
        #[serde(default)]
        questions: Vec<String>,
    },
    Act {
        #[serde(default)]
        act_hint: ActHint,
    },
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Self::Chat => IntentKind::Chat,
            Self::Ask { .. } => IntentKind::Ask,
            Self::Act { .. } => IntentKind::Act,
        }
    }

    pub fn questions(&self) -> &[String] {
        match self {
            Self::Ask { questions } => questions,
            _ => &[],
        }
    }

    pub fn act_hint(&self) -> Option<&ActHint> {
        match self {
            Self::Act { act_hint } => Some(act_hint),
            _ => None,
        }
    }
}

/// How the decision was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    FastChatPath,
    Semantic,
    SemanticResilience,
}

impl DecisionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FastChatPath => "fast_chat_path",
            Self::Semantic => "semantic",
            Self::SemanticResilience => "semantic_resilience",
        }
    }
}

/// The envelope around the intent sum type, carried into run meta and the
/// `intent_decided` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDecision {
    #[serde(flatten)]
    pub intent: Intent,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub plan_hint: Vec<StepKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_style_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_visible_note: Option<String>,
    pub decision_path: DecisionPath,
}

impl IntentDecision {
    /// One-line summary for the `intent_decided` event payload.
    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "intent={}",
            match self.intent.kind() {
                IntentKind::Chat => "CHAT",
                IntentKind::Ask => "ASK",
                IntentKind::Act => "ACT",
            }
        )];
        if !self.plan_hint.is_empty() {
            let kinds: Vec<&str> = self.plan_hint.iter().map(|k| k.as_str()).collect();
            parts.push(format!("plan_hint={}", kinds.join(",")));
        }
        if self.memory_item.is_some() {
            parts.push("memory_item=1".to_string());
        }
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_tag_is_uppercase() {
        let decision = IntentDecision {
            intent: Intent::Ask {
                questions: vec!["Что именно открыть?".to_string()],
            },
            confidence: 0.8,
            reasons: vec![],
            needs_clarification: true,
            plan_hint: vec![],
            memory_item: None,
            response_style_hint: None,
            user_visible_note: None,
            decision_path: DecisionPath::Semantic,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["intent"], "ASK");
        assert_eq!(json["questions"][0], "Что именно открыть?");
    }

    #[test]
    fn summary_mentions_plan_hint() {
        let decision = IntentDecision {
            intent: Intent::Chat,
            confidence: 0.55,
            reasons: vec!["fast_chat_path".to_string()],
            needs_clarification: false,
            plan_hint: vec![StepKind::ChatResponse],
            memory_item: None,
            response_style_hint: None,
            user_visible_note: None,
            decision_path: DecisionPath::FastChatPath,
        };
        assert_eq!(decision.summary(), "intent=CHAT; plan_hint=CHAT_RESPONSE");
    }
}
