// Skill result envelope shared between the engine and skill implementations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A web source candidate produced by a skill, before store dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

/// An artifact candidate; `content_uri` points at a file under the app base dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCandidate {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub title: String,
    pub content_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub meta: Value,
}

/// A progress event a skill wants relayed through the bus as `task_progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Outcome of a skill invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillResult {
    pub what_i_did: String,
    #[serde(default)]
    pub sources: Vec<SourceCandidate>,
    #[serde(default)]
    pub facts: Vec<Value>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactCandidate>,
    pub confidence: f64,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub events: Vec<SkillEvent>,
}
