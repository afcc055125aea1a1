// Skill dispatch: a skill implements one plan-step kind; the planner picks
// the skill by kind and the engine calls it with a per-run context.

pub mod adapters;
pub mod memory_save;
pub mod web_research;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use astra_brain::BrainError;
use astra_core::{AstraError, SqliteStore};
use astra_types::{PlanStep, Run, SkillResult, StepKind, Task};

pub use adapters::{FetchedPage, PageFetcher, SearchClient, SearchResult, StubFetcher, StubSearchClient};
pub use memory_save::MemorySaveSkill;
pub use web_research::WebResearchSkill;

#[derive(Error, Debug)]
pub enum SkillError {
    #[error("invalid skill inputs: {0}")]
    InvalidInputs(String),

    #[error(transparent)]
    Store(#[from] AstraError),

    #[error(transparent)]
    Llm(#[from] BrainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution context handed to a skill for one task attempt.
#[derive(Clone)]
pub struct SkillContext {
    pub run: Run,
    pub step: PlanStep,
    pub task: Task,
    pub settings: Value,
    pub base_dir: PathBuf,
    pub store: Arc<SqliteStore>,
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, inputs: Value, ctx: &SkillContext) -> Result<SkillResult, SkillError>;
}

#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<&'static str, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name(), skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.skills.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Step kind to skill name. Computer kinds all route to the executor, which
/// is not a registry skill.
pub fn skill_name_for_kind(kind: StepKind) -> &'static str {
    match kind {
        StepKind::ChatResponse => "chat_response",
        StepKind::WebResearch => "web_research",
        StepKind::MemoryCommit => "memory_save",
        StepKind::ComputerActions
        | StepKind::BrowserResearchUi
        | StepKind::FileOrganize
        | StepKind::CodeAssist => "computer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_to_skill_mapping_is_total() {
        assert_eq!(skill_name_for_kind(StepKind::WebResearch), "web_research");
        assert_eq!(skill_name_for_kind(StepKind::MemoryCommit), "memory_save");
        assert_eq!(skill_name_for_kind(StepKind::FileOrganize), "computer");
    }
}
