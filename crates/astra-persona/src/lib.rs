pub mod episodic;
pub mod modes;
pub mod profile;
pub mod prompt;
pub mod relevance;
pub mod subengines;
pub mod tone;

pub use episodic::{EpisodicRecall, EpisodicStore, EpisodicUpdate};
pub use profile::{build_chat_messages, build_user_profile_context, ProfileContext};
pub use prompt::{build_dynamic_prompt, PromptBuild};
pub use tone::{analyze_tone, MirrorLevel, ResponseShape, Signals, ToneAnalysis, ToneType};
