// Environment-driven configuration. Every knob has a clamped default so a
// bare process comes up with safe values.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub fn env_str(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw.trim().to_string();
            if value.is_empty() {
                default.to_string()
            } else {
                value
            }
        }
        Err(_) => default.to_string(),
    }
}

pub fn env_opt_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_int(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_opt_int(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

pub fn env_float(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Local,
    Strict,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Strict => "strict",
        }
    }

    pub fn from_env() -> Self {
        match env_str("ASTRA_AUTH_MODE", "local").to_lowercase().as_str() {
            "strict" => Self::Strict,
            _ => Self::Local,
        }
    }
}

/// Chat generation defaults and the auto web research switchboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub num_predict: i64,
    pub owner_direct_mode: bool,
    pub fast_path_enabled: bool,
    pub fast_path_max_chars: usize,
    pub auto_web_research_enabled: bool,
    pub auto_web_research_max_rounds: u32,
    pub auto_web_research_max_sources: u32,
    pub auto_web_research_max_pages: u32,
    pub auto_web_research_depth: String,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let depth = env_str("ASTRA_CHAT_AUTO_WEB_RESEARCH_DEPTH", "brief").to_lowercase();
        let depth = if matches!(depth.as_str(), "brief" | "normal" | "deep") {
            depth
        } else {
            "brief".to_string()
        };
        Self {
            temperature: env_float("ASTRA_LLM_CHAT_TEMPERATURE", 0.35).clamp(0.1, 1.0),
            top_p: env_float("ASTRA_LLM_CHAT_TOP_P", 0.9).clamp(0.0, 1.0),
            repeat_penalty: env_float("ASTRA_LLM_CHAT_REPEAT_PENALTY", 1.15).max(1.0),
            num_predict: env_int("ASTRA_LLM_OLLAMA_NUM_PREDICT", 256).clamp(64, 2048),
            owner_direct_mode: env_bool("ASTRA_OWNER_DIRECT_MODE", true),
            fast_path_enabled: env_bool("ASTRA_CHAT_FAST_PATH_ENABLED", true),
            fast_path_max_chars: env_int("ASTRA_CHAT_FAST_PATH_MAX_CHARS", 220).clamp(60, 600)
                as usize,
            auto_web_research_enabled: env_bool("ASTRA_CHAT_AUTO_WEB_RESEARCH_ENABLED", true),
            auto_web_research_max_rounds: env_int("ASTRA_CHAT_AUTO_WEB_RESEARCH_MAX_ROUNDS", 2)
                .clamp(1, 4) as u32,
            auto_web_research_max_sources: env_int("ASTRA_CHAT_AUTO_WEB_RESEARCH_MAX_SOURCES", 6)
                .clamp(1, 16) as u32,
            auto_web_research_max_pages: env_int("ASTRA_CHAT_AUTO_WEB_RESEARCH_MAX_PAGES", 4)
                .clamp(1, 12) as u32,
            auto_web_research_depth: depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hard cap for `create_user_memory` content, in characters.
    pub max_content_chars: usize,
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        Self {
            max_content_chars: env_int("ASTRA_MEMORY_MAX_CHARS", 4000).clamp(200, 64_000) as usize,
        }
    }
}

/// Auxiliary episodic DB (sliding window of recent episodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicConfig {
    pub db_path: PathBuf,
    pub max_episodes: u32,
}

impl EpisodicConfig {
    pub fn from_env() -> Self {
        let db_path = env_opt_str("ASTRA_LETTA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".astra").join("letta_episodic.sqlite3"));
        Self {
            db_path,
            max_episodes: env_int("ASTRA_LETTA_MAX_EPISODES", 300).max(10) as u32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub auth_mode: AuthMode,
    pub chat: ChatConfig,
    pub memory: MemoryConfig,
    pub episodic: EpisodicConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env_opt_str("ASTRA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".astra"));
        Self {
            data_dir,
            auth_mode: AuthMode::from_env(),
            chat: ChatConfig::from_env(),
            memory: MemoryConfig::from_env(),
            episodic: EpisodicConfig::from_env(),
        }
    }

    pub fn qa_mode_env() -> bool {
        env_bool("ASTRA_QA_MODE", false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_defaults_are_clamped() {
        let cfg = ChatConfig::from_env();
        assert!(cfg.temperature >= 0.1 && cfg.temperature <= 1.0);
        assert!(cfg.repeat_penalty >= 1.0);
        assert!(cfg.num_predict >= 64);
        assert!(matches!(
            cfg.auto_web_research_depth.as_str(),
            "brief" | "normal" | "deep"
        ));
    }

    #[test]
    fn auth_mode_defaults_to_local() {
        assert_eq!(AuthMode::from_env(), AuthMode::Local);
    }
}
