use astra_core::config::{env_int, env_opt_int, env_opt_str, env_str};
use serde::{Deserialize, Serialize};

/// Brain knobs. Tier thresholds and timeouts mirror the `ASTRA_LLM_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConfig {
    pub local_base_url: String,
    pub local_chat_model: String,
    pub local_chat_fast_model: Option<String>,
    pub local_chat_complex_model: Option<String>,
    pub local_code_model: String,
    pub local_timeout_s: u64,
    pub local_num_ctx: i64,
    pub local_num_predict: i64,
    pub fast_query_max_chars: usize,
    pub fast_query_max_words: usize,
    pub complex_query_min_chars: usize,
    pub complex_query_min_words: usize,
    pub max_concurrency: usize,
    pub chat_priority_extra_slots: usize,
    pub chat_tier_timeout_s: u64,
    pub budget_per_run: Option<u32>,
    pub budget_per_step: Option<u32>,
}

impl BrainConfig {
    pub fn from_env() -> Self {
        Self {
            local_base_url: env_str("ASTRA_LLM_LOCAL_BASE_URL", "http://127.0.0.1:11434"),
            local_chat_model: env_str("ASTRA_LLM_LOCAL_CHAT_MODEL", "llama2-uncensored:7b"),
            local_chat_fast_model: env_opt_str("ASTRA_LLM_LOCAL_CHAT_MODEL_FAST")
                .or_else(|| Some("llama2-uncensored:7b".to_string())),
            local_chat_complex_model: env_opt_str("ASTRA_LLM_LOCAL_CHAT_MODEL_COMPLEX")
                .or_else(|| Some("wizardlm-uncensored:13b".to_string())),
            local_code_model: env_str(
                "ASTRA_LLM_LOCAL_CODE_MODEL",
                "deepseek-coder-v2:16b-lite-instruct-q8_0",
            ),
            local_timeout_s: env_int("ASTRA_LLM_LOCAL_TIMEOUT_S", 30).max(1) as u64,
            local_num_ctx: env_int("ASTRA_LLM_OLLAMA_NUM_CTX", 4096).max(1024),
            local_num_predict: env_int("ASTRA_LLM_OLLAMA_NUM_PREDICT", 256).max(64),
            fast_query_max_chars: env_int("ASTRA_LLM_FAST_QUERY_MAX_CHARS", 120).max(20) as usize,
            fast_query_max_words: env_int("ASTRA_LLM_FAST_QUERY_MAX_WORDS", 18).max(3) as usize,
            complex_query_min_chars: env_int("ASTRA_LLM_COMPLEX_QUERY_MIN_CHARS", 260).max(40)
                as usize,
            complex_query_min_words: env_int("ASTRA_LLM_COMPLEX_QUERY_MIN_WORDS", 45).max(8)
                as usize,
            max_concurrency: env_int("ASTRA_LLM_MAX_CONCURRENCY", 1).max(1) as usize,
            chat_priority_extra_slots: env_int("ASTRA_LLM_CHAT_PRIORITY_EXTRA_SLOTS", 1).max(0)
                as usize,
            chat_tier_timeout_s: env_int("ASTRA_LLM_CHAT_TIER_TIMEOUT_S", 20).max(5) as u64,
            budget_per_run: env_opt_int("ASTRA_LLM_BUDGET_PER_RUN").map(|v| v.max(0) as u32),
            budget_per_step: env_opt_int("ASTRA_LLM_BUDGET_PER_STEP").map(|v| v.max(0) as u32),
        }
    }
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
