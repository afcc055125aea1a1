// Topic-relevance utilities shared by the chat guard loop and the web
// research off-topic filter: focus tokens from the query, stem-tolerant
// overlap against a candidate text.

use once_cell::sync::Lazy;
use regex::Regex;

pub static CYRILLIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[А-Яа-яЁё]").expect("cyrillic pattern"));
static RELEVANCE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-zА-Яа-яЁё0-9]+").expect("relevance token pattern"));

pub const RELEVANCE_STOPWORDS: &[&str] = &[
    "как", "что", "это", "где", "когда", "почему", "зачем", "или", "и", "а", "но", "же", "ли",
    "по", "на", "в", "с", "к", "из", "о", "об", "для", "про", "у", "от", "до", "the", "and",
    "or", "for", "with", "from", "into", "about", "this", "that", "what", "how",
];

/// Generic verbs/askers that anchor no topic of their own.
pub const TOPIC_ANCHOR_EXCLUDE: &[&str] = &[
    "пытали", "пытать", "пытался", "пыталась", "сюжет", "история", "знаешь", "знаете",
    "объясни", "объяснить", "расскажи", "рассказать", "сделай", "сделать", "можно", "нужно",
    "помоги", "помочь", "why", "how", "what", "explain", "tell", "help",
];

pub fn relevance_tokens(text: &str) -> Vec<String> {
    RELEVANCE_TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

pub fn query_focus_tokens(text: &str, limit: usize) -> Vec<String> {
    let mut focus = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for token in relevance_tokens(text) {
        if token.chars().count() < 3 || RELEVANCE_STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if !seen.insert(token.clone()) {
            continue;
        }
        focus.push(token);
        if focus.len() >= limit {
            break;
        }
    }
    focus
}

/// Count focus tokens present in the response, accepting 5-char stem matches
/// for longer tokens so inflected forms still count.
pub fn focus_overlap_count(focus_tokens: &[String], response_tokens: &[String]) -> usize {
    if focus_tokens.is_empty() || response_tokens.is_empty() {
        return 0;
    }
    let response_set: std::collections::HashSet<&str> =
        response_tokens.iter().map(String::as_str).collect();
    let long_response_tokens: Vec<&str> = response_set
        .iter()
        .copied()
        .filter(|token| token.chars().count() >= 5)
        .collect();

    let mut overlap = 0;
    for focus in focus_tokens {
        if response_set.contains(focus.as_str()) {
            overlap += 1;
            continue;
        }
        if focus.chars().count() < 5 {
            continue;
        }
        let stem: String = focus.chars().take(5).collect();
        if long_response_tokens.iter().any(|token| token.starts_with(&stem)) {
            overlap += 1;
        }
    }
    overlap
}

pub fn topic_anchor_tokens(focus_tokens: &[String]) -> Vec<String> {
    focus_tokens
        .iter()
        .filter(|token| !TOPIC_ANCHOR_EXCLUDE.contains(&token.as_str()))
        .cloned()
        .collect()
}

/// Heuristic off-topic check between a user query and a draft/candidate text.
/// Distinct rules for anchor-rich queries and long "critical" focus tokens.
pub fn is_likely_off_topic(user_text: &str, response_text: &str) -> bool {
    if user_text.trim().is_empty() || response_text.trim().is_empty() {
        return false;
    }
    let focus = query_focus_tokens(user_text, 8);
    if focus.len() < 2 {
        return false;
    }
    let response_tokens = relevance_tokens(response_text);
    let overlap = focus_overlap_count(&focus, &response_tokens);
    let query_words = user_text.split_whitespace().count();
    let anchor_focus = topic_anchor_tokens(&focus);

    if anchor_focus.len() >= 2 {
        let anchor_overlap = focus_overlap_count(&anchor_focus, &response_tokens);
        if anchor_overlap == 0 {
            return true;
        }
        if anchor_focus.len() >= 3 && query_words <= 20 && anchor_overlap <= 1 {
            return true;
        }
        let critical_focus: Vec<String> = anchor_focus
            .iter()
            .filter(|token| token.chars().count() >= 6)
            .cloned()
            .collect();
        if !critical_focus.is_empty()
            && focus_overlap_count(&critical_focus, &response_tokens) == 0
        {
            return true;
        }
        if critical_focus.len() >= 2 {
            let critical_overlap = focus_overlap_count(&critical_focus, &response_tokens);
            if critical_overlap <= critical_focus.len() - 1 && query_words <= 20 {
                return true;
            }
        }
    }
    if overlap == 0 {
        return true;
    }
    focus.len() >= 4 && query_words <= 16 && overlap <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_tokens_skip_stopwords_and_dedup() {
        let focus = query_focus_tokens("как работает насос и как работает клапан", 8);
        assert!(focus.contains(&"работает".to_string()));
        assert!(focus.contains(&"насос".to_string()));
        assert!(!focus.contains(&"как".to_string()));
        let unique: std::collections::HashSet<_> = focus.iter().collect();
        assert_eq!(unique.len(), focus.len());
    }

    #[test]
    fn stem_matching_counts_inflections() {
        let focus = vec!["тренировок".to_string()];
        let response = relevance_tokens("план тренировки на месяц");
        assert_eq!(focus_overlap_count(&focus, &response), 1);
    }

    #[test]
    fn unrelated_response_is_off_topic() {
        assert!(is_likely_off_topic(
            "сюжет аниме токийский гуль и кен канеки",
            "Сегодня отличная погода, советую прогуляться в парке и выпить кофе."
        ));
    }

    #[test]
    fn on_topic_response_passes() {
        assert!(!is_likely_off_topic(
            "кто такой кен канеки",
            "Кен Канеки — главный герой аниме Токийский гуль, студент, ставший полугулем."
        ));
    }

    #[test]
    fn short_queries_are_never_flagged() {
        assert!(!is_likely_off_topic("привет", "Здравствуй!"));
    }
}
