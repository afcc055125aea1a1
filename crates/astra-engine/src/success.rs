// Success-criteria checks parsed from a plan step's free-text criteria.
// Lines of `contains:` / `not_contains:` / `regex:`; composite any_of/all_of
// come in as structured checks on the step inputs.

use regex::Regex;
use serde_json::Value;

pub fn parse_success_criteria(text: Option<&str>) -> Vec<Value> {
    let Some(text) = text else {
        return Vec::new();
    };
    let mut checks = Vec::new();
    for raw in text.split(|c| matches!(c, '\n' | ';')) {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        if let Some(value) = lowered
            .strip_prefix("contains:")
            .map(|_| line.splitn(2, ':').nth(1).unwrap_or("").trim())
        {
            if !value.is_empty() {
                checks.push(serde_json::json!({
                    "type": "contains_text",
                    "value": value,
                    "case_sensitive": false,
                }));
            }
        } else if lowered.starts_with("not_contains:") || lowered.starts_with("not contains:") {
            let value = line.splitn(2, ':').nth(1).unwrap_or("").trim();
            if !value.is_empty() {
                checks.push(serde_json::json!({ "type": "not_contains_text", "value": value }));
            }
        } else if lowered.starts_with("regex:") {
            let value = line.splitn(2, ':').nth(1).unwrap_or("").trim();
            if !value.is_empty() {
                checks.push(serde_json::json!({ "type": "regex_match", "pattern": value }));
            }
        }
    }
    checks
}

pub fn normalize_success_checks(
    success_checks: Option<&Value>,
    success_criteria: Option<&str>,
) -> Vec<Value> {
    if let Some(Value::Array(items)) = success_checks {
        let structured: Vec<Value> = items.iter().filter(|item| item.is_object()).cloned().collect();
        if !structured.is_empty() {
            return structured;
        }
    }
    parse_success_criteria(success_criteria)
}

fn contains(text: &str, value: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        text.contains(value)
    } else {
        text.to_lowercase().contains(&value.to_lowercase())
    }
}

fn eval_check(check: &Value, text: &str) -> bool {
    match check.get("type").and_then(Value::as_str) {
        Some("contains_text") => {
            let value = check.get("value").and_then(Value::as_str).unwrap_or("");
            if value.is_empty() {
                return false;
            }
            let case_sensitive = check
                .get("case_sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            contains(text, value, case_sensitive)
        }
        Some("not_contains_text") => {
            let value = check.get("value").and_then(Value::as_str).unwrap_or("");
            if value.is_empty() {
                return false;
            }
            !text.to_lowercase().contains(&value.to_lowercase())
        }
        Some("regex_match") => {
            let pattern = check.get("pattern").and_then(Value::as_str).unwrap_or("");
            if pattern.is_empty() {
                return false;
            }
            match Regex::new(pattern) {
                Ok(re) => re.is_match(text),
                Err(_) => false,
            }
        }
        Some("any_of") => check
            .get("checks")
            .and_then(Value::as_array)
            .map(|nested| nested.iter().any(|item| eval_check(item, text)))
            .unwrap_or(false),
        Some("all_of") => check
            .get("checks")
            .and_then(Value::as_array)
            .map(|nested| !nested.is_empty() && nested.iter().all(|item| eval_check(item, text)))
            .unwrap_or(false),
        _ => false,
    }
}

/// Empty check lists never pass: the caller decides what "no criteria" means.
pub fn evaluate_success_checks(checks: &[Value], text: &str) -> bool {
    if checks.is_empty() {
        return false;
    }
    checks.iter().all(|check| eval_check(check, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_prefixes() {
        let checks = parse_success_criteria(Some(
            "contains: готово\nnot_contains: ошибка; regex: итог\\s+\\d+",
        ));
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0]["type"], "contains_text");
        assert_eq!(checks[1]["type"], "not_contains_text");
        assert_eq!(checks[2]["type"], "regex_match");
    }

    #[test]
    fn evaluates_all_checks_conjunctively() {
        let checks = parse_success_criteria(Some("contains: готово\nnot_contains: ошибка"));
        assert!(evaluate_success_checks(&checks, "Всё готово без проблем"));
        assert!(!evaluate_success_checks(&checks, "Готово, но была ошибка"));
        assert!(!evaluate_success_checks(&[], "что угодно"));
    }

    #[test]
    fn composite_checks_nest() {
        let check = serde_json::json!({
            "type": "any_of",
            "checks": [
                { "type": "contains_text", "value": "done" },
                { "type": "contains_text", "value": "готово" },
            ],
        });
        assert!(evaluate_success_checks(std::slice::from_ref(&check), "всё готово"));
        assert!(!evaluate_success_checks(&[check], "ничего"));
    }
}
