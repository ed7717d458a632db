//! Validation-node predicates: pure functions over the last user input.
//! Matching is Unicode case-folded throughout.

use std::sync::OnceLock;

use chasqui_flows::node::{
    FormatPattern, GroupCombine, KeywordMatch, LengthConfig, RangeConfig, ValidationMode,
};
use regex::Regex;
use serde_json::{Map, Value};

/// Evaluate a validation mode. `Err` is a genuine node error (bad regex),
/// routed along `out:error`; `Ok(false)` is a plain no-match.
pub fn validate(
    mode: &ValidationMode,
    input: &str,
    variables: &Map<String, Value>,
) -> Result<bool, String> {
    match mode {
        ValidationMode::Keywords(cfg) => {
            let folded = fold(input);
            let group_hit = |group: &chasqui_flows::node::KeywordGroup| {
                group.terms.iter().any(|term| match group.mode {
                    KeywordMatch::Contains => folded.contains(&fold(term)),
                    KeywordMatch::Exact => folded == fold(term),
                })
            };
            Ok(match cfg.combine {
                GroupCombine::And => cfg.groups.iter().all(group_hit),
                GroupCombine::Or => cfg.groups.iter().any(group_hit),
            })
        }
        ValidationMode::Format(cfg) => Ok(match cfg.pattern {
            FormatPattern::Email => email_re().is_match(input.trim()),
            FormatPattern::Phone => is_phone(input.trim()),
            FormatPattern::Dni => is_digits(input.trim(), 8),
            FormatPattern::Ruc => is_digits(input.trim(), 11),
        }),
        ValidationMode::Variable(cfg) => {
            let current = variables.get(&cfg.name).map(render);
            Ok(match (&cfg.equals, current) {
                // fixed comparison: the stored variable must equal `equals`
                (Some(expected), Some(current)) => fold(&current) == fold(expected),
                (Some(_), None) => false,
                // open comparison: the input must equal the stored variable
                (None, Some(current)) => fold(input.trim()) == fold(&current),
                (None, None) => false,
            })
        }
        ValidationMode::Range(RangeConfig { min, max }) => Ok(input
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map(|n| n >= *min && n <= *max)
            .unwrap_or(false)),
        ValidationMode::Length(LengthConfig { min, max }) => {
            let len = input.chars().count();
            Ok(len >= *min && len <= *max)
        }
        ValidationMode::Regex(cfg) => {
            let re = Regex::new(&cfg.pattern).map_err(|e| format!("invalid regex: {e}"))?;
            Ok(re.is_match(input))
        }
        ValidationMode::OptionsList(cfg) => {
            let folded = fold(input.trim());
            Ok(cfg.options.iter().any(|o| fold(o) == folded))
        }
    }
}

fn fold(s: &str) -> String {
    s.to_lowercase()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap())
}

fn is_phone(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && (7..=15).contains(&digits.len())
}

fn is_digits(s: &str, exact: usize) -> bool {
    s.len() == exact && s.chars().all(|c| c.is_ascii_digit())
}
