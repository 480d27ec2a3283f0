//! Auto-Responder (§4.5): matches safe rules against a detected prompt,
//! gated by three hard, ordered blocks that nothing can override.

use regex::Regex;

use crate::classifier::{Classifier, DetectionType};
use crate::store::AutoRuleRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Respond { response: String, rule_id: i64 },
    Block { reason: &'static str },
}

/// Evaluate a prompt against the guards and enabled rules, in that order
/// (§4.5). `rules` must already be filtered/sorted by the caller if it
/// wants to honor "iterate enabled rules in id order" literally — this
/// function also defensively skips disabled rules and sorts by id.
pub fn decide(
    detection_type: DetectionType,
    prompt_text: &str,
    globally_paused: bool,
    rules: &[AutoRuleRow],
) -> Decision {
    if detection_type == DetectionType::PermissionPrompt {
        return Decision::Block {
            reason: "permission prompt",
        };
    }
    if Classifier::has_destructive_keyword(prompt_text) {
        return Decision::Block {
            reason: "destructive keyword",
        };
    }
    if globally_paused {
        return Decision::Block {
            reason: "globally paused",
        };
    }

    let mut ordered: Vec<&AutoRuleRow> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by_key(|r| r.id);

    for rule in ordered {
        if rule_matches(rule, prompt_text) {
            return Decision::Respond {
                response: rule.response.clone(),
                rule_id: rule.id,
            };
        }
    }

    Decision::Block { reason: "no rule" }
}

fn rule_matches(rule: &AutoRuleRow, prompt_text: &str) -> bool {
    use crate::store::MatchType;
    match rule.match_type {
        MatchType::Exact => rule.pattern.trim() == prompt_text.trim(),
        MatchType::Contains => prompt_text
            .to_lowercase()
            .contains(&rule.pattern.to_lowercase()),
        MatchType::Regex => Regex::new(&rule.pattern)
            .map(|re| re.is_match(prompt_text))
            .unwrap_or(false),
    }
}
