//! A small allow/deny policy evaluator over `subject`/`resource`/`action`
//! triples, each of which may end in a single wildcard segment.
//!
//! This module is deliberately not wired into the orchestrator: nothing here
//! calls `evaluate` against a live request. It exists as a standalone
//! building block for a caller that wants to gate `save_workflow`/
//! `run_workflow`/`apply_workflow` behind authorization, without baking any
//! particular authorization model into the orchestrator itself.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// The result of evaluating a request against a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// One policy rule. `subject`/`resource`/`action` are `:`-separated segment
/// paths; the last segment of any of the three may be the literal `*`,
/// matching any single final segment (not multiple segments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub subject: String,
    pub resource: String,
    pub action: String,
    pub effect: Effect,
}

impl Rule {
    /// Validates the rule's shape.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::EmptySubject`]/[`EmptyResource`](PolicyError::EmptyResource)/
    ///   [`EmptyAction`](PolicyError::EmptyAction) if the corresponding field is empty.
    /// - [`PolicyError::WildcardNotLast`] if a `*` segment appears anywhere but last.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.subject.is_empty() {
            return Err(PolicyError::EmptySubject);
        }
        if self.resource.is_empty() {
            return Err(PolicyError::EmptyResource);
        }
        if self.action.is_empty() {
            return Err(PolicyError::EmptyAction);
        }
        check_wildcard_position("subject", &self.subject)?;
        check_wildcard_position("resource", &self.resource)?;
        check_wildcard_position("action", &self.action)?;
        Ok(())
    }

    fn matches(&self, subject: &str, resource: &str, action: &str) -> bool {
        subject_matches(&self.subject, subject)
            && path_matches(&self.resource, resource, subject, true)
            && path_matches(&self.action, action, subject, false)
    }
}

fn check_wildcard_position(field: &'static str, path: &str) -> Result<(), PolicyError> {
    let segments: Vec<&str> = path.split(':').collect();
    for (idx, segment) in segments.iter().enumerate() {
        if *segment == "*" && idx != segments.len() - 1 {
            return Err(PolicyError::WildcardNotLast { field });
        }
    }
    Ok(())
}

/// Matches a rule's `subject` field: either the literal wildcard `"*"`
/// (matches any subject) or an exact, whole-string match. Unlike
/// `resource`/`action`, subject is never matched segment-by-segment.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    pattern == "*" || pattern == subject
}

/// Matches a rule path against a concrete value path, segment by segment,
/// by prefix. A pattern ending in `*` matches the value if every segment
/// before the `*` matches the corresponding value segment, regardless of
/// how many (including zero) further segments the value has; a pattern
/// with no trailing `*` must match the value exactly, segment for segment.
///
/// When `honor_subject_segment` is set (resource paths only, per the
/// reserved `_subject` segment; not honoured for actions), a pattern
/// segment of `_subject` matches iff the corresponding value segment
/// equals the current `subject` string.
fn path_matches(pattern: &str, value: &str, subject: &str, honor_subject_segment: bool) -> bool {
    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let value_segments: Vec<&str> = value.split(':').collect();

    let (prefix, wildcard) = match pattern_segments.split_last() {
        Some((&"*", rest)) => (rest, true),
        _ => (pattern_segments.as_slice(), false),
    };

    if wildcard {
        if value_segments.len() < prefix.len() {
            return false;
        }
    } else if prefix.len() != value_segments.len() {
        return false;
    }

    prefix.iter().enumerate().all(|(idx, pattern_segment)| {
        let value_segment = value_segments[idx];
        if honor_subject_segment && *pattern_segment == "_subject" {
            value_segment == subject
        } else {
            *pattern_segment == value_segment
        }
    })
}

/// Evaluates `subject`/`resource`/`action` against `rules`.
///
/// Deny takes precedence: if any rule with `effect: Deny` matches, the
/// result is `Deny` even if an `Allow` rule also matches. With no matching
/// rule at all, the default is `Deny`.
#[must_use]
pub fn evaluate(rules: &[Rule], subject: &str, resource: &str, action: &str) -> Effect {
    let mut allowed = false;
    for rule in rules {
        if rule.matches(subject, resource, action) {
            match rule.effect {
                Effect::Deny => return Effect::Deny,
                Effect::Allow => allowed = true,
            }
        }
    }
    if allowed {
        Effect::Allow
    } else {
        Effect::Deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(subject: &str, resource: &str, action: &str, effect: Effect) -> Rule {
        Rule {
            subject: subject.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            effect,
        }
    }

    #[test]
    fn exact_match_allows() {
        let rules = vec![rule("user:alice", "workflow:1", "run", Effect::Allow)];
        assert_eq!(evaluate(&rules, "user:alice", "workflow:1", "run"), Effect::Allow);
    }

    #[test]
    fn no_matching_rule_defaults_to_deny() {
        let rules = vec![rule("user:alice", "workflow:1", "run", Effect::Allow)];
        assert_eq!(evaluate(&rules, "user:bob", "workflow:1", "run"), Effect::Deny);
    }

    #[test]
    fn deny_overrides_matching_allow() {
        let rules = vec![
            rule("*", "workflow:1", "run", Effect::Allow),
            rule("user:bob", "workflow:1", "run", Effect::Deny),
        ];
        assert_eq!(evaluate(&rules, "user:bob", "workflow:1", "run"), Effect::Deny);
    }

    #[test]
    fn subject_wildcard_matches_any_subject() {
        let rules = vec![rule("*", "workflow:*", "*", Effect::Allow)];
        assert_eq!(evaluate(&rules, "user:alice", "workflow:42", "remove"), Effect::Allow);
    }

    #[test]
    fn subject_field_requires_exact_match_not_prefix() {
        let rules = vec![rule("user:bob", "workflow:1", "run", Effect::Allow)];
        assert_eq!(evaluate(&rules, "user:bob:admin", "workflow:1", "run"), Effect::Deny);
    }

    #[test]
    fn resource_wildcard_matches_any_number_of_trailing_segments() {
        let rules = vec![rule("*", "dataset:alice:*", "run", Effect::Allow)];
        assert_eq!(evaluate(&rules, "user:alice", "dataset:alice", "run"), Effect::Allow);
        assert_eq!(evaluate(&rules, "user:alice", "dataset:alice:mydata:v2", "run"), Effect::Allow);
        assert_eq!(evaluate(&rules, "user:alice", "dataset:bob:mydata", "run"), Effect::Deny);
    }

    #[test]
    fn resource_subject_segment_binds_to_current_subject() {
        let rules = vec![rule("*", "dataset:_subject:*", "run", Effect::Allow)];
        assert_eq!(evaluate(&rules, "alice", "dataset:alice:mydata", "run"), Effect::Allow);
        assert_eq!(evaluate(&rules, "alice", "dataset:bob:mydata", "run"), Effect::Deny);
    }

    #[test]
    fn action_does_not_honor_subject_segment() {
        let rules = vec![rule("*", "dataset:*", "_subject:run", Effect::Allow)];
        assert_eq!(evaluate(&rules, "alice", "dataset:mydata", "alice:run"), Effect::Deny);
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let r = rule("", "workflow:1", "run", Effect::Allow);
        assert!(matches!(r.validate(), Err(PolicyError::EmptySubject)));
    }

    #[test]
    fn validate_rejects_non_terminal_wildcard() {
        let r = rule("user:*:admin", "workflow:1", "run", Effect::Allow);
        assert!(matches!(r.validate(), Err(PolicyError::WildcardNotLast { field: "subject" })));
    }
}
