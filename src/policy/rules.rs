//! Activation rule evaluation.
//!
//! Rule lists are evaluated left to right with no precedence. The first rule
//! seeds the result; each later rule combines with it through its own
//! operator and can end evaluation early:
//! - `And` on a false result stops with false before or after evaluating.
//! - `Or` on a true result stops with true before or after evaluating.

use crate::policy::component::extract_component;
use crate::protocol::models::{MatchKind, Operator, Rule, VariantRule};

/// Evaluate one rule against an already extracted component.
pub fn match_single(rule: &Rule, component: Option<&str>) -> bool {
    let (component, value) = if rule.case_sensitive {
        (component.map(str::to_string), rule.value.clone())
    } else {
        (
            component.map(str::to_lowercase),
            rule.value.to_lowercase(),
        )
    };

    let matched = match rule.match_kind {
        MatchKind::Equal => component.as_deref().unwrap_or("") == value,
        MatchKind::Contain => component
            .as_deref()
            .is_some_and(|c| !c.is_empty() && c.contains(value.as_str())),
        MatchKind::Exist => component.as_deref().is_some_and(|c| !c.is_empty()),
    };

    tracing::trace!(
        component = ?rule.component,
        value = %value,
        matched,
        negate = rule.negate,
        "rule evaluated"
    );

    matched != rule.negate
}

/// Extract a rule's component from the request and evaluate it.
pub fn match_rule<F>(rule: &Rule, request_url: &str, cookie: &F) -> bool
where
    F: Fn(&str) -> Option<String> + ?Sized,
{
    let component = extract_component(rule, request_url, cookie);
    match_single(rule, component.as_deref())
}

/// Evaluate an ordered rule list. An empty list never matches.
pub fn match_list<F>(rules: &[Rule], request_url: &str, cookie: &F) -> bool
where
    F: Fn(&str) -> Option<String> + ?Sized,
{
    let Some((first, rest)) = rules.split_first() else {
        return false;
    };

    let mut state = match_rule(first, request_url, cookie);

    for rule in rest {
        match rule.operator {
            Operator::And => {
                if !state {
                    return false;
                }
                state = match_rule(rule, request_url, cookie);
                if !state {
                    return false;
                }
            }
            Operator::Or => {
                if state {
                    return true;
                }
                state = match_rule(rule, request_url, cookie);
                if state {
                    return true;
                }
            }
        }
    }

    state
}

/// First variant whose rules match, in document order.
pub fn pick_variant<'a, F>(
    variant_rules: &'a [VariantRule],
    request_url: &str,
    cookie: &F,
) -> Option<&'a str>
where
    F: Fn(&str) -> Option<String> + ?Sized,
{
    variant_rules
        .iter()
        .find(|variant| match_list(&variant.rules, request_url, cookie))
        .map(|variant| variant.variant.as_str())
}
