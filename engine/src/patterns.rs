//! Hook-name pattern matching.
//!
//! Hook patterns support two rewriting forms before literal comparison:
//!
//! * `db-relation-{joined,changed}` expands the braces to one pattern per
//!   alternative.
//! * `{provides:mysql}-relation-joined` expands a role/interface pair to the
//!   relation names supplied by a [`RelationLookup`].
//!
//! Both forms may appear multiple times in one pattern.

use std::sync::LazyLock;

use regex::Regex;

/// Role/interface to relation-name resolution, supplied by the relation
/// layer. The engine only consumes this interface.
pub trait RelationLookup {
    fn relations(&self, role: &str, interface: &str) -> Vec<String>;
}

/// Lookup that knows no relations; `{role:interface}` patterns expand to
/// nothing under it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelations;

impl RelationLookup for NoRelations {
    fn relations(&self, _role: &str, _interface: &str) -> Vec<String> {
        Vec::new()
    }
}

static INTERFACE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^:}]+):([^}]+)\}").expect("interface pattern is valid"));
static ALTERNATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{((?:[^:,}]+,?)+)\}").expect("alternation pattern is valid"));

/// Expand every `{...}` occurrence in `patterns` to literal alternatives.
pub(crate) fn expand_patterns(patterns: &[String], lookup: &dyn RelationLookup) -> Vec<String> {
    let expanded = expand_with(patterns.to_vec(), &INTERFACE_PATTERN, |groups| {
        lookup.relations(&groups[0], &groups[1])
    });
    expand_with(expanded, &ALTERNATION_PATTERN, |groups| {
        groups[0].split(',').map(str::to_string).collect()
    })
}

/// Does the current hook name match any of the (unexpanded) patterns?
pub(crate) fn matches_hook(hook: &str, patterns: &[String], lookup: &dyn RelationLookup) -> bool {
    expand_patterns(patterns, lookup).iter().any(|p| p == hook)
}

fn expand_with<F>(mut values: Vec<String>, pattern: &Regex, replacements: F) -> Vec<String>
where
    F: Fn(Vec<String>) -> Vec<String>,
{
    while values.iter().any(|v| pattern.is_match(v)) {
        let mut next = Vec::new();
        for value in values {
            let Some(caps) = pattern.captures(&value) else {
                next.push(value);
                continue;
            };
            let whole = caps.get(0).expect("capture 0 always present").as_str();
            let groups: Vec<String> = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().to_string())
                .collect();
            // Replace one occurrence at a time so multiple braces in a single
            // pattern multiply out instead of being substituted in lockstep.
            for replacement in replacements(groups.clone()) {
                next.push(value.replacen(whole, &replacement, 1));
            }
        }
        values = next;
    }
    values
}
