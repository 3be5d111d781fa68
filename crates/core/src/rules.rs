//! Wildcard rule compilation.
//!
//! A rule is a permission pattern such as `chat.*`, optionally prefixed
//! with `-` to deny instead of grant. Patterns compile to anchored,
//! case-insensitive regular expressions; `*` is the only wildcard.

use crate::data::CompiledRule;
use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashMap;
use tracing::error;

/// Characters that must be escaped when a pattern becomes a regex.
const ESCAPED: &str = ".\\+?^$[](){}|";

/// Translate a wildcard pattern into an anchored matcher. `*` matches any
/// run of characters, including across dots.
pub fn wildcard_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for c in pattern.chars() {
        if c == '*' {
            expr.push_str(".*");
        } else if ESCAPED.contains(c) {
            expr.push('\\');
            expr.push(c);
        } else {
            expr.push(c);
        }
    }
    expr.push('$');
    RegexBuilder::new(&expr).case_insensitive(true).build()
}

/// Split a rule into its base pattern and grant/deny state. Returns
/// `None` for rules that are empty once the `-` is stripped.
pub fn parse_rule(rule: &str) -> Option<(&str, bool)> {
    let (base, state) = match rule.strip_prefix('-') {
        Some(rest) => (rest, false),
        None => (rule, true),
    };
    if base.is_empty() {
        None
    } else {
        Some((base, state))
    }
}

/// Compile an effective `pattern -> state` map into matcher form, sorted
/// by pattern length descending so the most specific rule wins. Patterns
/// that fail to compile are skipped; the rest of the set still applies.
pub fn compile_rule_set(effective: &FxHashMap<String, bool>) -> Vec<CompiledRule> {
    let mut compiled: Vec<CompiledRule> = effective
        .iter()
        .filter_map(|(pattern, &state)| match wildcard_to_regex(pattern) {
            Ok(matcher) => Some(CompiledRule {
                pattern: pattern.clone(),
                matcher,
                state,
            }),
            Err(err) => {
                error!("invalid permission pattern '{pattern}': {err}");
                None
            }
        })
        .collect();
    compiled.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
    compiled
}

/// First matching rule wins; the caller falls back to the node's default
/// when nothing matches.
pub fn first_match(rules: &[CompiledRule], node: &str) -> Option<bool> {
    rules
        .iter()
        .find(|rule| rule.matcher.is_match(node))
        .map(|rule| rule.state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_set(rules: &[(&str, bool)]) -> Vec<CompiledRule> {
        let mut effective = FxHashMap::default();
        for (pattern, state) in rules {
            effective.insert((*pattern).to_owned(), *state);
        }
        compile_rule_set(&effective)
    }

    #[test]
    fn literal_patterns_are_anchored() {
        let regex = wildcard_to_regex("world.edit").unwrap();
        assert!(regex.is_match("world.edit"));
        assert!(!regex.is_match("world.editor"));
        assert!(!regex.is_match("my.world.edit"));
    }

    #[test]
    fn dot_is_escaped() {
        let regex = wildcard_to_regex("a.b").unwrap();
        assert!(!regex.is_match("axb"));
    }

    #[test]
    fn star_matches_across_segments() {
        let regex = wildcard_to_regex("chat.*").unwrap();
        assert!(regex.is_match("chat.send"));
        assert!(regex.is_match("chat.channel.global"));
        assert!(!regex.is_match("chat"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let regex = wildcard_to_regex("World.Edit").unwrap();
        assert!(regex.is_match("world.edit"));
        assert!(regex.is_match("WORLD.EDIT"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let regex = wildcard_to_regex("perm+x?").unwrap();
        assert!(regex.is_match("perm+x?"));
        assert!(!regex.is_match("permmx"));
    }

    #[test]
    fn negation_is_stripped_into_state() {
        assert_eq!(parse_rule("-chat.send"), Some(("chat.send", false)));
        assert_eq!(parse_rule("chat.send"), Some(("chat.send", true)));
        assert_eq!(parse_rule("-"), None);
        assert_eq!(parse_rule(""), None);
    }

    #[test]
    fn longest_pattern_sorts_first() {
        let rules = rule_set(&[("a.*", false), ("a.b.*", true)]);
        assert_eq!(rules[0].pattern, "a.b.*");
        // The longest matching pattern decides: a.b.c is granted even
        // though a.* denies.
        assert_eq!(first_match(&rules, "a.b.c"), Some(true));
        assert_eq!(first_match(&rules, "a.x"), Some(false));
        assert_eq!(first_match(&rules, "b.c"), None);
    }
}
