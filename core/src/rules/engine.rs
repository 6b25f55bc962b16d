//! Rule selection: keyword matching, priority tie-breaks, and dependency
//! ordering for prompt assembly.

use crate::errors::{RuleError, RuleResult};
use crate::rules::catalog::{Catalog, Rule};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Ordered selection result. `rules` is concatenation-ready: dependencies
/// come before their dependents and the primary rule closes its own chain.
#[derive(Debug, Clone)]
pub struct Selection {
    pub rules: Vec<Arc<Rule>>,
    pub primary_id: String,
}

impl Selection {
    pub fn primary(&self) -> &Arc<Rule> {
        // The primary is always present; it seeded the selection.
        self.rules
            .iter()
            .find(|r| r.id == self.primary_id)
            .expect("selection contains its primary")
    }
}

/// Select the applicable rules for a ticket description.
///
/// A rule matches when any of its keywords occurs as a case-insensitive
/// substring of the description. No match falls back to the catalog's
/// fallback rule. Matches are ranked by priority descending, id ascending;
/// the best-ranked match is the primary. The returned list is the matched
/// rules plus the transitive closure of their dependencies in topological
/// order, deduplicated, with the primary's chain last.
pub fn select_rules(
    catalog: &Catalog,
    description: &str,
    _category: Option<&str>,
) -> RuleResult<Selection> {
    if catalog.is_empty() {
        return Err(RuleError::MissingFallback);
    }

    let needle = description.to_lowercase();
    let mut matched: Vec<Arc<Rule>> = catalog
        .iter()
        .filter(|rule| rule.enabled)
        .filter(|rule| {
            rule.keywords
                .iter()
                .any(|kw| !kw.is_empty() && needle.contains(&kw.to_lowercase()))
        })
        .cloned()
        .collect();

    if matched.is_empty() {
        let fallback = catalog.fallback().ok_or(RuleError::MissingFallback)?;
        return Ok(Selection {
            rules: vec![fallback.clone()],
            primary_id: fallback.id.clone(),
        });
    }

    matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    let primary_id = matched[0].id.clone();

    // Emit non-primary chains first so the primary's playbook lands closest
    // to the end of the prompt.
    let mut ordered = Vec::new();
    let mut emitted = HashSet::new();
    let mut visiting = HashSet::new();
    for rule in matched.iter().skip(1).chain(std::iter::once(&matched[0])) {
        push_with_dependencies(catalog, rule, &mut ordered, &mut emitted, &mut visiting);
    }

    Ok(Selection { rules: ordered, primary_id })
}

/// Post-order dependency walk: dependencies strictly before dependents.
/// Cycles and unknown ids were rejected at load, but a stale snapshot can
/// still surface them here, so both are dropped with a warning.
fn push_with_dependencies(
    catalog: &Catalog,
    rule: &Arc<Rule>,
    ordered: &mut Vec<Arc<Rule>>,
    emitted: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
) {
    if emitted.contains(&rule.id) {
        return;
    }
    if !visiting.insert(rule.id.clone()) {
        warn!(rule = %rule.id, "Dependency cycle at selection time; breaking edge");
        return;
    }

    for dep_id in &rule.depends_on {
        match catalog.get(dep_id) {
            Some(dep) if dep.enabled => {
                push_with_dependencies(catalog, dep, ordered, emitted, visiting);
            }
            Some(_) => {}
            None => {
                warn!(rule = %rule.id, dependency = %dep_id, "Unknown dependency id dropped");
            }
        }
    }

    visiting.remove(&rule.id);
    emitted.insert(rule.id.clone());
    ordered.push(rule.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::catalog::PreExtractSpec;
    use std::path::PathBuf;

    fn rule(id: &str, keywords: &[&str], priority: i32, deps: &[&str]) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            version: 1,
            enabled: true,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            priority,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            needs_code: false,
            pre_extract: vec![],
            body: String::new(),
            path: PathBuf::new(),
        }
    }

    fn catalog(rules: Vec<Rule>) -> Catalog {
        Catalog::build(rules).unwrap()
    }

    #[test]
    fn test_keyword_miss_returns_fallback() {
        let catalog = catalog(vec![
            rule("bt", &["蓝牙"], 8, &[]),
            rule("rec", &["recording"], 10, &[]),
            rule("general", &[], 0, &[]),
        ]);
        let selection =
            select_rules(&catalog, "random gibberish about user login", None).unwrap();
        assert_eq!(selection.primary_id, "general");
        assert_eq!(selection.rules.len(), 1);
        assert_eq!(selection.rules[0].id, "general");
    }

    #[test]
    fn test_priority_and_dependency_order() {
        let catalog = catalog(vec![
            rule("recording-missing", &["录音丢失"], 10, &["timestamp-drift"]),
            rule("timestamp-drift", &["time drift"], 8, &[]),
            rule("bluetooth", &["蓝牙", "bluetooth"], 8, &[]),
            rule("general", &[], 0, &[]),
        ]);
        let selection =
            select_rules(&catalog, "录音丢失 and time drift", None).unwrap();
        let ids: Vec<_> = selection.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["timestamp-drift", "recording-missing"]);
        assert_eq!(selection.primary_id, "recording-missing");
    }

    #[test]
    fn test_keyword_match_is_case_insensitive_substring() {
        let catalog = catalog(vec![
            rule("bt", &["Bluetooth"], 8, &[]),
            rule("general", &[], 0, &[]),
        ]);
        let selection = select_rules(&catalog, "my BLUETOOTH headset drops", None).unwrap();
        assert_eq!(selection.primary_id, "bt");
    }

    #[test]
    fn test_priority_tie_breaks_on_id() {
        let catalog = catalog(vec![
            rule("b-rule", &["crash"], 5, &[]),
            rule("a-rule", &["crash"], 5, &[]),
            rule("general", &[], 0, &[]),
        ]);
        let selection = select_rules(&catalog, "app crash on boot", None).unwrap();
        assert_eq!(selection.primary_id, "a-rule");
    }

    #[test]
    fn test_disabled_rules_filtered() {
        let mut disabled = rule("rec", &["recording"], 10, &[]);
        disabled.enabled = false;
        let catalog = catalog(vec![disabled, rule("general", &[], 0, &[])]);
        let selection = select_rules(&catalog, "recording broken", None).unwrap();
        assert_eq!(selection.primary_id, "general");
    }

    #[test]
    fn test_transitive_closure_no_duplicates() {
        let catalog = catalog(vec![
            rule("top", &["alpha"], 10, &["mid"]),
            rule("also", &["alpha"], 9, &["base"]),
            rule("mid", &[], 3, &["base"]),
            rule("base", &[], 1, &[]),
        ]);
        let selection = select_rules(&catalog, "alpha problem", None).unwrap();
        let ids: Vec<_> = selection.rules.iter().map(|r| r.id.as_str()).collect();
        // `base` appears once, before both dependents; primary chain last.
        assert_eq!(ids, vec!["base", "also", "mid", "top"]);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_missing_dependency_dropped() {
        // Build bypasses load-time validation for unknown ids, so the walk
        // must tolerate them.
        let catalog = catalog(vec![
            rule("rec", &["recording"], 10, &["ghost"]),
            rule("general", &[], 0, &[]),
        ]);
        let selection = select_rules(&catalog, "recording", None).unwrap();
        let ids: Vec<_> = selection.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rec"]);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let catalog = catalog(vec![
            rule("r1", &["x"], 4, &["r3"]),
            rule("r2", &["x"], 4, &[]),
            rule("r3", &[], 1, &[]),
            rule("general", &[], 0, &[]),
        ]);
        let first = select_rules(&catalog, "x marks the spot", None).unwrap();
        for _ in 0..10 {
            let again = select_rules(&catalog, "x marks the spot", None).unwrap();
            let a: Vec<_> = first.rules.iter().map(|r| r.id.as_str()).collect();
            let b: Vec<_> = again.rules.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_empty_catalog_errors() {
        let catalog = Catalog::build(vec![]).unwrap();
        assert!(select_rules(&catalog, "anything", None).is_err());
    }

    #[test]
    fn test_pre_extract_carried_through() {
        let mut r = rule("rec", &["recording"], 10, &[]);
        r.pre_extract.push(PreExtractSpec {
            name: "session".to_string(),
            pattern: "RecordSession".to_string(),
            date_filter: true,
        });
        let catalog = catalog(vec![r, rule("general", &[], 0, &[])]);
        let selection = select_rules(&catalog, "recording lost", None).unwrap();
        assert_eq!(selection.primary().pre_extract.len(), 1);
    }
}
