//! Rule catalog: loads diagnostic playbooks from disk and serves immutable
//! snapshots to the selection engine.
//!
//! A rule file is markdown with a TOML header between `---` delimiter lines.
//! Reload builds and validates a complete new catalog off to the side, then
//! swaps the shared snapshot; readers keep whatever snapshot they grabbed.

use crate::errors::{RuleError, RuleResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One regex recipe applied by the pre-extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreExtractSpec {
    /// Label shown in the snippet block handed to the agent.
    pub name: String,
    /// Regex applied per log line.
    pub pattern: String,
    /// Restrict matches to the issue's event date ±1 day.
    #[serde(default)]
    pub date_filter: bool,
}

/// A diagnostic playbook: matching metadata plus an agent-facing prompt body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Substring triggers, matched case-insensitively. Empty = fallback candidate.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Tie-break weight; higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ask the materializer to mirror the code tree into the workspace.
    #[serde(default)]
    pub needs_code: bool,
    /// Regex recipes; declared last so the rendered TOML keeps plain values
    /// ahead of the [[pre_extract]] tables.
    #[serde(default)]
    pub pre_extract: Vec<PreExtractSpec>,
    /// Markdown prompt body.
    #[serde(skip)]
    pub body: String,
    /// Source file, relative to the rules directory.
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Partial update applied through the CRUD API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub keywords: Option<Vec<String>>,
    pub priority: Option<i32>,
    pub depends_on: Option<Vec<String>>,
    pub pre_extract: Option<Vec<PreExtractSpec>>,
    pub needs_code: Option<bool>,
    pub body: Option<String>,
}

/// An immutable, validated set of rules. Selections run against one snapshot.
#[derive(Debug, Default)]
pub struct Catalog {
    rules: HashMap<String, Arc<Rule>>,
    /// Rule with empty keywords and lowest priority, when one exists.
    fallback_id: Option<String>,
}

impl Catalog {
    pub fn get(&self, id: &str) -> Option<&Arc<Rule>> {
        self.rules.get(id)
    }

    pub fn fallback(&self) -> Option<&Arc<Rule>> {
        self.fallback_id.as_deref().and_then(|id| self.rules.get(id))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules, sorted by id for stable listings.
    pub fn list(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<_> = self.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    /// Build a catalog from already-parsed rules, enforcing the load-time
    /// invariants: unique ids, compilable patterns, acyclic dependencies.
    pub fn build(rules: Vec<Rule>) -> RuleResult<Self> {
        let mut map: HashMap<String, Arc<Rule>> = HashMap::new();
        for rule in rules {
            if map.contains_key(&rule.id) {
                return Err(RuleError::DuplicateId(rule.id));
            }
            for spec in &rule.pre_extract {
                if let Err(e) = regex::Regex::new(&spec.pattern) {
                    return Err(RuleError::InvalidPattern {
                        rule_id: rule.id.clone(),
                        pattern: spec.pattern.clone(),
                        message: e.to_string(),
                    });
                }
            }
            map.insert(rule.id.clone(), Arc::new(rule));
        }

        // Missing dependency ids are tolerated (dropped at selection with a
        // warning), but cycles are a load-time error.
        detect_cycles(&map)?;

        let fallback_id = map
            .values()
            .filter(|r| r.enabled && r.keywords.is_empty())
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)))
            .map(|r| r.id.clone());
        if fallback_id.is_none() {
            warn!("Catalog has no fallback rule (empty keywords); unmatched descriptions will fail selection");
        }

        Ok(Self {
            rules: map,
            fallback_id,
        })
    }
}

/// Depth-first cycle detection over `depends_on` edges.
fn detect_cycles(rules: &HashMap<String, Arc<Rule>>) -> RuleResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: &str,
        rules: &HashMap<String, Arc<Rule>>,
        marks: &mut HashMap<String, Mark>,
    ) -> RuleResult<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(RuleError::DependencyCycle(id.to_string())),
            None => {}
        }
        marks.insert(id.to_string(), Mark::Visiting);
        if let Some(rule) = rules.get(id) {
            for dep in &rule.depends_on {
                if rules.contains_key(dep) {
                    visit(dep, rules, marks)?;
                }
            }
        }
        marks.insert(id.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut ids: Vec<_> = rules.keys().cloned().collect();
    ids.sort();
    for id in ids {
        visit(&id, rules, &mut marks)?;
    }
    Ok(())
}

/// Split a rule file into its TOML header and markdown body.
///
/// The header sits between two `---` lines at the start of the file.
pub fn split_header(content: &str) -> Result<(&str, &str), String> {
    let content = content.trim_start_matches('\u{feff}');
    let rest = content
        .strip_prefix("---")
        .ok_or_else(|| "missing opening `---` header delimiter".to_string())?;

    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => return Err("header is empty (no closing `---`)".to_string()),
    };

    let mut pos = 0;
    for line in rest.lines() {
        if line.trim() == "---" {
            let header = &rest[..pos];
            let after = &rest[pos + line.len()..];
            let body = match after.find('\n') {
                Some(p) => &after[p + 1..],
                None => "",
            };
            return Ok((header, body));
        }
        pos += line.len() + 1;
    }
    Err("missing closing `---` header delimiter".to_string())
}

/// Parse one rule file.
pub fn parse_rule_file(path: &Path, rel: &Path) -> RuleResult<Rule> {
    let content = std::fs::read_to_string(path)?;
    let (header, body) = split_header(&content).map_err(|message| RuleError::ParseError {
        path: rel.display().to_string(),
        message,
    })?;

    let mut rule: Rule = toml::from_str(header).map_err(|e| RuleError::ParseError {
        path: rel.display().to_string(),
        message: e.to_string(),
    })?;
    rule.body = body.trim().to_string();
    rule.path = rel.to_path_buf();
    Ok(rule)
}

/// Render a rule back into its on-disk form.
fn render_rule_file(rule: &Rule) -> RuleResult<String> {
    let header = toml::to_string_pretty(rule).map_err(|e| RuleError::ParseError {
        path: rule.path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(format!("---\n{}---\n\n{}\n", header, rule.body))
}

/// Shared handle over the current catalog snapshot plus CRUD that writes
/// through to the rules directory.
pub struct RuleCatalog {
    dir: PathBuf,
    current: RwLock<Arc<Catalog>>,
}

impl RuleCatalog {
    /// Load all rule files under `dir`. Unparseable files fail the load so a
    /// broken edit cannot silently drop a playbook.
    pub fn load(dir: impl Into<PathBuf>) -> RuleResult<Self> {
        let dir = dir.into();
        let catalog = Self::build_from_dir(&dir)?;
        info!(rules = catalog.len(), dir = %dir.display(), "Rule catalog loaded");
        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(catalog)),
        })
    }

    fn build_from_dir(dir: &Path) -> RuleResult<Catalog> {
        let mut rules = Vec::new();
        if dir.exists() {
            for entry in walkdir::WalkDir::new(dir)
                .follow_links(false)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| RuleError::ParseError {
                    path: dir.display().to_string(),
                    message: e.to_string(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let rel = path.strip_prefix(dir).unwrap_or(path);
                debug!(file = %rel.display(), "Parsing rule file");
                rules.push(parse_rule_file(path, rel)?);
            }
        } else {
            warn!("Rules directory {} does not exist; catalog is empty", dir.display());
        }
        Catalog::build(rules)
    }

    /// Current snapshot. Hold it for the duration of one selection.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.read().clone()
    }

    /// Rebuild from disk and atomically swap. Readers see either the old
    /// catalog or the new one, never a mix.
    pub fn reload(&self) -> RuleResult<usize> {
        let catalog = Self::build_from_dir(&self.dir)?;
        let count = catalog.len();
        *self.current.write() = Arc::new(catalog);
        info!(rules = count, "Rule catalog reloaded");
        Ok(count)
    }

    pub fn list(&self) -> Vec<Arc<Rule>> {
        self.snapshot().list()
    }

    pub fn get(&self, id: &str) -> RuleResult<Arc<Rule>> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| RuleError::NotFound(id.to_string()))
    }

    /// Write a new rule file and reload. Fails if the id already exists.
    pub fn create(&self, mut rule: Rule) -> RuleResult<Arc<Rule>> {
        if self.snapshot().get(&rule.id).is_some() {
            return Err(RuleError::DuplicateId(rule.id));
        }
        if rule.path.as_os_str().is_empty() {
            rule.path = PathBuf::from(format!("{}.md", rule.id));
        }
        self.write_rule(&rule)?;
        self.reload()?;
        self.get(&rule.id)
    }

    /// Apply a partial update; metadata and body may change independently.
    pub fn update(&self, id: &str, patch: RulePatch) -> RuleResult<Arc<Rule>> {
        let existing = self.get(id)?;
        let mut rule = (*existing).clone();
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        if let Some(keywords) = patch.keywords {
            rule.keywords = keywords;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        if let Some(depends_on) = patch.depends_on {
            rule.depends_on = depends_on;
        }
        if let Some(pre_extract) = patch.pre_extract {
            rule.pre_extract = pre_extract;
        }
        if let Some(needs_code) = patch.needs_code {
            rule.needs_code = needs_code;
        }
        if let Some(body) = patch.body {
            rule.body = body;
        }
        rule.version = rule.version.saturating_add(1);
        self.write_rule(&rule)?;
        self.reload()?;
        self.get(id)
    }

    /// Remove the rule's file and reload.
    pub fn delete(&self, id: &str) -> RuleResult<()> {
        let rule = self.get(id)?;
        let path = self.resolve_in_dir(&rule.path)?;
        std::fs::remove_file(path)?;
        self.reload()?;
        Ok(())
    }

    fn write_rule(&self, rule: &Rule) -> RuleResult<()> {
        let path = self.resolve_in_dir(&rule.path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, render_rule_file(rule)?)?;
        Ok(())
    }

    /// Confine CRUD writes to the rules directory.
    fn resolve_in_dir(&self, rel: &Path) -> RuleResult<PathBuf> {
        let mut clean = PathBuf::new();
        for comp in rel.components() {
            match comp {
                std::path::Component::Normal(c) => clean.push(c),
                std::path::Component::CurDir => {}
                _ => {
                    return Err(RuleError::ParseError {
                        path: rel.display().to_string(),
                        message: "rule path escapes the rules directory".to_string(),
                    })
                }
            }
        }
        Ok(self.dir.join(clean))
    }

    /// Ids referenced by any `depends_on` but absent from the catalog.
    pub fn dangling_dependencies(&self) -> Vec<(String, String)> {
        let snapshot = self.snapshot();
        let ids: HashSet<_> = snapshot.iter().map(|r| r.id.clone()).collect();
        let mut dangling = Vec::new();
        for rule in snapshot.iter() {
            for dep in &rule.depends_on {
                if !ids.contains(dep) {
                    dangling.push((rule.id.clone(), dep.clone()));
                }
            }
        }
        dangling.sort();
        dangling
    }
}
