//! Diagnostic playbook catalog and selection engine.

pub mod catalog;
pub mod engine;

pub use catalog::{Catalog, PreExtractSpec, Rule, RuleCatalog, RulePatch};
pub use engine::{select_rules, Selection};
