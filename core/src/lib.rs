//! Core library for the triage service: an AI-assisted ticket analysis
//! orchestrator for device log bundles.
//!
//! The daemon composes these pieces at its root: a [`store::SqliteStore`]
//! for durable issues/tasks/results, a [`rules::RuleCatalog`] of diagnostic
//! playbooks, the [`materializer::Materializer`] that turns log artifacts
//! into a workspace tree, the [`extractor::Extractor`] that distills logs
//! into prompt snippets, an [`agent::AgentRegistry`] over subprocess LLM
//! CLIs, and the [`queue::TaskQueue`] driving the [`pipeline::Pipeline`]
//! while the [`progress::ProgressBus`] publishes live state.

pub mod agent;
pub mod config;
pub mod errors;
pub mod extractor;
pub mod materializer;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod result_parser;
pub mod rules;
pub mod store;
pub mod types;
pub mod workspace;

/// Version of the triage core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
