//! Typed cascade configuration tree.
//!
//! A cascade definition is a JSON or YAML document; both parse into this
//! one tree (the loader in `loader.rs` picks the parser and validates).
//! Legacy documents using the pre-migration vocabulary (`cells` for
//! phases, `soundings` for candidates, `tackle`/`traits` for skills) are
//! accepted through serde aliases; serialization always writes the current
//! names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod loader;

pub use loader::{lint, load_path, load_str, parse_str, validate, SourceFormat};

/// Top-level cascade definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub cascade_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(alias = "cells")]
    pub phases: Vec<PhaseConfig>,

    /// Input name → human description. Used for prompting and placeholder
    /// validation, never type-checked.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs_schema: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<TokenBudgetConfig>,

    // Settings owned by outer subsystems (retrieval, narration, alert
    // routing). Carried opaquely so documents round-trip; `lint` notes
    // that this engine ignores them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audible: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callouts: Option<Value>,

    /// Unknown top-level annotations. Never fatal, lint-warned.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CascadeConfig {
    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }
}

/// One step of a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(alias = "cell")]
    pub name: String,

    /// Instruction template, rendered against session state.
    #[serde(default)]
    pub instructions: String,

    #[serde(default, alias = "tackle", alias = "traits", skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub rules: RuleConfig,

    #[serde(default, alias = "soundings", skip_serializing_if = "Option::is_none")]
    pub candidates: Option<CandidatesConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wards: Option<WardsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_cascade: Option<SubCascadeRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_cascade: Option<AsyncCascadeRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input: Option<HumanInputConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffConfig>,

    /// Unknown phase-level annotations, lint-warned.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Per-phase execution rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    #[serde(default)]
    pub output_extraction: OutputExtractionConfig,

    /// Phase names (plus the reserved `input`) visible when rendering
    /// instructions. Default: everything produced so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_scope: Option<Vec<String>>,

    /// Condition template evaluated after each assistant turn; truthy ends
    /// the turn loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_until: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_failure: Option<RetryConfig>,

    /// Wall-clock limit for the whole phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_max_turns() -> u32 {
    8
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            output_extraction: OutputExtractionConfig::default(),
            context_scope: None,
            loop_until: None,
            retry_on_failure: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Phase to re-enter on retry; defaults to the failing phase itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_phase: Option<String>,
}

fn default_max_retries() -> u32 {
    1
}

/// How the phase output is extracted from the finished turn loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputExtractionConfig {
    #[serde(default)]
    pub mode: ExtractionMode,

    /// Pattern for `regex` mode; the first capture group wins, else the
    /// whole match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Tool name for `tool_result` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    #[default]
    LastAssistantText,
    JsonBlock,
    Regex,
    ToolResult,
}

/// Candidate exploration (soundings) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatesConfig {
    pub count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_model: Option<String>,

    /// Evaluation criterion shown to the evaluator alongside the outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reforge: Option<ReforgeConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_aware: Option<CostAwareConfig>,

    /// Exploration cost cap: once cumulative candidate spend crosses it,
    /// the current winner is accepted without further reforging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
}

fn default_max_parallel() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReforgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reforge_iterations")]
    pub max_iterations: u32,

    /// Accept early when the winner's evaluator score reaches this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_reforge_iterations() -> u32 {
    1
}

/// Cost-aware winner selection. Exactly one variant may be configured;
/// the loader rejects documents that set both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAwareConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalarize: Option<ScalarizeConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pareto: Option<ParetoConfig>,
}

/// Winner = argmax(quality − lambda · cost).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarizeConfig {
    #[serde(default = "default_lambda")]
    pub lambda: f64,
}

/// Restrict to the non-dominated (quality, cost) set, then scalarize
/// within the frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoConfig {
    #[serde(default = "default_lambda")]
    pub lambda: f64,
}

fn default_lambda() -> f64 {
    1.0
}

/// Post-output validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardsConfig {
    pub wards: Vec<WardConfig>,

    #[serde(default)]
    pub application: WardApplication,

    #[serde(default)]
    pub on_fail: WardOnFail,

    #[serde(default = "default_ward_retries")]
    pub max_retries: u32,
}

fn default_ward_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardApplication {
    #[default]
    AllOf,
    AnyOf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardOnFail {
    #[default]
    Retry,
    Fatal,
    Warn,
}

/// One validator. Inline (`prompt`) or a registered cascade (`cascade`);
/// exactly one must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Transformer wards replace the phase output with their returned
    /// value on accept.
    #[serde(default)]
    pub transformer: bool,
}

impl WardConfig {
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .or_else(|| self.cascade.clone())
            .unwrap_or_else(|| format!("ward_{index}"))
    }
}

/// Context token budget and reduction strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudgetConfig {
    pub limit: u64,

    #[serde(default)]
    pub strategy: BudgetStrategy,

    /// Headroom kept under the limit for the upcoming completion.
    #[serde(default = "default_reserve")]
    pub reserve: u64,

    /// Messages kept verbatim by the `compact` strategy.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer_model: Option<String>,
}

fn default_reserve() -> u64 {
    256
}

fn default_keep_last() -> usize {
    4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    #[default]
    FifoDrop,
    Summarize,
    Compact,
}

impl std::fmt::Display for BudgetStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetStrategy::FifoDrop => write!(f, "fifo_drop"),
            BudgetStrategy::Summarize => write!(f, "summarize"),
            BudgetStrategy::Compact => write!(f, "compact"),
        }
    }
}

/// Synchronous nested cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCascadeRef {
    /// Registered cascade id.
    pub cascade: String,

    /// Propagate a snapshot of the parent state into the child's input.
    #[serde(default)]
    pub context_in: bool,

    /// Explicit child inputs; values are templates rendered against the
    /// parent state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, String>>,

    /// When set, the child's final state is merged under this parent key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
}

/// Fire-and-forget background cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncCascadeRef {
    pub cascade: String,

    #[serde(default)]
    pub context_in: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, String>>,
}

/// Human-in-the-loop checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputConfig {
    pub prompt: String,

    #[serde(default)]
    pub input_type: HumanInputType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<HumanInputOption>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanInputType {
    #[default]
    Text,
    Choice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputOption {
    pub label: String,
    pub value: String,
}

/// Redirect after acceptance: jump to `target_phase` when `when` (if any)
/// renders truthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffConfig {
    pub target_phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_document_parses_with_defaults() {
        let config: CascadeConfig = serde_json::from_value(json!({
            "cascade_id": "greet",
            "phases": [{"name": "say_hi", "instructions": "Say hello to {{ input.name }}"}]
        }))
        .unwrap();

        assert_eq!(config.cascade_id, "greet");
        assert_eq!(config.phases.len(), 1);
        let phase = &config.phases[0];
        assert_eq!(phase.rules.max_turns, 8);
        assert_eq!(phase.rules.output_extraction.mode, ExtractionMode::LastAssistantText);
        assert!(phase.candidates.is_none());
        assert!(phase.extra.is_empty());
    }

    #[test]
    fn legacy_aliases_parse_to_current_names() {
        let config: CascadeConfig = serde_json::from_value(json!({
            "cascade_id": "legacy",
            "cells": [{
                "cell": "draft",
                "instructions": "Write",
                "tackle": ["web_search"],
                "soundings": {"count": 3}
            }]
        }))
        .unwrap();

        assert_eq!(config.phases[0].name, "draft");
        assert_eq!(config.phases[0].skills, vec!["web_search".to_string()]);
        assert_eq!(config.phases[0].candidates.as_ref().unwrap().count, 3);
    }

    #[test]
    fn unknown_keys_are_captured_not_fatal() {
        let config: CascadeConfig = serde_json::from_value(json!({
            "cascade_id": "x",
            "phases": [{"name": "a", "instructions": "go", "experimental_flag": true}],
            "dashboard_hint": {"color": "blue"}
        }))
        .unwrap();

        assert!(config.extra.contains_key("dashboard_hint"));
        assert!(config.phases[0].extra.contains_key("experimental_flag"));
    }

    #[test]
    fn candidates_defaults() {
        let candidates: CandidatesConfig = serde_json::from_value(json!({"count": 3})).unwrap();
        assert_eq!(candidates.max_parallel, 4);
        assert!(candidates.reforge.is_none());
        assert!(candidates.cost_aware.is_none());
    }

    #[test]
    fn wards_enum_wire_names() {
        let wards: WardsConfig = serde_json::from_value(json!({
            "wards": [{"prompt": "Check length"}],
            "application": "any_of",
            "on_fail": "warn"
        }))
        .unwrap();
        assert_eq!(wards.application, WardApplication::AnyOf);
        assert_eq!(wards.on_fail, WardOnFail::Warn);
        assert_eq!(wards.max_retries, 2);
    }

    #[test]
    fn budget_strategy_wire_names() {
        let budget: TokenBudgetConfig =
            serde_json::from_value(json!({"limit": 1000, "strategy": "fifo_drop"})).unwrap();
        assert_eq!(budget.strategy, BudgetStrategy::FifoDrop);
        assert_eq!(budget.reserve, 256);
        assert_eq!(budget.strategy.to_string(), "fifo_drop");
    }

    #[test]
    fn ward_label_prefers_name_then_cascade() {
        let named: WardConfig =
            serde_json::from_value(json!({"name": "length", "prompt": "p"})).unwrap();
        let by_cascade: WardConfig = serde_json::from_value(json!({"cascade": "validator"})).unwrap();
        let anonymous: WardConfig = serde_json::from_value(json!({"prompt": "p"})).unwrap();
        assert_eq!(named.label(0), "length");
        assert_eq!(by_cascade.label(1), "validator");
        assert_eq!(anonymous.label(2), "ward_2");
    }
}
