//! Unified trace event schema.
//!
//! Every observable action in a session (phase boundaries, agent calls,
//! tool invocations, budget enforcement, candidate exploration, ward
//! verdicts, sub-cascade spawns, errors) produces one `TraceEvent`. The
//! schema is a tagged `node_type` plus a struct of optional payload fields;
//! producers fill what they know and sinks tolerate nulls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod graph;
pub mod pipeline;

pub use graph::{EdgeKind, GraphEdge, GraphSummary, LineageGraph};
pub use pipeline::{EventSink, JsonlSink, MemorySink, TracePipeline};

/// Closed set of event node types.
///
/// `Phase` is the enclosing scope for one phase attempt; `PhaseStart` and
/// `PhaseComplete` are its boundary children. Sinks treat unknown
/// combinations as opaque; the set itself is the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Cascade,
    Phase,
    PhaseStart,
    PhaseComplete,
    Agent,
    ToolCall,
    ToolResult,
    TokenBudgetEnforcement,
    CandidatesStart,
    CandidateAttempt,
    CandidatesEvaluation,
    WardCheck,
    WardReject,
    WardRetry,
    SubCascadeStart,
    SubCascadeComplete,
    HumanInput,
    Error,
    SessionEnd,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde snake_case names so logs and wire agree.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One record in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub cascade_id: String,
    pub node_type: NodeType,
    pub role: String,
    pub phase_name: Option<String>,
    pub candidate_index: Option<usize>,
    pub is_winner: Option<bool>,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cost: Option<f64>,
    pub model: Option<String>,
    pub duration_ms: Option<f64>,
}

/// A not-yet-stamped event. Producers describe the action; the owning
/// session fills in identity (session ids, cascade id, trace id) and the
/// monotonic timestamp at append time.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub node_type: NodeType,
    pub role: String,
    pub parent_id: Option<String>,
    pub phase_name: Option<String>,
    pub candidate_index: Option<usize>,
    pub is_winner: Option<bool>,
    pub content: String,
    pub metadata: Value,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cost: Option<f64>,
    pub model: Option<String>,
    pub duration_ms: Option<f64>,
}

impl EventDraft {
    pub fn new(node_type: NodeType, role: &str) -> Self {
        Self {
            node_type,
            role: role.to_string(),
            parent_id: None,
            phase_name: None,
            candidate_index: None,
            is_winner: None,
            content: String::new(),
            metadata: Value::Null,
            tokens_in: None,
            tokens_out: None,
            cost: None,
            model: None,
            duration_ms: None,
        }
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn parent_opt(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn phase(mut self, phase_name: impl Into<String>) -> Self {
        self.phase_name = Some(phase_name.into());
        self
    }

    pub fn candidate(mut self, index: usize) -> Self {
        self.candidate_index = Some(index);
        self
    }

    pub fn winner(mut self, is_winner: bool) -> Self {
        self.is_winner = Some(is_winner);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_serializes_snake_case() {
        let json = serde_json::to_string(&NodeType::TokenBudgetEnforcement).unwrap();
        assert_eq!(json, "\"token_budget_enforcement\"");
        assert_eq!(NodeType::SubCascadeStart.to_string(), "sub_cascade_start");
    }

    #[test]
    fn node_type_round_trips() {
        for nt in [
            NodeType::Cascade,
            NodeType::Phase,
            NodeType::PhaseStart,
            NodeType::PhaseComplete,
            NodeType::Agent,
            NodeType::ToolCall,
            NodeType::ToolResult,
            NodeType::TokenBudgetEnforcement,
            NodeType::CandidatesStart,
            NodeType::CandidateAttempt,
            NodeType::CandidatesEvaluation,
            NodeType::WardCheck,
            NodeType::WardReject,
            NodeType::WardRetry,
            NodeType::SubCascadeStart,
            NodeType::SubCascadeComplete,
            NodeType::HumanInput,
            NodeType::Error,
            NodeType::SessionEnd,
        ] {
            let json = serde_json::to_string(&nt).unwrap();
            let back: NodeType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, nt);
        }
    }

    #[test]
    fn draft_builder_fills_optional_fields() {
        let draft = EventDraft::new(NodeType::Agent, "assistant")
            .phase("draft")
            .tokens(100, 20)
            .cost(0.003)
            .model("test-model")
            .duration_ms(12.5);
        assert_eq!(draft.phase_name.as_deref(), Some("draft"));
        assert_eq!(draft.tokens_in, Some(100));
        assert_eq!(draft.tokens_out, Some(20));
        assert_eq!(draft.cost, Some(0.003));
        assert_eq!(draft.duration_ms, Some(12.5));
    }

    #[test]
    fn event_serializes_null_optionals() {
        let event = TraceEvent {
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            parent_session_id: None,
            trace_id: "t1".to_string(),
            parent_id: None,
            cascade_id: "c1".to_string(),
            node_type: NodeType::Cascade,
            role: "cascade_start".to_string(),
            phase_name: None,
            candidate_index: None,
            is_winner: None,
            content: String::new(),
            metadata: Value::Null,
            tokens_in: None,
            tokens_out: None,
            cost: None,
            model: None,
            duration_ms: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        // Consumers rely on fields being present-but-null, not absent.
        assert!(value.get("tokens_in").unwrap().is_null());
        assert!(value.get("parent_id").unwrap().is_null());
        assert_eq!(value.get("node_type").unwrap(), "cascade");
    }
}
