//! Lineage graph export.
//!
//! Given the full event history of a session tree (the session plus every
//! descendant session), builds a stable JSON document of nodes (the events
//! themselves), edges, and a summary block for external visualization.

use super::{NodeType, TraceEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Edge classification in the exported graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Structural containment: `parent_id` → `trace_id`.
    Parent,
    /// A spawn record to the root event of the spawned session.
    Spawn,
    /// A candidates scope to one candidate attempt record.
    Candidate,
    /// A phase scope to one ward verdict record.
    Ward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSummary {
    pub root_session_id: String,
    pub session_count: usize,
    pub event_count: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// The exported lineage graph. Node fields are exactly the trace event
/// schema; consumers must tolerate present-but-null fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageGraph {
    pub nodes: Vec<TraceEvent>,
    pub edges: Vec<GraphEdge>,
    pub summary: GraphSummary,
}

impl LineageGraph {
    /// Build a graph from the concatenated histories of a session tree.
    /// `root_session_id` names the session the export was requested for.
    pub fn build(root_session_id: &str, events: Vec<TraceEvent>) -> Self {
        let mut edges = Vec::new();

        // Root event of each session, for spawn edges.
        let mut session_roots: HashMap<&str, &TraceEvent> = HashMap::new();
        for event in &events {
            if event.node_type == NodeType::Cascade {
                session_roots.entry(event.session_id.as_str()).or_insert(event);
            }
        }

        let mut sessions_seen: Vec<&str> = Vec::new();
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let mut cost = 0.0f64;

        for event in &events {
            if !sessions_seen.contains(&event.session_id.as_str()) {
                sessions_seen.push(event.session_id.as_str());
            }
            tokens_in += event.tokens_in.unwrap_or(0);
            tokens_out += event.tokens_out.unwrap_or(0);
            cost += event.cost.unwrap_or(0.0);

            if let Some(parent_id) = &event.parent_id {
                edges.push(GraphEdge {
                    from: parent_id.clone(),
                    to: event.trace_id.clone(),
                    kind: EdgeKind::Parent,
                });
            }

            // Logical edges on top of the structural tree.
            match event.node_type {
                NodeType::SubCascadeStart | NodeType::CandidateAttempt => {
                    if let Some(child_session) =
                        event.metadata.get("child_session_id").and_then(|v| v.as_str())
                        && let Some(child_root) = session_roots.get(child_session)
                    {
                        edges.push(GraphEdge {
                            from: event.trace_id.clone(),
                            to: child_root.trace_id.clone(),
                            kind: EdgeKind::Spawn,
                        });
                    }
                    if event.node_type == NodeType::CandidateAttempt
                        && let Some(parent_id) = &event.parent_id
                    {
                        edges.push(GraphEdge {
                            from: parent_id.clone(),
                            to: event.trace_id.clone(),
                            kind: EdgeKind::Candidate,
                        });
                    }
                }
                NodeType::WardCheck | NodeType::WardReject | NodeType::WardRetry => {
                    if let Some(parent_id) = &event.parent_id {
                        edges.push(GraphEdge {
                            from: parent_id.clone(),
                            to: event.trace_id.clone(),
                            kind: EdgeKind::Ward,
                        });
                    }
                }
                _ => {}
            }
        }

        let summary = GraphSummary {
            root_session_id: root_session_id.to_string(),
            session_count: sessions_seen.len(),
            event_count: events.len(),
            tokens_in,
            tokens_out,
            cost,
        };

        Self {
            nodes: events,
            edges,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(
        session_id: &str,
        trace_id: &str,
        parent_id: Option<&str>,
        node_type: NodeType,
        metadata: serde_json::Value,
    ) -> TraceEvent {
        TraceEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            parent_session_id: None,
            trace_id: trace_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            cascade_id: "c".to_string(),
            node_type,
            role: node_type.to_string(),
            phase_name: None,
            candidate_index: None,
            is_winner: None,
            content: String::new(),
            metadata,
            tokens_in: Some(10),
            tokens_out: Some(5),
            cost: Some(0.001),
            model: None,
            duration_ms: None,
        }
    }

    #[test]
    fn build_produces_parent_and_spawn_edges() {
        let events = vec![
            event("p", "t1", None, NodeType::Cascade, serde_json::Value::Null),
            event(
                "p",
                "t2",
                Some("t1"),
                NodeType::SubCascadeStart,
                json!({"child_session_id": "child"}),
            ),
            event("child", "t3", None, NodeType::Cascade, serde_json::Value::Null),
        ];
        let graph = LineageGraph::build("p", events);

        assert_eq!(graph.summary.session_count, 2);
        assert_eq!(graph.summary.event_count, 3);
        assert_eq!(graph.summary.tokens_in, 30);

        assert!(graph
            .edges
            .iter()
            .any(|e| e.kind == EdgeKind::Parent && e.from == "t1" && e.to == "t2"));
        assert!(graph
            .edges
            .iter()
            .any(|e| e.kind == EdgeKind::Spawn && e.from == "t2" && e.to == "t3"));
    }

    #[test]
    fn build_marks_candidate_and_ward_edges() {
        let events = vec![
            event("p", "t1", None, NodeType::Cascade, serde_json::Value::Null),
            event("p", "t2", Some("t1"), NodeType::CandidatesStart, serde_json::Value::Null),
            event("p", "t3", Some("t2"), NodeType::CandidateAttempt, serde_json::Value::Null),
            event("p", "t4", Some("t1"), NodeType::WardCheck, serde_json::Value::Null),
        ];
        let graph = LineageGraph::build("p", events);

        assert!(graph
            .edges
            .iter()
            .any(|e| e.kind == EdgeKind::Candidate && e.from == "t2" && e.to == "t3"));
        assert!(graph
            .edges
            .iter()
            .any(|e| e.kind == EdgeKind::Ward && e.from == "t1" && e.to == "t4"));
    }

    #[test]
    fn graph_serializes_stable_shape() {
        let graph = LineageGraph::build(
            "p",
            vec![event("p", "t1", None, NodeType::Cascade, serde_json::Value::Null)],
        );
        let value = serde_json::to_value(&graph).unwrap();
        assert!(value.get("nodes").unwrap().is_array());
        assert!(value.get("edges").unwrap().is_array());
        assert_eq!(value["summary"]["root_session_id"], "p");
    }
}
