//! Session state and history: the Echo.
//!
//! One `Echo` exists per cascade run. It owns the mutable `state` map, the
//! append-only `history` of trace events, the per-phase `lineage` summary,
//! the error list, and the session's cost tally. The `SessionManager` owns
//! every live echo in a map keyed by session id; parent/child linkage is by
//! id, never by ownership.

use crate::trace::{EventDraft, NodeType, TraceEvent, TracePipeline};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Terminal and in-flight session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Ok,
    Failed,
    Aborted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Ok => write!(f, "ok"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Concise per-phase summary, one entry per accepted phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    pub phase_name: String,
    /// Trace id of the accepting `phase_complete` event.
    pub trace_id: String,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub phase_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Running token/cost totals for a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostTally {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub completions: u64,
}

struct EchoInner {
    state: Map<String, Value>,
    history: Vec<TraceEvent>,
    lineage: Vec<LineageEntry>,
    errors: Vec<ErrorRecord>,
    cost: CostTally,
    status: SessionStatus,
    last_timestamp: DateTime<Utc>,
}

/// Per-session state + history container.
pub struct Echo {
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub cascade_id: String,
    pub depth: u32,
    inner: Mutex<EchoInner>,
    pipeline: TracePipeline,
}

impl Echo {
    pub fn new(
        session_id: String,
        parent_session_id: Option<String>,
        cascade_id: String,
        depth: u32,
        inputs: Value,
        pipeline: TracePipeline,
    ) -> Self {
        let mut state = Map::new();
        state.insert("input".to_string(), inputs);
        Self {
            session_id,
            parent_session_id,
            cascade_id,
            depth,
            inner: Mutex::new(EchoInner {
                state,
                history: Vec::new(),
                lineage: Vec::new(),
                errors: Vec::new(),
                cost: CostTally::default(),
                status: SessionStatus::Running,
                last_timestamp: DateTime::<Utc>::MIN_UTC,
            }),
            pipeline,
        }
    }

    /// Stamp and append an event, forward it to the trace pipeline, and
    /// return its trace id. Timestamps are strictly monotonic within the
    /// session, so history order and timestamp order always agree.
    pub fn append(&self, draft: EventDraft) -> String {
        let mut inner = self.inner.lock();

        let mut now = Utc::now();
        if now <= inner.last_timestamp {
            now = inner.last_timestamp + Duration::microseconds(1);
        }
        inner.last_timestamp = now;

        let trace_id = uuid::Uuid::new_v4().to_string();
        let event = TraceEvent {
            timestamp: now,
            session_id: self.session_id.clone(),
            parent_session_id: self.parent_session_id.clone(),
            trace_id: trace_id.clone(),
            parent_id: draft.parent_id,
            cascade_id: self.cascade_id.clone(),
            node_type: draft.node_type,
            role: draft.role,
            phase_name: draft.phase_name,
            candidate_index: draft.candidate_index,
            is_winner: draft.is_winner,
            content: draft.content,
            metadata: draft.metadata,
            tokens_in: draft.tokens_in,
            tokens_out: draft.tokens_out,
            cost: draft.cost,
            model: draft.model,
            duration_ms: draft.duration_ms,
        };

        // Agent events are the single source of truth for the tally;
        // summary records (candidate attempts) carry copies of child costs.
        if event.node_type == NodeType::Agent {
            inner.cost.tokens_in += event.tokens_in.unwrap_or(0);
            inner.cost.tokens_out += event.tokens_out.unwrap_or(0);
            inner.cost.cost += event.cost.unwrap_or(0.0);
            inner.cost.completions += 1;
        }

        inner.history.push(event.clone());
        drop(inner);

        self.pipeline.publish(event);
        trace_id
    }

    /// Atomic replace of one state key.
    pub fn update_state(&self, key: &str, value: Value) {
        self.inner.lock().state.insert(key.to_string(), value);
    }

    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.inner.lock().state.get(key).cloned()
    }

    /// Snapshot of the full state map as a JSON object.
    pub fn state_snapshot(&self) -> Value {
        Value::Object(self.inner.lock().state.clone())
    }

    /// Adopt a child session's final state under `key`. The child's seeded
    /// `input` is its own and is not copied.
    pub fn merge_child(&self, child: &Echo, key: &str) {
        let mut child_state = match child.state_snapshot() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        child_state.remove("input");
        self.update_state(key, Value::Object(child_state));
    }

    pub fn push_lineage(&self, entry: LineageEntry) {
        self.inner.lock().lineage.push(entry);
    }

    pub fn export_lineage(&self) -> Vec<LineageEntry> {
        self.inner.lock().lineage.clone()
    }

    pub fn record_error(&self, kind: &str, message: impl Into<String>, phase_name: Option<&str>) {
        self.inner.lock().errors.push(ErrorRecord {
            kind: kind.to_string(),
            message: message.into(),
            phase_name: phase_name.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub fn errors_snapshot(&self) -> Vec<ErrorRecord> {
        self.inner.lock().errors.clone()
    }

    /// Credit exploration spend (child sessions) to this session's tally
    /// without fabricating an agent event for it.
    pub fn add_cost(&self, tokens_in: u64, tokens_out: u64, cost: f64) {
        let mut inner = self.inner.lock();
        inner.cost.tokens_in += tokens_in;
        inner.cost.tokens_out += tokens_out;
        inner.cost.cost += cost;
    }

    pub fn cost_snapshot(&self) -> CostTally {
        self.inner.lock().cost
    }

    pub fn history_snapshot(&self) -> Vec<TraceEvent> {
        self.inner.lock().history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    /// Mark the session terminal. History stays readable after close.
    pub fn close(&self, status: SessionStatus) {
        self.inner.lock().status = status;
    }
}

/// Owner of all live sessions in the process.
pub struct SessionManager {
    pipeline: TracePipeline,
    sessions: RwLock<HashMap<String, Arc<Echo>>>,
}

impl SessionManager {
    pub fn new(pipeline: TracePipeline) -> Self {
        Self {
            pipeline,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a session. Child sessions inherit depth and keep
    /// a back-pointer to the parent by id.
    pub fn create_session(
        &self,
        cascade_id: &str,
        inputs: Value,
        session_id: Option<String>,
        parent: Option<&Echo>,
    ) -> Arc<Echo> {
        let session_id = session_id
            .unwrap_or_else(|| format!("{cascade_id}_{}", uuid::Uuid::new_v4().simple()));
        let echo = Arc::new(Echo::new(
            session_id.clone(),
            parent.map(|p| p.session_id.clone()),
            cascade_id.to_string(),
            parent.map(|p| p.depth + 1).unwrap_or(0),
            inputs,
            self.pipeline.clone(),
        ));
        self.sessions.write().insert(session_id, echo.clone());
        echo
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Echo>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn children_of(&self, session_id: &str) -> Vec<Arc<Echo>> {
        let mut children: Vec<Arc<Echo>> = self
            .sessions
            .read()
            .values()
            .filter(|e| e.parent_session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        children
    }

    /// Concatenated histories of a session and all its descendants, parents
    /// before children, for lineage graph export.
    pub fn collect_tree_events(&self, session_id: &str) -> Vec<TraceEvent> {
        let mut events = Vec::new();
        let mut queue = vec![session_id.to_string()];
        while let Some(id) = queue.pop() {
            if let Some(echo) = self.get(&id) {
                events.extend(echo.history_snapshot());
            }
            for child in self.children_of(&id) {
                queue.push(child.session_id.clone());
            }
        }
        events
    }
}
