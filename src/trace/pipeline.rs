//! In-process trace pipeline: multi-producer channel, single forwarding
//! task, pluggable append-only sinks.
//!
//! Sessions append events to their own history and publish a copy here; the
//! forwarding task fans each event out to every registered sink. Sinks must
//! never block for long: the JSONL sink writes line-buffered appends, the
//! memory sink pushes under a short lock.

use super::TraceEvent;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Append-only consumer of trace events.
pub trait EventSink: Send + Sync {
    fn append(&self, event: &TraceEvent);
}

enum PipelineMessage {
    Event(TraceEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle to the trace pipeline. Cheap to clone; every session holds one.
#[derive(Clone)]
pub struct TracePipeline {
    tx: mpsc::UnboundedSender<PipelineMessage>,
}

impl TracePipeline {
    /// Start the pipeline with the given sinks. Spawns the forwarding task
    /// on the current tokio runtime.
    pub fn start(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PipelineMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    PipelineMessage::Event(event) => {
                        for sink in &sinks {
                            sink.append(&event);
                        }
                    }
                    PipelineMessage::Flush(ack) => {
                        // Everything sent before the flush has already been
                        // forwarded; acknowledge.
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Publish one event. Never blocks; events published after the pipeline
    /// task has shut down are dropped silently.
    pub fn publish(&self, event: TraceEvent) {
        let _ = self.tx.send(PipelineMessage::Event(event));
    }

    /// Wait until every event published before this call has reached all
    /// sinks. Used at session close.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PipelineMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// In-memory sink for tests and live observers.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn append(&self, event: &TraceEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Reference storage sink: one JSON line per event, one file per session,
/// under a logs directory. This file format is the append contract external
/// storage backends implement.
pub struct JsonlSink {
    logs_dir: PathBuf,
}

impl JsonlSink {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        // Session ids are engine-generated or caller-supplied; flatten any
        // path separators so a hostile id cannot escape the logs directory.
        let safe: String = session_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.logs_dir.join(format!("{safe}.jsonl"))
    }

    /// Read back every event logged for a session, in append order.
    pub fn read_session(logs_dir: &Path, session_id: &str) -> std::io::Result<Vec<TraceEvent>> {
        let sink = JsonlSink::new(logs_dir);
        let content = std::fs::read_to_string(sink.session_file(session_id))?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed trace line");
                }
            }
        }
        Ok(events)
    }

    /// Session ids present in the logs directory, one per `.jsonl` file.
    pub fn list_sessions(logs_dir: &Path) -> std::io::Result<Vec<String>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(logs_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "jsonl").unwrap_or(false)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                sessions.push(stem.to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

impl EventSink for JsonlSink {
    fn append(&self, event: &TraceEvent) {
        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(&self.logs_dir)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.session_file(&event.session_id))?;
            let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
            writeln!(file, "{line}")?;
            Ok(())
        })();
        if let Err(e) = result {
            // Logging must never take a session down.
            tracing::warn!(error = %e, session = %event.session_id, "trace sink write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{EventDraft, NodeType};
    use chrono::Utc;

    fn stamped(draft: EventDraft, session_id: &str) -> TraceEvent {
        TraceEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            parent_session_id: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_id: draft.parent_id,
            cascade_id: "test".to_string(),
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
        }
    }

    #[tokio::test]
    async fn pipeline_forwards_to_all_sinks_in_order() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let pipeline = TracePipeline::start(vec![a.clone(), b.clone()]);

        for i in 0..5 {
            let draft = EventDraft::new(NodeType::Agent, "assistant").content(format!("msg {i}"));
            pipeline.publish(stamped(draft, "s1"));
        }
        pipeline.flush().await;

        let got_a = a.snapshot();
        let got_b = b.snapshot();
        assert_eq!(got_a.len(), 5);
        assert_eq!(got_b.len(), 5);
        for (i, event) in got_a.iter().enumerate() {
            assert_eq!(event.content, format!("msg {i}"));
        }
    }

    #[tokio::test]
    async fn jsonl_sink_round_trips_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlSink::new(dir.path()));
        let pipeline = TracePipeline::start(vec![sink]);

        pipeline.publish(stamped(
            EventDraft::new(NodeType::PhaseStart, "phase_start").phase("draft"),
            "sess_a",
        ));
        pipeline.publish(stamped(
            EventDraft::new(NodeType::PhaseComplete, "phase_complete")
                .phase("draft")
                .content("done"),
            "sess_a",
        ));
        pipeline.flush().await;

        let events = JsonlSink::read_session(dir.path(), "sess_a").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].node_type, NodeType::PhaseStart);
        assert_eq!(events[1].content, "done");

        let sessions = JsonlSink::list_sessions(dir.path()).unwrap();
        assert_eq!(sessions, vec!["sess_a".to_string()]);
    }

    #[tokio::test]
    async fn jsonl_sink_separates_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlSink::new(dir.path()));
        let pipeline = TracePipeline::start(vec![sink]);

        pipeline.publish(stamped(EventDraft::new(NodeType::Cascade, "cascade_start"), "one"));
        pipeline.publish(stamped(EventDraft::new(NodeType::Cascade, "cascade_start"), "two"));
        pipeline.flush().await;

        assert_eq!(JsonlSink::read_session(dir.path(), "one").unwrap().len(), 1);
        assert_eq!(JsonlSink::read_session(dir.path(), "two").unwrap().len(), 1);
    }
}
