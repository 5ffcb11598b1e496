//! Human-in-the-loop checkpoints.
//!
//! A phase with a `human_input` block suspends until an external responder
//! answers through the broker. The broker is the process-wide rendezvous:
//! `pending_checkpoints` lists open questions, `resolve` delivers an answer
//! and wakes the waiting phase.

use crate::cascade::{HumanInputOption, HumanInputType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: String,
    pub session_id: String,
    pub phase_name: String,
    pub prompt: String,
    pub input_type: HumanInputType,
    pub options: Vec<HumanInputOption>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint {id} not found (already resolved or expired)")]
    NotFound { id: String },

    #[error("Checkpoint {id} is no longer waiting")]
    Abandoned { id: String },
}

struct PendingCheckpoint {
    info: CheckpointInfo,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
pub struct CheckpointBroker {
    pending: Mutex<HashMap<String, PendingCheckpoint>>,
}

impl CheckpointBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkpoint and return the receiver the phase blocks on.
    pub fn create(
        &self,
        session_id: &str,
        phase_name: &str,
        prompt: String,
        input_type: HumanInputType,
        options: Vec<HumanInputOption>,
    ) -> (CheckpointInfo, oneshot::Receiver<String>) {
        let info = CheckpointInfo {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            phase_name: phase_name.to_string(),
            prompt,
            input_type,
            options,
            created_at: Utc::now(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            info.checkpoint_id.clone(),
            PendingCheckpoint {
                info: info.clone(),
                tx,
            },
        );
        (info, rx)
    }

    /// Open checkpoints for one session, oldest first.
    pub fn pending_checkpoints(&self, session_id: &str) -> Vec<CheckpointInfo> {
        let mut infos: Vec<CheckpointInfo> = self
            .pending
            .lock()
            .values()
            .filter(|p| p.info.session_id == session_id)
            .map(|p| p.info.clone())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Deliver an answer and wake the blocked phase.
    pub fn resolve(&self, checkpoint_id: &str, answer: String) -> Result<(), CheckpointError> {
        let pending =
            self.pending
                .lock()
                .remove(checkpoint_id)
                .ok_or_else(|| CheckpointError::NotFound {
                    id: checkpoint_id.to_string(),
                })?;
        pending.tx.send(answer).map_err(|_| CheckpointError::Abandoned {
            id: checkpoint_id.to_string(),
        })
    }

    /// Drop a checkpoint whose phase stopped waiting (timeout, cancel).
    pub fn discard(&self, checkpoint_id: &str) {
        self.pending.lock().remove(checkpoint_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_the_waiter() {
        let broker = CheckpointBroker::new();
        let (info, rx) = broker.create(
            "s1",
            "ask",
            "Years of experience?".to_string(),
            HumanInputType::Text,
            Vec::new(),
        );

        assert_eq!(broker.pending_checkpoints("s1").len(), 1);
        broker.resolve(&info.checkpoint_id, "five".to_string()).unwrap();

        assert_eq!(rx.await.unwrap(), "five");
        assert!(broker.pending_checkpoints("s1").is_empty());
    }

    #[tokio::test]
    async fn resolve_unknown_id_errors() {
        let broker = CheckpointBroker::new();
        let err = broker.resolve("nope", "answer".to_string()).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn resolve_after_waiter_dropped_reports_abandoned() {
        let broker = CheckpointBroker::new();
        let (info, rx) = broker.create(
            "s1",
            "ask",
            "q".to_string(),
            HumanInputType::Text,
            Vec::new(),
        );
        drop(rx);
        let err = broker.resolve(&info.checkpoint_id, "a".to_string()).unwrap_err();
        assert!(matches!(err, CheckpointError::Abandoned { .. }));
    }

    #[tokio::test]
    async fn pending_is_scoped_per_session() {
        let broker = CheckpointBroker::new();
        let _a = broker.create("s1", "p", "q1".to_string(), HumanInputType::Text, Vec::new());
        let _b = broker.create("s2", "p", "q2".to_string(), HumanInputType::Text, Vec::new());
        assert_eq!(broker.pending_checkpoints("s1").len(), 1);
        assert_eq!(broker.pending_checkpoints("s2").len(), 1);
    }
}
