//! Deterministic in-process provider.
//!
//! Serves queued completions in FIFO order, with an optional fallback once
//! the queue is empty. This is the provider behind the test suite and the
//! CLI `--dry-run` mode; it reports token counts and costs like a real
//! provider so budget enforcement and the credit ledger behave normally.

use super::{estimate_tokens, Completion, CompletionRequest, Provider, ProviderError, ToolCallRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

const SCRIPTED_MODEL: &str = "scripted/dry-run";

enum Step {
    Reply(Completion),
    Fail(ProviderError),
}

pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<String>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
        }
    }

    /// Provider that answers every request with `text` once the queue runs
    /// dry, instead of failing. Used by `--dry-run`.
    pub fn with_fallback(text: impl Into<String>) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Some(text.into()),
        }
    }

    /// Queue a plain text reply.
    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(self.make_completion(text.into(), Vec::new(), 0.0))
    }

    /// Queue a text reply with an explicit cost, for cost-aware selection
    /// scenarios.
    pub fn push_text_with_cost(&self, text: impl Into<String>, cost: f64) -> &Self {
        self.push(self.make_completion(text.into(), Vec::new(), cost))
    }

    /// Queue an assistant turn that requests one tool call.
    pub fn push_tool_call(&self, name: &str, arguments: Value) -> &Self {
        let call = ToolCallRequest {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            arguments,
        };
        self.push(self.make_completion(String::new(), vec![call], 0.0))
    }

    /// Queue a fully specified completion.
    pub fn push(&self, completion: Completion) -> &Self {
        self.steps.lock().push_back(Step::Reply(completion));
        self
    }

    /// Queue a provider failure.
    pub fn push_error(&self, error: ProviderError) -> &Self {
        self.steps.lock().push_back(Step::Fail(error));
        self
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }

    fn make_completion(&self, content: String, tool_calls: Vec<ToolCallRequest>, cost: f64) -> Completion {
        Completion {
            tokens_out: estimate_tokens(&content),
            content,
            tool_calls,
            tokens_in: 0, // reconciled per-request in complete()
            cost,
            model_reported: SCRIPTED_MODEL.to_string(),
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::permanent("cancelled"));
        }

        let tokens_in: u64 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();

        let step = self.steps.lock().pop_front();
        let mut completion = match step {
            Some(Step::Reply(completion)) => completion,
            Some(Step::Fail(error)) => return Err(error),
            None => match &self.fallback {
                Some(text) => Completion {
                    content: text.clone(),
                    tool_calls: Vec::new(),
                    tokens_in: 0,
                    tokens_out: estimate_tokens(text),
                    cost: 0.0,
                    model_reported: SCRIPTED_MODEL.to_string(),
                },
                None => {
                    return Err(ProviderError::permanent(
                        "scripted provider exhausted: no step queued for this request",
                    ))
                }
            },
        };

        completion.tokens_in = tokens_in;
        if completion.model_reported == SCRIPTED_MODEL && !request.model.is_empty() {
            completion.model_reported = request.model.to_string();
        }
        Ok(completion)
    }
}
