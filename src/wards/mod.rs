//! Wards: post-phase validation with accept/reject semantics.
//!
//! A ward observes a phase output and answers with an envelope
//! `{accepted, feedback?, score?, output?}`. Inline wards are one-shot
//! validator calls against the provider; cascade wards execute a registered
//! cascade with the output and parent context propagated inward and parse
//! its final output as the same envelope. Transformer wards may replace the
//! output on accept. The retry-with-feedback escalation lives in the
//! session runner, which re-runs the phase with the feedback prepended.

use crate::cascade::{WardApplication, WardConfig, WardsConfig};
use crate::echo::Echo;
use crate::errors::PhaseError;
use crate::phase::{extract_json_block, value_to_text};
use crate::provider::{ChatMessage, CompletionRequest};
use crate::runner::Runtime;
use crate::template;
use crate::trace::{EventDraft, NodeType};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Parsed ward reply.
#[derive(Debug, Clone)]
pub struct WardVerdict {
    pub accepted: bool,
    pub feedback: Option<String>,
    pub score: Option<f64>,
    /// Replacement output, honored only for transformer wards.
    pub output: Option<Value>,
}

/// Aggregate result of applying a phase's ward set once.
#[derive(Debug, Clone)]
pub enum WardsResult {
    Accepted { output: Value, warnings: Vec<String> },
    Rejected { feedback: String },
}

/// Parse a ward reply into a verdict. A reply with no parseable envelope
/// counts as a rejection carrying the raw text, so a misbehaving validator
/// can never silently accept.
pub fn parse_envelope(value: &Value) -> WardVerdict {
    let envelope = match value {
        Value::Object(_) => Some(value.clone()),
        Value::String(text) => extract_json_block(text),
        _ => None,
    };

    if let Some(Value::Object(map)) = envelope
        && let Some(accepted) = map.get("accepted").and_then(Value::as_bool)
    {
        return WardVerdict {
            accepted,
            feedback: map
                .get("feedback")
                .and_then(Value::as_str)
                .map(str::to_string),
            score: map.get("score").and_then(Value::as_f64),
            output: map.get("output").cloned(),
        };
    }

    WardVerdict {
        accepted: false,
        feedback: Some(format!(
            "validator reply had no `accepted` envelope: {}",
            value_to_text(value)
        )),
        score: None,
        output: None,
    }
}

pub struct WardRunner<'a> {
    runtime: &'a Arc<Runtime>,
    echo: &'a Arc<Echo>,
    phase_name: &'a str,
    cancel: &'a CancellationToken,
}

impl<'a> WardRunner<'a> {
    pub fn new(
        runtime: &'a Arc<Runtime>,
        echo: &'a Arc<Echo>,
        phase_name: &'a str,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            runtime,
            echo,
            phase_name,
            cancel,
        }
    }

    /// Apply every ward to `output` and aggregate per the configured
    /// application mode. Emits one `ward_check` per ward and a
    /// `ward_reject` when the aggregate rejects.
    pub async fn evaluate(
        &self,
        config: &WardsConfig,
        output: &Value,
        scope_id: &str,
    ) -> Result<WardsResult, PhaseError> {
        let mut verdicts = Vec::with_capacity(config.wards.len());

        for (index, ward) in config.wards.iter().enumerate() {
            let label = ward.label(index);
            let verdict = self.check_one(ward, &label, output, scope_id).await?;

            self.echo.append(
                EventDraft::new(NodeType::WardCheck, "ward_check")
                    .phase(self.phase_name.to_string())
                    .parent(scope_id.to_string())
                    .content(verdict.feedback.clone().unwrap_or_default())
                    .metadata(json!({
                        "ward": label,
                        "accepted": verdict.accepted,
                        "score": verdict.score,
                        "transformer": ward.transformer,
                    })),
            );
            verdicts.push((ward, verdict));
        }

        let accepted = match config.application {
            WardApplication::AllOf => verdicts.iter().all(|(_, v)| v.accepted),
            WardApplication::AnyOf => verdicts.iter().any(|(_, v)| v.accepted),
        };

        if accepted {
            // The last accepting transformer's replacement wins.
            let mut final_output = output.clone();
            for (ward, verdict) in &verdicts {
                if ward.transformer
                    && verdict.accepted
                    && let Some(replacement) = &verdict.output
                {
                    final_output = replacement.clone();
                }
            }
            return Ok(WardsResult::Accepted {
                output: final_output,
                warnings: Vec::new(),
            });
        }

        let feedback = verdicts
            .iter()
            .filter(|(_, v)| !v.accepted)
            .filter_map(|(_, v)| v.feedback.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let feedback = if feedback.is_empty() {
            "output rejected without feedback".to_string()
        } else {
            feedback
        };

        self.echo.append(
            EventDraft::new(NodeType::WardReject, "ward_reject")
                .phase(self.phase_name.to_string())
                .parent(scope_id.to_string())
                .content(feedback.clone()),
        );

        Ok(WardsResult::Rejected { feedback })
    }

    async fn check_one(
        &self,
        ward: &WardConfig,
        label: &str,
        output: &Value,
        scope_id: &str,
    ) -> Result<WardVerdict, PhaseError> {
        if let Some(prompt) = &ward.prompt {
            self.check_inline(ward, label, prompt, output, scope_id).await
        } else if let Some(cascade_id) = &ward.cascade {
            self.check_cascade(cascade_id, output).await
        } else {
            // The loader rejects this shape; reaching it means the config
            // bypassed validation.
            Ok(WardVerdict {
                accepted: false,
                feedback: Some(format!("ward `{label}` has neither prompt nor cascade")),
                score: None,
                output: None,
            })
        }
    }

    async fn check_inline(
        &self,
        ward: &WardConfig,
        label: &str,
        prompt: &str,
        output: &Value,
        scope_id: &str,
    ) -> Result<WardVerdict, PhaseError> {
        let values = self.ward_values(output);
        let rendered = template::render(prompt, &values).map_err(|e| PhaseError::PromptRender {
            phase: self.phase_name.to_string(),
            detail: format!("ward `{label}`: {}", e.detail),
        })?;

        let messages = [
            ChatMessage::system(
                "You are a validator. Judge the output under review against the given \
                 criteria. Reply with a JSON object: {\"accepted\": true|false, \
                 \"feedback\": \"...\", \"score\": 0.0-1.0, \"output\": <optional replacement>}.",
            ),
            ChatMessage::user(format!(
                "{rendered}\n\nOutput under review:\n{}",
                value_to_text(output)
            )),
        ];

        let model = ward
            .model
            .clone()
            .unwrap_or_else(|| self.runtime.default_model().to_string());

        let started = Instant::now();
        let completion = self
            .runtime
            .provider()
            .complete(
                CompletionRequest {
                    messages: &messages,
                    model: &model,
                    tools: &[],
                },
                self.cancel,
            )
            .await
            .map_err(|e| PhaseError::Provider {
                message: e.message,
                transient: e.transient,
            })?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.echo.append(
            EventDraft::new(NodeType::Agent, "ward")
                .phase(self.phase_name.to_string())
                .parent(scope_id.to_string())
                .content(completion.content.clone())
                .tokens(completion.tokens_in, completion.tokens_out)
                .cost(completion.cost)
                .model(completion.model_reported.clone())
                .duration_ms(duration_ms)
                .metadata(json!({"ward": label})),
        );
        self.runtime
            .credits()
            .record(completion.tokens_in, completion.tokens_out, completion.cost);

        Ok(parse_envelope(&Value::String(completion.content)))
    }

    /// Execute a registered cascade as the validator. Context always
    /// propagates inward; the child's final output is the envelope.
    async fn check_cascade(&self, cascade_id: &str, output: &Value) -> Result<WardVerdict, PhaseError> {
        let mut inputs = Map::new();
        inputs.insert("output".to_string(), output.clone());
        inputs.insert("context".to_string(), self.echo.state_snapshot());

        let outcome = self
            .runtime
            .run_child(
                cascade_id,
                Value::Object(inputs),
                None,
                Some(self.echo.as_ref()),
                None,
                self.cancel.child_token(),
            )
            .await
            .map_err(|e| PhaseError::Provider {
                message: format!("ward cascade `{cascade_id}`: {e}"),
                transient: false,
            })?;

        match outcome.output {
            Some(value) => Ok(parse_envelope(&value)),
            None => Ok(WardVerdict {
                accepted: false,
                feedback: Some(format!("ward cascade `{cascade_id}` produced no output")),
                score: None,
                output: None,
            }),
        }
    }

    fn ward_values(&self, output: &Value) -> Value {
        json!({
            "output": value_to_text(output),
            "state": self.echo.state_snapshot(),
            "phase": self.phase_name,
        })
    }
}
