//! Phase execution: one prompt-and-tool loop producing one output.
//!
//! A `PhaseRunner` drives exactly one attempt of one phase inside one
//! session: renders the instruction template against scoped state, runs the
//! provider/tool loop under turn and token budgets, extracts the output,
//! and emits the phase's trace subtree (a `phase` scope event enclosing
//! `phase_start`, `agent`, `tool_call`/`tool_result`,
//! `token_budget_enforcement`, and `phase_complete` children).

use crate::cascade::{BudgetStrategy, PhaseConfig, TokenBudgetConfig};
use crate::credits::CreditLedger;
use crate::echo::Echo;
use crate::errors::PhaseError;
use crate::provider::{ChatMessage, Completion, CompletionRequest, Provider, ToolCallRequest};
use crate::skills::{invoke_with_policy, SkillRegistry};
use crate::template;
use crate::trace::{EventDraft, NodeType};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub mod extract;
pub mod window;

pub use extract::{extract_json_block, extract_output, ToolResults};
pub use window::{MessageWindow, PruneReport};

/// Provider-side transient failures are retried this many times per call.
const MAX_PROVIDER_ATTEMPTS: u32 = 3;
const PROVIDER_BACKOFF_MS: u64 = 200;

/// Shared execution dependencies, owned by the runtime and borrowed per
/// phase attempt.
pub struct PhaseContext<'a> {
    pub provider: &'a dyn Provider,
    pub skills: &'a SkillRegistry,
    pub credits: &'a CreditLedger,
    pub token_budget: Option<&'a TokenBudgetConfig>,
    pub default_model: &'a str,
}

/// Result of one successful phase attempt.
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub value: Value,
    /// Trace id of the enclosing `phase` scope event.
    pub scope_trace_id: String,
    /// Trace id of the `phase_complete` event.
    pub complete_trace_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// One attempt of one phase.
pub struct PhaseRunner<'a> {
    ctx: &'a PhaseContext<'a>,
    echo: &'a Echo,
    phase: &'a PhaseConfig,
    parent_trace: Option<String>,
    /// Extra user messages appended after the system prompt: ward feedback
    /// on retries, reforge guidance during candidate exploration.
    extra_messages: Vec<ChatMessage>,
    cancel: CancellationToken,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(
        ctx: &'a PhaseContext<'a>,
        echo: &'a Echo,
        phase: &'a PhaseConfig,
        parent_trace: Option<String>,
        extra_messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            echo,
            phase,
            parent_trace,
            extra_messages,
            cancel,
        }
    }

    /// Run the attempt, honoring the phase's wall-clock timeout.
    pub async fn run(&self) -> Result<PhaseOutput, PhaseError> {
        match self.phase.rules.timeout_ms {
            Some(timeout_ms) => {
                let attempt_cancel = self.cancel.child_token();
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    self.run_inner(&attempt_cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        // Best-effort cancellation of the in-flight call.
                        attempt_cancel.cancel();
                        Err(PhaseError::Timeout {
                            phase: self.phase.name.clone(),
                            timeout_ms,
                        })
                    }
                }
            }
            None => self.run_inner(&self.cancel).await,
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<PhaseOutput, PhaseError> {
        if cancel.is_cancelled() {
            return Err(PhaseError::Cancelled);
        }
        let phase_name = &self.phase.name;
        let rules = &self.phase.rules;

        let scope_id = self.echo.append(
            EventDraft::new(NodeType::Phase, "phase")
                .phase(phase_name.clone())
                .parent_opt(self.parent_trace.clone()),
        );
        self.echo.append(
            EventDraft::new(NodeType::PhaseStart, "phase_start")
                .phase(phase_name.clone())
                .parent(scope_id.clone())
                .metadata(json!({"max_turns": rules.max_turns, "skills": self.phase.skills})),
        );

        let prompt = self.render_instructions()?;

        let mut window = MessageWindow::new();
        window.push(ChatMessage::system(prompt));
        for message in &self.extra_messages {
            window.push(message.clone());
        }

        let tools = self
            .ctx
            .skills
            .descriptors_for(&self.phase.skills)
            .map_err(|missing| PhaseError::ToolCall {
                tool: missing.join(", "),
                kind: crate::errors::ToolErrorKind::Permanent,
                message: "phase references unregistered skills".to_string(),
            })?;
        let model = self
            .phase
            .model
            .clone()
            .unwrap_or_else(|| self.ctx.default_model.to_string());

        let mut tool_results: ToolResults = Vec::new();
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let mut cost = 0.0f64;
        let mut terminal = false;
        let mut turns_used = 0u32;

        for turn in 1..=rules.max_turns {
            turns_used = turn;

            if let Some(budget) = self.ctx.token_budget {
                self.enforce_budget(&mut window, budget, &scope_id, &model, cancel)
                    .await?;
            }

            let estimated = window.estimated_tokens();
            let started = Instant::now();
            let completion = self
                .call_provider(window.messages(), &model, &tools, cancel)
                .await?;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            self.echo.append(
                EventDraft::new(NodeType::Agent, "assistant")
                    .phase(phase_name.clone())
                    .parent(scope_id.clone())
                    .content(completion.content.clone())
                    .tokens(completion.tokens_in, completion.tokens_out)
                    .cost(completion.cost)
                    .model(completion.model_reported.clone())
                    .duration_ms(duration_ms)
                    .metadata(json!({
                        "turn": turn,
                        "estimated_tokens": estimated,
                        "tool_calls": completion.tool_calls.len(),
                    })),
            );
            self.ctx
                .credits
                .record(completion.tokens_in, completion.tokens_out, completion.cost);
            tokens_in += completion.tokens_in;
            tokens_out += completion.tokens_out;
            cost += completion.cost;

            window.push(ChatMessage::assistant_with_tools(
                completion.content.clone(),
                completion.tool_calls.clone(),
            ));

            if let Some(condition) = &rules.loop_until {
                let values = self.condition_values(&completion.content, turn);
                let fired =
                    template::eval_condition(condition, &values).map_err(|e| PhaseError::PromptRender {
                        phase: phase_name.clone(),
                        detail: format!("loop_until: {}", e.detail),
                    })?;
                if fired {
                    terminal = true;
                    break;
                }
            }

            if completion.tool_calls.is_empty() {
                if rules.loop_until.is_some() {
                    // The condition has not fired yet: keep the loop going
                    // rather than accepting a premature terminal response.
                    window.push(ChatMessage::user(
                        "The completion condition is not yet met. Continue.",
                    ));
                    continue;
                }
                terminal = true;
                break;
            }

            self.run_tool_calls(
                &completion.tool_calls,
                &scope_id,
                cancel,
                &mut window,
                &mut tool_results,
            )
            .await?;
        }

        if !terminal {
            return Err(PhaseError::TurnLimitExceeded {
                phase: phase_name.clone(),
                max_turns: rules.max_turns,
            });
        }

        let value = extract_output(&rules.output_extraction, &window, &tool_results, phase_name)?;

        let complete_id = self.echo.append(
            EventDraft::new(NodeType::PhaseComplete, "phase_complete")
                .phase(phase_name.clone())
                .parent(scope_id.clone())
                .content(value_to_text(&value))
                .metadata(json!({"turns": turns_used})),
        );

        Ok(PhaseOutput {
            value,
            scope_trace_id: scope_id,
            complete_trace_id: complete_id,
            tokens_in,
            tokens_out,
            cost,
        })
    }

    /// Render the instruction template against state scoped per
    /// `context_scope` (default: all prior phase outputs plus `input`).
    fn render_instructions(&self) -> Result<String, PhaseError> {
        let values = self.scoped_values();
        template::render(&self.phase.instructions, &values).map_err(|e| PhaseError::PromptRender {
            phase: self.phase.name.clone(),
            detail: e.detail,
        })
    }

    fn scoped_values(&self) -> Value {
        let state = match self.echo.state_snapshot() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut values = Map::new();
        match &self.phase.rules.context_scope {
            None => {
                values = state.clone();
            }
            Some(scope) => {
                if let Some(input) = state.get("input") {
                    values.insert("input".to_string(), input.clone());
                }
                for entry in scope {
                    if let Some(value) = state.get(entry) {
                        values.insert(entry.clone(), value.clone());
                    }
                }
            }
        }
        // The full state is always reachable under the reserved key.
        values.insert("state".to_string(), Value::Object(state));
        Value::Object(values)
    }

    fn condition_values(&self, last_response: &str, turn: u32) -> Value {
        let mut values = match self.scoped_values() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        values.insert("last_response".to_string(), Value::String(last_response.to_string()));
        values.insert("turn".to_string(), json!(turn));
        Value::Object(values)
    }

    async fn call_provider(
        &self,
        messages: &[ChatMessage],
        model: &str,
        tools: &[crate::skills::SkillDescriptor],
        cancel: &CancellationToken,
    ) -> Result<Completion, PhaseError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(PhaseError::Cancelled);
            }
            let request = CompletionRequest {
                messages,
                model,
                tools,
            };
            match self.ctx.provider.complete(request, cancel).await {
                Ok(completion) => return Ok(completion),
                Err(error) if error.transient && attempt < MAX_PROVIDER_ATTEMPTS => {
                    tracing::debug!(
                        phase = %self.phase.name,
                        attempt,
                        error = %error,
                        "transient provider failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        PROVIDER_BACKOFF_MS << (attempt - 1),
                    ))
                    .await;
                }
                Err(error) => {
                    return Err(PhaseError::Provider {
                        message: error.message,
                        transient: error.transient,
                    })
                }
            }
        }
    }

    /// Bring the window under budget before a call, emitting a
    /// `token_budget_enforcement` event describing what was done.
    async fn enforce_budget(
        &self,
        window: &mut MessageWindow,
        budget: &TokenBudgetConfig,
        scope_id: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PhaseError> {
        if !window.needs_pruning(budget) {
            return Ok(());
        }

        let report = match budget.strategy {
            BudgetStrategy::FifoDrop => window.prune_fifo(budget),
            BudgetStrategy::Compact => window.prune_compact(budget),
            BudgetStrategy::Summarize => {
                self.summarize_window(window, budget, scope_id, model, cancel)
                    .await?
            }
        };

        self.echo.append(
            EventDraft::new(NodeType::TokenBudgetEnforcement, "budget")
                .phase(self.phase.name.clone())
                .parent(scope_id.to_string())
                .metadata(json!({
                    "before": report.before,
                    "after": report.after,
                    "limit": budget.limit,
                    "pruned": report.pruned,
                    "strategy": budget.strategy.to_string(),
                })),
        );

        if window.needs_pruning(budget) {
            return Err(PhaseError::BudgetOverflow {
                phase: self.phase.name.clone(),
                estimate: window.estimated_tokens() + budget.reserve,
                limit: budget.limit,
            });
        }
        Ok(())
    }

    /// Replace the oldest window with a single summary message produced by
    /// a summarizer call.
    async fn summarize_window(
        &self,
        window: &mut MessageWindow,
        budget: &TokenBudgetConfig,
        scope_id: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<PruneReport, PhaseError> {
        let before = window.estimated_tokens();
        let taken = window.take_summarizable(budget.keep_last);
        if taken.is_empty() {
            return Ok(PruneReport {
                before,
                after: before,
                pruned: 0,
            });
        }

        let transcript: String = taken
            .iter()
            .map(|m| format!("{:?}: {}\n", m.role, m.content))
            .collect();
        let summarizer_model = budget.summarizer_model.as_deref().unwrap_or(model);
        let messages = [
            ChatMessage::system(
                "Summarize the following conversation excerpt. Preserve facts, decisions, \
                 and any values later steps may need. Reply with the summary only.",
            ),
            ChatMessage::user(transcript),
        ];

        let started = Instant::now();
        let completion = self
            .call_provider(&messages, summarizer_model, &[], cancel)
            .await?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.echo.append(
            EventDraft::new(NodeType::Agent, "summarizer")
                .phase(self.phase.name.clone())
                .parent(scope_id.to_string())
                .content(completion.content.clone())
                .tokens(completion.tokens_in, completion.tokens_out)
                .cost(completion.cost)
                .model(completion.model_reported.clone())
                .duration_ms(duration_ms),
        );
        self.ctx
            .credits
            .record(completion.tokens_in, completion.tokens_out, completion.cost);

        window.insert_summary(completion.content);
        Ok(PruneReport {
            before,
            after: window.estimated_tokens(),
            pruned: taken.len(),
        })
    }

    /// Execute the tool calls of one assistant turn. Calls run concurrently
    /// only when every requested skill is pure; results are appended in
    /// request order either way.
    async fn run_tool_calls(
        &self,
        calls: &[ToolCallRequest],
        scope_id: &str,
        cancel: &CancellationToken,
        window: &mut MessageWindow,
        tool_results: &mut ToolResults,
    ) -> Result<(), PhaseError> {
        let mut resolved = Vec::with_capacity(calls.len());
        for call in calls {
            let skill = self.ctx.skills.get(&call.name).ok_or_else(|| PhaseError::ToolCall {
                tool: call.name.clone(),
                kind: crate::errors::ToolErrorKind::Permanent,
                message: "tool is not registered".to_string(),
            })?;
            self.echo.append(
                EventDraft::new(NodeType::ToolCall, "tool_call")
                    .phase(self.phase.name.clone())
                    .parent(scope_id.to_string())
                    .content(call.name.clone())
                    .metadata(json!({"id": call.id, "arguments": call.arguments})),
            );
            resolved.push(skill);
        }

        let all_pure = resolved.iter().all(|s| s.descriptor().is_pure);
        let mut outcomes = Vec::with_capacity(calls.len());
        if all_pure && calls.len() > 1 {
            let futures: Vec<_> = calls
                .iter()
                .zip(&resolved)
                .map(|(call, skill)| invoke_with_policy(skill, call.arguments.clone(), cancel))
                .collect();
            outcomes.extend(join_all(futures).await);
        } else {
            for (call, skill) in calls.iter().zip(&resolved) {
                outcomes.push(invoke_with_policy(skill, call.arguments.clone(), cancel).await);
            }
        }

        for (call, outcome) in calls.iter().zip(outcomes) {
            match outcome {
                Ok(value) => {
                    self.echo.append(
                        EventDraft::new(NodeType::ToolResult, "tool_result")
                            .phase(self.phase.name.clone())
                            .parent(scope_id.to_string())
                            .content(value_to_text(&value))
                            .metadata(json!({"id": call.id, "tool": call.name})),
                    );
                    window.push(ChatMessage::tool_result(call.id.clone(), value_to_text(&value)));
                    tool_results.push((call.name.clone(), value));
                }
                Err(error) => {
                    self.echo.append(
                        EventDraft::new(NodeType::ToolResult, "tool_result")
                            .phase(self.phase.name.clone())
                            .parent(scope_id.to_string())
                            .content(error.message.clone())
                            .metadata(json!({
                                "id": call.id,
                                "tool": call.name,
                                "error": error.kind.to_string(),
                            })),
                    );
                    return Err(PhaseError::ToolCall {
                        tool: call.name.clone(),
                        kind: error.kind,
                        message: error.message,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Text form of an output value: strings stay bare, everything else is
/// compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
