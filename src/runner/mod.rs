//! The runtime and the per-session cascade loop.
//!
//! `Runtime` is the explicit owner of everything that used to be ambient:
//! the provider, the skill registry, the cascade registry, the session map,
//! the trace pipeline, the checkpoint broker, and the credit ledger.
//! Components receive it by reference; there are no process-wide mutable
//! registries.
//!
//! A session run iterates phases strictly sequentially: each phase executes
//! (directly, through the candidate explorer, or as a sub-cascade), its
//! output passes through the wards, and on acceptance the output is merged
//! into session state before the next phase begins. Failure policy decides
//! between re-execution and terminating the session as failed.

use crate::candidates::CandidateExplorer;
use crate::cascade::{self, CascadeConfig, HumanInputType, PhaseConfig, WardOnFail};
use crate::credits::CreditLedger;
use crate::echo::{CostTally, Echo, ErrorRecord, LineageEntry, SessionManager, SessionStatus};
use crate::errors::{CascadeError, LoadError, PhaseError};
use crate::phase::{value_to_text, PhaseContext, PhaseOutput, PhaseRunner};
use crate::provider::{ChatMessage, Provider};
use crate::skills::SkillRegistry;
use crate::template;
use crate::trace::{
    EventDraft, EventSink, JsonlSink, LineageGraph, NodeType, TracePipeline,
};
use crate::wards::{WardRunner, WardsResult};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod checkpoint;

pub use checkpoint::{CheckpointBroker, CheckpointError, CheckpointInfo};

/// Ceiling on phase executions per session, as a multiple of the phase
/// count. Bounds handoff and retry loops.
const MAX_EXECUTIONS_PER_PHASE: u32 = 16;

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Model used when neither the phase nor a block overrides it.
    pub default_model: String,
    /// When set, a JSONL sink under this directory receives every event.
    pub logs_dir: Option<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            default_model: "openrouter/auto".to_string(),
            logs_dir: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    pub fn with_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(dir.into());
        self
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: SessionStatus,
    pub session_id: String,
    /// Output of the last accepted phase; absent on failure.
    pub output: Option<Value>,
    pub lineage: Vec<LineageEntry>,
    pub errors: Vec<ErrorRecord>,
    pub cost: CostTally,
}

/// An accepted phase execution, ready to merge into session state.
struct AcceptedPhase {
    value: Value,
    warnings: Vec<String>,
    complete_trace_id: String,
}

pub struct Runtime {
    provider: Arc<dyn Provider>,
    skills: SkillRegistry,
    cascades: RwLock<HashMap<String, Arc<CascadeConfig>>>,
    sessions: SessionManager,
    pipeline: TracePipeline,
    credits: CreditLedger,
    checkpoints: CheckpointBroker,
    options: RuntimeOptions,
}

impl Runtime {
    pub fn new(provider: Arc<dyn Provider>, options: RuntimeOptions) -> Arc<Self> {
        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if let Some(dir) = &options.logs_dir {
            sinks.push(Arc::new(JsonlSink::new(dir.clone())));
        }
        Self::with_sinks(provider, options, sinks)
    }

    /// Construct with explicit sinks (observers, test capture) in addition
    /// to the logs-dir sink.
    pub fn with_sinks(
        provider: Arc<dyn Provider>,
        options: RuntimeOptions,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Arc<Self> {
        let pipeline = TracePipeline::start(sinks);
        Arc::new(Self {
            provider,
            skills: SkillRegistry::new(),
            cascades: RwLock::new(HashMap::new()),
            sessions: SessionManager::new(pipeline.clone()),
            pipeline,
            credits: CreditLedger::new(),
            checkpoints: CheckpointBroker::new(),
            options,
        })
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn skills(&self) -> &SkillRegistry {
        &self.skills
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn credits(&self) -> &CreditLedger {
        &self.credits
    }

    pub fn checkpoints(&self) -> &CheckpointBroker {
        &self.checkpoints
    }

    pub fn default_model(&self) -> &str {
        &self.options.default_model
    }

    /// Validate and register a cascade for execution (and for resolution
    /// of `sub_cascade` / `async_cascade` / ward references).
    pub fn register_cascade(&self, config: CascadeConfig) -> Result<(), LoadError> {
        let issues = cascade::validate(&config);
        if !issues.is_empty() {
            return Err(LoadError::Invalid { issues });
        }
        self.cascades
            .write()
            .insert(config.cascade_id.clone(), Arc::new(config));
        Ok(())
    }

    pub fn cascade(&self, cascade_id: &str) -> Option<Arc<CascadeConfig>> {
        self.cascades.read().get(cascade_id).cloned()
    }

    /// Register and run a cascade as a root session.
    pub async fn run_cascade(
        self: &Arc<Self>,
        config: CascadeConfig,
        inputs: Value,
        session_id: Option<String>,
    ) -> Result<RunOutcome, CascadeError> {
        let cascade_id = config.cascade_id.clone();
        self.register_cascade(config)?;
        self.run_registered(&cascade_id, inputs, session_id).await
    }

    /// Run an already registered cascade as a root session.
    pub async fn run_registered(
        self: &Arc<Self>,
        cascade_id: &str,
        inputs: Value,
        session_id: Option<String>,
    ) -> Result<RunOutcome, CascadeError> {
        self.run_child(cascade_id, inputs, session_id, None, None, CancellationToken::new())
            .await
    }

    /// Run a registered cascade, optionally as a child of an existing
    /// session. Execution failures land in the returned outcome
    /// (`status = failed`); only an unknown id is an `Err`.
    pub async fn run_child(
        self: &Arc<Self>,
        cascade_id: &str,
        inputs: Value,
        session_id: Option<String>,
        parent: Option<&Echo>,
        parent_trace: Option<String>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, CascadeError> {
        let (config, echo) = self.spawn_session(cascade_id, inputs, session_id, parent)?;
        Ok(self.clone().run_session(config, echo, parent_trace, cancel).await)
    }

    /// Create the session for a registered cascade without running it.
    fn spawn_session(
        &self,
        cascade_id: &str,
        inputs: Value,
        session_id: Option<String>,
        parent: Option<&Echo>,
    ) -> Result<(Arc<CascadeConfig>, Arc<Echo>), CascadeError> {
        let config = self
            .cascade(cascade_id)
            .ok_or_else(|| CascadeError::UnknownCascade {
                id: cascade_id.to_string(),
            })?;
        let echo = self
            .sessions
            .create_session(cascade_id, inputs, session_id, parent);
        Ok((config, echo))
    }

    /// Export the lineage graph for a session and its descendants.
    pub fn export_graph(&self, session_id: &str) -> Option<LineageGraph> {
        self.sessions.get(session_id)?;
        let events = self.sessions.collect_tree_events(session_id);
        Some(LineageGraph::build(session_id, events))
    }

    pub fn pending_checkpoints(&self, session_id: &str) -> Vec<CheckpointInfo> {
        self.checkpoints.pending_checkpoints(session_id)
    }

    pub fn resolve_checkpoint(&self, checkpoint_id: &str, answer: String) -> Result<(), CheckpointError> {
        self.checkpoints.resolve(checkpoint_id, answer)
    }

    /// Wait until every published event has reached all sinks.
    pub async fn flush(&self) {
        self.pipeline.flush().await;
    }

    /// The per-session phase loop. Boxed so sub-cascades and ward cascades
    /// can recurse through it.
    fn run_session(
        self: Arc<Self>,
        config: Arc<CascadeConfig>,
        echo: Arc<Echo>,
        parent_trace: Option<String>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, RunOutcome> {
        Box::pin(async move {
            tracing::info!(
                cascade = %config.cascade_id,
                session = %echo.session_id,
                depth = echo.depth,
                "cascade starting"
            );

            let root_trace = echo.append(
                EventDraft::new(NodeType::Cascade, "cascade_start")
                    .parent_opt(parent_trace)
                    .content(config.description.clone().unwrap_or_default())
                    .metadata(json!({"depth": echo.depth})),
            );

            let phase_cap = config.phases.len() as u32 * MAX_EXECUTIONS_PER_PHASE;
            let mut executions = 0u32;
            let mut index = 0usize;
            let mut status = SessionStatus::Ok;
            let mut final_output: Option<Value> = None;
            let mut retries_used: HashMap<String, u32> = HashMap::new();

            'phases: while index < config.phases.len() {
                if cancel.is_cancelled() {
                    echo.record_error("cancelled", "session cancelled", None);
                    status = SessionStatus::Aborted;
                    break 'phases;
                }

                executions += 1;
                if executions > phase_cap {
                    let error = CascadeError::HandoffLimit { executions };
                    echo.record_error(error.kind(), error.to_string(), None);
                    echo.append(
                        EventDraft::new(NodeType::Error, "error")
                            .parent(root_trace.clone())
                            .content(error.to_string())
                            .metadata(json!({"kind": error.kind()})),
                    );
                    status = SessionStatus::Failed;
                    break 'phases;
                }

                let phase = &config.phases[index];
                match self
                    .execute_phase(&config, &echo, phase, &root_trace, &cancel)
                    .await
                {
                    Ok(accepted) => {
                        echo.update_state(&phase.name, accepted.value.clone());
                        echo.push_lineage(LineageEntry {
                            phase_name: phase.name.clone(),
                            trace_id: accepted.complete_trace_id,
                            output: accepted.value.clone(),
                            warnings: accepted.warnings,
                        });
                        final_output = Some(accepted.value);

                        if let Some(handoff) = &phase.handoff {
                            let jump = match &handoff.when {
                                None => true,
                                Some(condition) => {
                                    let values = state_values(&echo);
                                    template::eval_condition(condition, &values).unwrap_or_else(|e| {
                                        tracing::warn!(
                                            phase = %phase.name,
                                            error = %e,
                                            "handoff condition failed to render, not jumping"
                                        );
                                        false
                                    })
                                }
                            };
                            if jump {
                                index = config
                                    .phase_index(&handoff.target_phase)
                                    .expect("handoff target validated at load");
                                continue 'phases;
                            }
                        }
                        index += 1;
                    }
                    Err(error) => {
                        echo.record_error(error.kind(), error.to_string(), Some(&phase.name));
                        echo.append(
                            EventDraft::new(NodeType::Error, "error")
                                .phase(phase.name.clone())
                                .parent(root_trace.clone())
                                .content(error.to_string())
                                .metadata(json!({"kind": error.kind()})),
                        );

                        if matches!(error, PhaseError::Cancelled) {
                            status = SessionStatus::Aborted;
                            break 'phases;
                        }

                        let used = retries_used.entry(phase.name.clone()).or_insert(0);
                        if let Some(retry) = &phase.rules.retry_on_failure
                            && error.is_retriable()
                            && *used < retry.max_retries
                        {
                            *used += 1;
                            tracing::warn!(
                                phase = %phase.name,
                                attempt = *used,
                                error = %error,
                                "phase failed, re-entering per retry_on_failure"
                            );
                            if let Some(target) = &retry.target_phase {
                                index = config
                                    .phase_index(target)
                                    .expect("retry target validated at load");
                            }
                            continue 'phases;
                        }

                        status = SessionStatus::Failed;
                        break 'phases;
                    }
                }
            }

            if status != SessionStatus::Ok {
                final_output = None;
            }

            echo.append(
                EventDraft::new(NodeType::SessionEnd, "session_end")
                    .parent(root_trace)
                    .metadata(json!({"status": status.to_string()})),
            );
            echo.close(status);
            self.pipeline.flush().await;

            tracing::info!(
                session = %echo.session_id,
                %status,
                phases = echo.export_lineage().len(),
                "cascade finished"
            );

            RunOutcome {
                status,
                session_id: echo.session_id.clone(),
                output: final_output,
                lineage: echo.export_lineage(),
                errors: echo.errors_snapshot(),
                cost: echo.cost_snapshot(),
            }
        })
    }

    /// Execute one phase to acceptance: dispatch on kind, then drive the
    /// ward retry-with-feedback loop around generated outputs.
    async fn execute_phase(
        self: &Arc<Self>,
        config: &Arc<CascadeConfig>,
        echo: &Arc<Echo>,
        phase: &PhaseConfig,
        root_trace: &str,
        cancel: &CancellationToken,
    ) -> Result<AcceptedPhase, PhaseError> {
        if let Some(human_input) = &phase.human_input {
            return self.run_human_input(echo, phase, human_input, root_trace, cancel).await;
        }
        if let Some(async_ref) = &phase.async_cascade {
            return self.spawn_async_cascade(echo, phase, async_ref, root_trace);
        }

        let mut ward_attempts = 0u32;
        let mut extra: Vec<ChatMessage> = Vec::new();

        loop {
            let output = if let Some(sub) = &phase.sub_cascade {
                self.run_sub_cascade(echo, phase, sub, root_trace, cancel).await?
            } else if let Some(candidates) = &phase.candidates {
                CandidateExplorer::new(
                    self,
                    echo,
                    phase,
                    candidates,
                    config.token_budget.as_ref(),
                    root_trace,
                    &extra,
                    cancel,
                )
                .explore()
                .await?
            } else {
                let ctx = PhaseContext {
                    provider: self.provider(),
                    skills: self.skills(),
                    credits: self.credits(),
                    token_budget: config.token_budget.as_ref(),
                    default_model: self.default_model(),
                };
                PhaseRunner::new(
                    &ctx,
                    echo,
                    phase,
                    Some(root_trace.to_string()),
                    extra.clone(),
                    cancel.clone(),
                )
                .run()
                .await?
            };

            let Some(wards_config) = &phase.wards else {
                return Ok(AcceptedPhase {
                    value: output.value,
                    warnings: Vec::new(),
                    complete_trace_id: output.complete_trace_id,
                });
            };

            let ward_runner = WardRunner::new(self, echo, &phase.name, cancel);
            match ward_runner
                .evaluate(wards_config, &output.value, &output.scope_trace_id)
                .await?
            {
                WardsResult::Accepted {
                    output: final_value,
                    warnings,
                } => {
                    return Ok(AcceptedPhase {
                        value: final_value,
                        warnings,
                        complete_trace_id: output.complete_trace_id,
                    })
                }
                WardsResult::Rejected { feedback } => match wards_config.on_fail {
                    WardOnFail::Warn => {
                        return Ok(AcceptedPhase {
                            value: output.value,
                            warnings: vec![feedback],
                            complete_trace_id: output.complete_trace_id,
                        })
                    }
                    WardOnFail::Fatal => {
                        return Err(PhaseError::WardFatal {
                            phase: phase.name.clone(),
                            feedback,
                        })
                    }
                    WardOnFail::Retry => {
                        if ward_attempts >= wards_config.max_retries {
                            return Err(PhaseError::WardReject {
                                phase: phase.name.clone(),
                                feedback,
                            });
                        }
                        ward_attempts += 1;
                        echo.append(
                            EventDraft::new(NodeType::WardRetry, "ward_retry")
                                .phase(phase.name.clone())
                                .parent(output.scope_trace_id.clone())
                                .content(feedback.clone())
                                .metadata(json!({"attempt": ward_attempts})),
                        );
                        extra.push(ChatMessage::user(format!(
                            "A validator rejected the previous output:\n{feedback}\n\n\
                             Address the feedback and produce a corrected output."
                        )));
                    }
                },
            }
        }
    }

    /// Suspend on a human checkpoint until resolved (or timed out).
    async fn run_human_input(
        self: &Arc<Self>,
        echo: &Arc<Echo>,
        phase: &PhaseConfig,
        human_input: &cascade::HumanInputConfig,
        root_trace: &str,
        cancel: &CancellationToken,
    ) -> Result<AcceptedPhase, PhaseError> {
        let values = state_values(echo);
        let prompt = template::render(&human_input.prompt, &values).map_err(|e| {
            PhaseError::PromptRender {
                phase: phase.name.clone(),
                detail: e.detail,
            }
        })?;

        let (info, rx) = self.checkpoints.create(
            &echo.session_id,
            &phase.name,
            prompt.clone(),
            human_input.input_type,
            human_input.options.clone(),
        );

        let event_id = echo.append(
            EventDraft::new(NodeType::HumanInput, "human_input")
                .phase(phase.name.clone())
                .parent(root_trace.to_string())
                .content(prompt)
                .metadata(json!({
                    "checkpoint_id": info.checkpoint_id,
                    "input_type": human_input.input_type,
                    "options": human_input.options,
                })),
        );

        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.checkpoints.discard(&info.checkpoint_id);
                return Err(PhaseError::Cancelled);
            }
            answer = rx => match answer {
                Ok(answer) => answer,
                Err(_) => {
                    self.checkpoints.discard(&info.checkpoint_id);
                    return Err(PhaseError::Cancelled);
                }
            },
            _ = wait_or_forever(human_input.timeout_ms) => {
                self.checkpoints.discard(&info.checkpoint_id);
                return Err(PhaseError::Timeout {
                    phase: phase.name.clone(),
                    timeout_ms: human_input.timeout_ms.unwrap_or_default(),
                });
            }
        };

        if human_input.input_type == HumanInputType::Choice
            && !human_input.options.is_empty()
            && !human_input.options.iter().any(|o| o.value == answer)
        {
            tracing::warn!(
                phase = %phase.name,
                %answer,
                "checkpoint answer does not match any declared option"
            );
        }

        Ok(AcceptedPhase {
            value: Value::String(answer),
            warnings: Vec::new(),
            complete_trace_id: event_id,
        })
    }

    /// Run a nested cascade synchronously, propagating context inward and
    /// merging the child back on completion.
    async fn run_sub_cascade(
        self: &Arc<Self>,
        echo: &Arc<Echo>,
        phase: &PhaseConfig,
        sub: &cascade::SubCascadeRef,
        root_trace: &str,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutput, PhaseError> {
        let inputs = self.render_child_inputs(echo, phase, sub.inputs.as_ref())?;
        let (child_config, child_echo) = self
            .spawn_session(&sub.cascade, inputs, None, Some(echo.as_ref()))
            .map_err(|e| PhaseError::Provider {
                message: e.to_string(),
                transient: false,
            })?;

        if sub.context_in {
            propagate_state(echo, &child_echo);
        }

        let start_id = echo.append(
            EventDraft::new(NodeType::SubCascadeStart, "sub_cascade_start")
                .phase(phase.name.clone())
                .parent(root_trace.to_string())
                .content(sub.cascade.clone())
                .metadata(json!({
                    "cascade": sub.cascade,
                    "child_session_id": child_echo.session_id,
                    "async": false,
                })),
        );

        let outcome = self
            .clone()
            .run_session(
                child_config,
                child_echo.clone(),
                Some(start_id.clone()),
                cancel.child_token(),
            )
            .await;

        let child_root_trace = child_echo
            .history_snapshot()
            .first()
            .map(|e| e.trace_id.clone())
            .unwrap_or_default();

        let complete_id = echo.append(
            EventDraft::new(NodeType::SubCascadeComplete, "sub_cascade_complete")
                .phase(phase.name.clone())
                .parent(start_id)
                .content(
                    outcome
                        .output
                        .as_ref()
                        .map(value_to_text)
                        .unwrap_or_default(),
                )
                .metadata(json!({
                    "cascade": sub.cascade,
                    "child_session_id": child_echo.session_id,
                    "child_trace_id": child_root_trace,
                    "status": outcome.status.to_string(),
                })),
        );

        if outcome.status != SessionStatus::Ok {
            return Err(PhaseError::Provider {
                message: format!(
                    "sub-cascade `{}` finished with status {}",
                    sub.cascade, outcome.status
                ),
                transient: false,
            });
        }

        if let Some(state_key) = &sub.state_key {
            echo.merge_child(&child_echo, state_key);
        }

        let tally = outcome.cost;
        echo.add_cost(tally.tokens_in, tally.tokens_out, tally.cost);

        Ok(PhaseOutput {
            value: outcome.output.unwrap_or(Value::Null),
            scope_trace_id: complete_id.clone(),
            complete_trace_id: complete_id,
            tokens_in: tally.tokens_in,
            tokens_out: tally.tokens_out,
            cost: tally.cost,
        })
    }

    /// Fire-and-forget: spawn the child and return its handle immediately.
    /// The child gets a fresh cancellation token; ending or cancelling the
    /// parent never touches it.
    fn spawn_async_cascade(
        self: &Arc<Self>,
        echo: &Arc<Echo>,
        phase: &PhaseConfig,
        async_ref: &cascade::AsyncCascadeRef,
        root_trace: &str,
    ) -> Result<AcceptedPhase, PhaseError> {
        let inputs = self.render_child_inputs(echo, phase, async_ref.inputs.as_ref())?;
        let (child_config, child_echo) = self
            .spawn_session(&async_ref.cascade, inputs, None, Some(echo.as_ref()))
            .map_err(|e| PhaseError::Provider {
                message: e.to_string(),
                transient: false,
            })?;

        if async_ref.context_in {
            propagate_state(echo, &child_echo);
        }

        let start_id = echo.append(
            EventDraft::new(NodeType::SubCascadeStart, "sub_cascade_start")
                .phase(phase.name.clone())
                .parent(root_trace.to_string())
                .content(async_ref.cascade.clone())
                .metadata(json!({
                    "cascade": async_ref.cascade,
                    "child_session_id": child_echo.session_id,
                    "async": true,
                })),
        );

        let child_session_id = child_echo.session_id.clone();
        let runtime = self.clone();
        tokio::spawn(runtime.run_session(
            child_config,
            child_echo,
            Some(start_id.clone()),
            CancellationToken::new(),
        ));

        Ok(AcceptedPhase {
            value: json!({"session_id": child_session_id}),
            warnings: Vec::new(),
            complete_trace_id: start_id,
        })
    }

    /// Render the declared child input templates against the parent state.
    fn render_child_inputs(
        &self,
        echo: &Arc<Echo>,
        phase: &PhaseConfig,
        inputs: Option<&std::collections::BTreeMap<String, String>>,
    ) -> Result<Value, PhaseError> {
        let mut rendered = Map::new();
        if let Some(inputs) = inputs {
            let values = state_values(echo);
            for (key, source) in inputs {
                let text = template::render(source, &values).map_err(|e| PhaseError::PromptRender {
                    phase: phase.name.clone(),
                    detail: format!("sub-cascade input `{key}`: {}", e.detail),
                })?;
                rendered.insert(key.clone(), Value::String(text));
            }
        }
        Ok(Value::Object(rendered))
    }
}

/// Copy the parent's state (except its seeded `input`) into a child
/// session: the snapshot children see at spawn time.
fn propagate_state(parent: &Echo, child: &Echo) {
    if let Value::Object(state) = parent.state_snapshot() {
        for (key, value) in state {
            if key != "input" {
                child.update_state(&key, value);
            }
        }
    }
}

/// Template values for conditions and child-input rendering: the full
/// state with itself under the reserved `state` key.
fn state_values(echo: &Echo) -> Value {
    let state = match echo.state_snapshot() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut values = state.clone();
    values.insert("state".to_string(), Value::Object(state));
    Value::Object(values)
}

async fn wait_or_forever(timeout_ms: Option<u64>) {
    match timeout_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending().await,
    }
}
