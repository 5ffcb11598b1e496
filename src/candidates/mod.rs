//! Candidate exploration: N alternative generations, evaluated, optionally
//! reforged.
//!
//! Each candidate runs the same phase body in its own child session
//! (`<parent>_sub_<k>`, `k` counting across reforge rounds) under a bounded
//! fan-out. An evaluator model ranks the outputs; cost-aware selection can
//! scalarize quality against cost or restrict to the Pareto frontier
//! first. When reforging is enabled, the evaluator's critique seeds the
//! next round until the iteration bound, quality threshold, or cost cap
//! ends the loop.

use crate::cascade::{CandidatesConfig, PhaseConfig, TokenBudgetConfig};
use crate::echo::{Echo, SessionStatus};
use crate::errors::PhaseError;
use crate::phase::{extract_json_block, value_to_text, PhaseContext, PhaseOutput, PhaseRunner};
use crate::provider::{ChatMessage, CompletionRequest};
use crate::runner::Runtime;
use crate::trace::{EventDraft, NodeType};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one candidate generation.
#[derive(Debug, Clone)]
struct CandidateRun {
    index: usize,
    session_id: String,
    output: Option<Value>,
    error: Option<String>,
    tokens_in: u64,
    tokens_out: u64,
    cost: f64,
}

impl CandidateRun {
    fn viable(&self) -> bool {
        self.output.is_some()
    }
}

/// Evaluator ranking for one round.
struct Evaluation {
    /// Per-candidate quality score, `NEG_INFINITY` for failed candidates.
    scores: Vec<f64>,
    justification: String,
}

pub struct CandidateExplorer<'a> {
    runtime: &'a Arc<Runtime>,
    echo: &'a Arc<Echo>,
    phase: &'a PhaseConfig,
    candidates: &'a CandidatesConfig,
    token_budget: Option<&'a TokenBudgetConfig>,
    parent_trace: &'a str,
    extra_messages: &'a [ChatMessage],
    cancel: &'a CancellationToken,
}

impl<'a> CandidateExplorer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: &'a Arc<Runtime>,
        echo: &'a Arc<Echo>,
        phase: &'a PhaseConfig,
        candidates: &'a CandidatesConfig,
        token_budget: Option<&'a TokenBudgetConfig>,
        parent_trace: &'a str,
        extra_messages: &'a [ChatMessage],
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            runtime,
            echo,
            phase,
            candidates,
            token_budget,
            parent_trace,
            extra_messages,
            cancel,
        }
    }

    /// Run the exploration state machine and return the winning output as
    /// the phase output.
    pub async fn explore(&self) -> Result<PhaseOutput, PhaseError> {
        let phase_name = &self.phase.name;

        let scope_id = self.echo.append(
            EventDraft::new(NodeType::Phase, "phase")
                .phase(phase_name.clone())
                .parent(self.parent_trace.to_string()),
        );
        self.echo.append(
            EventDraft::new(NodeType::PhaseStart, "phase_start")
                .phase(phase_name.clone())
                .parent(scope_id.clone())
                .metadata(json!({"candidates": self.candidates.count})),
        );

        // Session ids keep counting across ward retries of the same phase,
        // so a retried exploration never reuses a child id.
        let prefix = format!("{}_sub_", self.echo.session_id);
        let mut spawn_counter = self
            .runtime
            .sessions()
            .children_of(&self.echo.session_id)
            .iter()
            .filter(|c| c.session_id.starts_with(&prefix))
            .count();
        let mut iteration = 0u32;
        let mut extra = self.extra_messages.to_vec();
        let mut exploration_cost = 0.0f64;
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PhaseError::Cancelled);
            }

            let round_start = self.echo.append(
                EventDraft::new(NodeType::CandidatesStart, "candidates_start")
                    .phase(phase_name.clone())
                    .parent(scope_id.clone())
                    .metadata(json!({
                        "count": self.candidates.count,
                        "iteration": iteration,
                        "max_parallel": self.candidates.max_parallel,
                    })),
            );

            let runs = self.run_round(&mut spawn_counter, &round_start, &extra).await;
            for run in &runs {
                tokens_in += run.tokens_in;
                tokens_out += run.tokens_out;
                exploration_cost += run.cost;
                self.echo.add_cost(run.tokens_in, run.tokens_out, run.cost);
            }

            if !runs.iter().any(CandidateRun::viable) {
                return Err(PhaseError::AllCandidatesFailed {
                    phase: phase_name.clone(),
                    count: runs.len(),
                });
            }

            let evaluation = self.evaluate(&runs, iteration, &scope_id).await?;
            let winner_index = self.select_winner(&runs, &evaluation.scores);
            let winner_score = evaluation.scores[winner_index];

            for run in &runs {
                self.echo.append(
                    EventDraft::new(NodeType::CandidateAttempt, "candidate_attempt")
                        .phase(phase_name.clone())
                        .parent(round_start.clone())
                        .candidate(run.index)
                        .winner(run.index == winner_index)
                        .content(match &run.output {
                            Some(output) => value_to_text(output),
                            None => run.error.clone().unwrap_or_default(),
                        })
                        .tokens(run.tokens_in, run.tokens_out)
                        .cost(run.cost)
                        .metadata(json!({
                            "child_session_id": run.session_id,
                            "iteration": iteration,
                            "failed": !run.viable(),
                        })),
                );
            }

            let winner = &runs[winner_index];
            let winner_output = winner.output.clone().unwrap_or(Value::Null);

            if !self.should_reforge(iteration, winner_score, exploration_cost) {
                let complete_id = self.echo.append(
                    EventDraft::new(NodeType::PhaseComplete, "phase_complete")
                        .phase(phase_name.clone())
                        .parent(scope_id.clone())
                        .content(value_to_text(&winner_output))
                        .metadata(json!({
                            "winner_index": winner_index,
                            "iterations": iteration + 1,
                            "exploration_cost": exploration_cost,
                        })),
                );
                return Ok(PhaseOutput {
                    value: winner_output,
                    scope_trace_id: scope_id,
                    complete_trace_id: complete_id,
                    tokens_in,
                    tokens_out,
                    cost: exploration_cost,
                });
            }

            iteration += 1;
            extra = self.extra_messages.to_vec();
            extra.push(ChatMessage::user(format!(
                "A previous attempt produced:\n{}\n\nEvaluator critique:\n{}\n\n\
                 Produce an improved response that addresses the critique.",
                value_to_text(&winner_output),
                evaluation.justification,
            )));
        }
    }

    fn should_reforge(&self, iteration: u32, winner_score: f64, exploration_cost: f64) -> bool {
        let Some(reforge) = &self.candidates.reforge else {
            return false;
        };
        if !reforge.enabled || iteration >= reforge.max_iterations {
            return false;
        }
        if let Some(threshold) = reforge.quality_threshold
            && winner_score >= threshold
        {
            return false;
        }
        if let Some(max_cost) = self.candidates.max_cost
            && exploration_cost >= max_cost
        {
            return false;
        }
        true
    }

    /// Spawn one round of candidates under the fan-out limit. Results come
    /// back in candidate order regardless of completion order.
    async fn run_round(
        &self,
        spawn_counter: &mut usize,
        round_trace: &str,
        extra: &[ChatMessage],
    ) -> Vec<CandidateRun> {
        let base = *spawn_counter;
        *spawn_counter += self.candidates.count;

        let futures = (0..self.candidates.count).map(|index| {
            let session_id = format!("{}_sub_{}", self.echo.session_id, base + index);
            self.run_candidate(index, session_id, round_trace, extra)
        });

        futures::stream::iter(futures)
            .buffered(self.candidates.max_parallel.max(1))
            .collect()
            .await
    }

    async fn run_candidate(
        &self,
        index: usize,
        session_id: String,
        round_trace: &str,
        extra: &[ChatMessage],
    ) -> CandidateRun {
        let parent_input = self.echo.state_value("input").unwrap_or(Value::Null);
        let child = self.runtime.sessions().create_session(
            &self.echo.cascade_id,
            parent_input,
            Some(session_id.clone()),
            Some(self.echo.as_ref()),
        );

        // Candidates see a snapshot of the parent state; their own writes
        // stay in the child session.
        if let Value::Object(state) = self.echo.state_snapshot() {
            for (key, value) in state {
                if key != "input" {
                    child.update_state(&key, value);
                }
            }
        }

        let ctx = PhaseContext {
            provider: self.runtime.provider(),
            skills: self.runtime.skills(),
            credits: self.runtime.credits(),
            token_budget: self.token_budget,
            default_model: self.runtime.default_model(),
        };
        let runner = PhaseRunner::new(
            &ctx,
            &child,
            self.phase,
            Some(round_trace.to_string()),
            extra.to_vec(),
            self.cancel.child_token(),
        );

        match runner.run().await {
            Ok(output) => {
                child.append(
                    EventDraft::new(NodeType::SessionEnd, "session_end")
                        .metadata(json!({"status": "ok"})),
                );
                child.close(SessionStatus::Ok);
                CandidateRun {
                    index,
                    session_id,
                    output: Some(output.value),
                    error: None,
                    tokens_in: output.tokens_in,
                    tokens_out: output.tokens_out,
                    cost: output.cost,
                }
            }
            Err(error) => {
                child.record_error(error.kind(), error.to_string(), Some(&self.phase.name));
                child.append(
                    EventDraft::new(NodeType::Error, "error")
                        .phase(self.phase.name.clone())
                        .content(error.to_string())
                        .metadata(json!({"kind": error.kind()})),
                );
                child.append(
                    EventDraft::new(NodeType::SessionEnd, "session_end")
                        .metadata(json!({"status": "failed"})),
                );
                child.close(SessionStatus::Failed);
                let tally = child.cost_snapshot();
                CandidateRun {
                    index,
                    session_id,
                    output: None,
                    error: Some(error.to_string()),
                    tokens_in: tally.tokens_in,
                    tokens_out: tally.tokens_out,
                    cost: tally.cost,
                }
            }
        }
    }

    /// Ask the evaluator to rank the round. A reply the engine cannot
    /// parse falls back to document order over the viable candidates, with
    /// the raw reply preserved as the justification.
    async fn evaluate(
        &self,
        runs: &[CandidateRun],
        iteration: u32,
        scope_id: &str,
    ) -> Result<Evaluation, PhaseError> {
        let mut listing = String::new();
        for run in runs {
            match &run.output {
                Some(output) => {
                    listing.push_str(&format!("Candidate {}:\n{}\n\n", run.index, value_to_text(output)));
                }
                None => {
                    listing.push_str(&format!(
                        "Candidate {}: [failed: {}]\n\n",
                        run.index,
                        run.error.as_deref().unwrap_or("unknown error")
                    ));
                }
            }
        }
        let criteria = self
            .candidates
            .criteria
            .as_deref()
            .unwrap_or("overall quality and fitness for the task");

        let messages = [
            ChatMessage::system(
                "You are an evaluator comparing alternative responses to the same task. \
                 Rank them best-first and justify the ranking. Reply with a JSON object: \
                 {\"ranking\": [candidate indices, best first], \
                 \"scores\": [one number per candidate, by index], \
                 \"justification\": \"...\"}.",
            ),
            ChatMessage::user(format!("Criterion: {criteria}\n\n{listing}")),
        ];

        let model = self
            .candidates
            .evaluator_model
            .clone()
            .or_else(|| self.phase.model.clone())
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
            EventDraft::new(NodeType::Agent, "evaluator")
                .phase(self.phase.name.clone())
                .parent(scope_id.to_string())
                .content(completion.content.clone())
                .tokens(completion.tokens_in, completion.tokens_out)
                .cost(completion.cost)
                .model(completion.model_reported.clone())
                .duration_ms(duration_ms)
                .metadata(json!({"iteration": iteration})),
        );
        self.runtime
            .credits()
            .record(completion.tokens_in, completion.tokens_out, completion.cost);

        let evaluation = self.parse_evaluation(runs, &completion.content);

        self.echo.append(
            EventDraft::new(NodeType::CandidatesEvaluation, "candidates_evaluation")
                .phase(self.phase.name.clone())
                .parent(scope_id.to_string())
                .content(evaluation.justification.clone())
                .metadata(json!({
                    "scores": evaluation.scores,
                    "iteration": iteration,
                    "evaluator_model": model,
                })),
        );

        Ok(evaluation)
    }

    fn parse_evaluation(&self, runs: &[CandidateRun], reply: &str) -> Evaluation {
        let count = runs.len();
        let parsed = extract_json_block(reply);

        let mut justification = reply.trim().to_string();
        let mut scores: Vec<Option<f64>> = vec![None; count];

        if let Some(Value::Object(map)) = parsed {
            if let Some(text) = map.get("justification").and_then(Value::as_str) {
                justification = text.to_string();
            }

            if let Some(values) = map.get("scores").and_then(Value::as_array)
                && values.len() == count
            {
                for (index, value) in values.iter().enumerate() {
                    scores[index] = value.as_f64();
                }
            } else if let Some(ranking) = map.get("ranking").and_then(Value::as_array) {
                // Best-first positions become descending scores.
                let indices: Vec<usize> = ranking
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|v| v as usize)
                    .filter(|&i| i < count)
                    .collect();
                for (position, &index) in indices.iter().enumerate() {
                    scores[index] = Some((count - position) as f64);
                }
            }
        }

        // Unranked viable candidates trail in document order; failed
        // candidates always rank worst.
        let mut next_fill = 0.0;
        let final_scores: Vec<f64> = runs
            .iter()
            .enumerate()
            .map(|(index, run)| {
                if !run.viable() {
                    return f64::NEG_INFINITY;
                }
                scores[index].unwrap_or_else(|| {
                    next_fill -= 1.0;
                    next_fill
                })
            })
            .collect();

        Evaluation {
            scores: final_scores,
            justification,
        }
    }

    /// Pick the winner: cost-aware selection when configured, then the
    /// tie-break chain (score, then lower cost, then lower index).
    fn select_winner(&self, runs: &[CandidateRun], scores: &[f64]) -> usize {
        let mut eligible: Vec<usize> = runs
            .iter()
            .filter(|r| r.viable())
            .map(|r| r.index)
            .collect();

        let lambda = match &self.candidates.cost_aware {
            Some(cost_aware) => {
                if let Some(pareto) = &cost_aware.pareto {
                    eligible = pareto_frontier(&eligible, scores, runs);
                    pareto.lambda
                } else if let Some(scalarize) = &cost_aware.scalarize {
                    scalarize.lambda
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        eligible
            .into_iter()
            .map(|index| {
                let selection = scores[index] - lambda * runs[index].cost;
                (index, selection, runs[index].cost)
            })
            .min_by(|a, b| {
                b.1.total_cmp(&a.1) // higher selection score first
                    .then(a.2.total_cmp(&b.2)) // then lower cost
                    .then(a.0.cmp(&b.0)) // then lower index
            })
            .map(|(index, _, _)| index)
            .expect("at least one viable candidate")
    }
}

/// Non-dominated subset: keep candidates no other candidate beats on both
/// quality (higher) and cost (lower).
fn pareto_frontier(eligible: &[usize], scores: &[f64], runs: &[CandidateRun]) -> Vec<usize> {
    eligible
        .iter()
        .copied()
        .filter(|&i| {
            !eligible.iter().any(|&j| {
                j != i
                    && scores[j] >= scores[i]
                    && runs[j].cost <= runs[i].cost
                    && (scores[j] > scores[i] || runs[j].cost < runs[i].cost)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(index: usize, cost: f64, viable: bool) -> CandidateRun {
        CandidateRun {
            index,
            session_id: format!("s_sub_{index}"),
            output: viable.then(|| Value::String(format!("out{index}"))),
            error: (!viable).then(|| "boom".to_string()),
            tokens_in: 10,
            tokens_out: 5,
            cost,
        }
    }

    #[test]
    fn pareto_frontier_drops_dominated_points() {
        let runs = vec![run(0, 1.0, true), run(1, 2.0, true), run(2, 0.5, true)];
        let scores = vec![3.0, 2.0, 3.0];
        // Candidate 1 is dominated by 0 (better score, lower cost) and 2.
        // Candidate 0 is dominated by 2 (equal score, lower cost).
        let frontier = pareto_frontier(&[0, 1, 2], &scores, &runs);
        assert_eq!(frontier, vec![2]);
    }

    #[test]
    fn pareto_frontier_keeps_tradeoff_points() {
        let runs = vec![run(0, 0.1, true), run(1, 1.0, true)];
        let scores = vec![1.0, 5.0]; // cheap-but-weak vs strong-but-costly
        let frontier = pareto_frontier(&[0, 1], &scores, &runs);
        assert_eq!(frontier, vec![0, 1]);
    }
}
