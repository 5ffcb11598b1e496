//! Typed error hierarchy for the cascade engine.
//!
//! Three top-level enums cover the three failure scopes:
//! - `LoadError` — cascade parsing and validation, before execution starts
//! - `PhaseError` — failures inside a single phase execution
//! - `CascadeError` — session-level failures that terminate a run

use thiserror::Error;

/// A single validation finding from the loader.
///
/// `rule` is a stable machine-readable identifier (e.g. `duplicate_phase_name`);
/// `message` is the human explanation. The same shape carries hard errors
/// (from `validate`) and warnings (from `lint`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub rule: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Errors from loading a cascade definition.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read cascade file at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse cascade definition: {detail}")]
    Parse { detail: String },

    #[error("Cascade definition is invalid ({} issue(s)): {}", issues.len(), format_issues(issues))]
    Invalid { issues: Vec<ValidationIssue> },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Category of a failed tool invocation.
///
/// Transient errors are retried with backoff inside the phase loop;
/// permanent and fatal errors are raised to the phase immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Transient,
    Permanent,
    Fatal,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolErrorKind::Transient => write!(f, "transient"),
            ToolErrorKind::Permanent => write!(f, "permanent"),
            ToolErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase}: unresolved placeholder in instructions: {detail}")]
    PromptRender { phase: String, detail: String },

    #[error("Phase {phase}: output extraction failed: {detail}")]
    Extraction { phase: String, detail: String },

    #[error("Phase {phase}: turn limit of {max_turns} reached without terminal response")]
    TurnLimitExceeded { phase: String, max_turns: u32 },

    #[error("Phase {phase}: wall-clock timeout of {timeout_ms}ms elapsed")]
    Timeout { phase: String, timeout_ms: u64 },

    #[error("Tool {tool} failed ({kind}): {message}")]
    ToolCall {
        tool: String,
        kind: ToolErrorKind,
        message: String,
    },

    #[error("Phase {phase}: rejected by wards after retries: {feedback}")]
    WardReject { phase: String, feedback: String },

    #[error("Phase {phase}: ward rejection is fatal: {feedback}")]
    WardFatal { phase: String, feedback: String },

    #[error("Phase {phase}: all {count} candidates failed")]
    AllCandidatesFailed { phase: String, count: usize },

    #[error("Phase {phase}: context estimate {estimate} tokens cannot be reduced under limit {limit}")]
    BudgetOverflow {
        phase: String,
        estimate: u64,
        limit: u64,
    },

    #[error("Provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("Execution cancelled")]
    Cancelled,
}

impl PhaseError {
    /// Stable snake_case kind identifier, used in `error` trace events and
    /// in the session error list.
    pub fn kind(&self) -> &'static str {
        match self {
            PhaseError::PromptRender { .. } => "prompt_render",
            PhaseError::Extraction { .. } => "extraction",
            PhaseError::TurnLimitExceeded { .. } => "turn_limit_exceeded",
            PhaseError::Timeout { .. } => "phase_timeout",
            PhaseError::ToolCall { .. } => "tool_call",
            PhaseError::WardReject { .. } => "ward_reject",
            PhaseError::WardFatal { .. } => "ward_fatal",
            PhaseError::AllCandidatesFailed { .. } => "all_candidates_failed",
            PhaseError::BudgetOverflow { .. } => "budget_overflow",
            PhaseError::Provider { .. } => "provider",
            PhaseError::Cancelled => "cancelled",
        }
    }

    /// Whether `retry_on_failure` may recover this error by re-running the
    /// phase. Fatal-by-contract kinds (an unresolved placeholder, an
    /// irreducible context, a fatal ward or tool, cancellation) are not
    /// retriable no matter what the phase policy says.
    pub fn is_retriable(&self) -> bool {
        match self {
            PhaseError::Extraction { .. }
            | PhaseError::TurnLimitExceeded { .. }
            | PhaseError::Timeout { .. }
            | PhaseError::WardReject { .. }
            | PhaseError::AllCandidatesFailed { .. } => true,
            PhaseError::ToolCall { kind, .. } => *kind == ToolErrorKind::Transient,
            PhaseError::Provider { transient, .. } => *transient,
            PhaseError::PromptRender { .. }
            | PhaseError::WardFatal { .. }
            | PhaseError::BudgetOverflow { .. }
            | PhaseError::Cancelled => false,
        }
    }
}

/// Errors that terminate a session.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Unknown cascade id: {id}")]
    UnknownCascade { id: String },

    #[error("Phase {phase} failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: PhaseError,
    },

    #[error("Handoff limit reached after {executions} phase executions")]
    HandoffLimit { executions: u32 },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Session cancelled")]
    Cancelled,
}

impl CascadeError {
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeError::UnknownCascade { .. } => "unknown_cascade",
            CascadeError::Phase { source, .. } => source.kind(),
            CascadeError::HandoffLimit { .. } => "handoff_limit",
            CascadeError::Load(_) => "load",
            CascadeError::Cancelled => "cancelled",
        }
    }
}
