//! Skill (tool) contract and registry.
//!
//! A skill is a callable capability exposed to the agent inside a phase.
//! The engine only knows the descriptor/invocation contract; declarative
//! loaders (shell, HTTP, composite) live outside and wrap into the same
//! trait. `FnSkill` adapts a plain function, which is how application code
//! and tests register capabilities.

use crate::errors::ToolErrorKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Transient invocation failures are retried this many times in total.
const MAX_TOOL_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

/// The capability descriptor handed to the provider alongside a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    /// Pure skills have no side effects; multiple pure calls requested in
    /// one assistant turn may run concurrently.
    #[serde(default)]
    pub is_pure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SkillDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: Value::Null,
            is_pure: false,
            timeout_ms: None,
        }
    }

    pub fn with_schema(mut self, input_schema: Value) -> Self {
        self.input_schema = input_schema;
        self
    }

    pub fn pure(mut self) -> Self {
        self.is_pure = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct SkillError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl SkillError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Fatal,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn descriptor(&self) -> &SkillDescriptor;
    async fn invoke(&self, inputs: Value) -> Result<Value, SkillError>;
}

/// Adapter wrapping a plain function into the skill contract.
pub struct FnSkill {
    descriptor: SkillDescriptor,
    func: Box<dyn Fn(Value) -> Result<Value, SkillError> + Send + Sync>,
}

impl FnSkill {
    pub fn new<F>(descriptor: SkillDescriptor, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, SkillError> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Skill for FnSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, inputs: Value) -> Result<Value, SkillError> {
        (self.func)(inputs)
    }
}

/// Named skills available to the runtime. Phases reference entries by name
/// through their `skills` list.
#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Arc<dyn Skill>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, skill: Arc<dyn Skill>) {
        let name = skill.descriptor().name.clone();
        self.skills.write().insert(name, skill);
    }

    /// Register a function-backed skill in one call.
    pub fn register_fn<F>(&self, descriptor: SkillDescriptor, func: F)
    where
        F: Fn(Value) -> Result<Value, SkillError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnSkill::new(descriptor, func)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a phase's skill list into descriptors for the provider.
    /// Unknown names are reported together, not one at a time.
    pub fn descriptors_for(&self, names: &[String]) -> Result<Vec<SkillDescriptor>, Vec<String>> {
        let skills = self.skills.read();
        let mut descriptors = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match skills.get(name) {
                Some(skill) => descriptors.push(skill.descriptor().clone()),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(descriptors)
        } else {
            Err(missing)
        }
    }
}

/// Invoke a skill under its timeout and the engine's transient-retry
/// policy. A per-tool timeout counts as a transient failure; retries back
/// off exponentially and give up after `MAX_TOOL_ATTEMPTS`.
pub async fn invoke_with_policy(
    skill: &Arc<dyn Skill>,
    inputs: Value,
    cancel: &CancellationToken,
) -> Result<Value, SkillError> {
    let name = skill.descriptor().name.clone();
    let timeout = skill.descriptor().timeout_ms.map(Duration::from_millis);

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let invocation = skill.invoke(inputs.clone());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SkillError::fatal("cancelled")),
            result = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, invocation)
                        .await
                        .unwrap_or_else(|_| Err(SkillError::transient(format!(
                            "tool {name} timed out after {}ms",
                            limit.as_millis()
                        )))),
                    None => invocation.await,
                }
            } => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(error) if error.kind == ToolErrorKind::Transient && attempt < MAX_TOOL_ATTEMPTS => {
                let delay = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                tracing::debug!(tool = %name, attempt, error = %error, "transient tool failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo_skill() -> Arc<dyn Skill> {
        Arc::new(FnSkill::new(
            SkillDescriptor::new("echo", "Echo inputs back").pure(),
            |inputs| Ok(inputs),
        ))
    }

    #[test]
    fn registry_resolves_descriptors_and_reports_missing() {
        let registry = SkillRegistry::new();
        registry.register(echo_skill());

        let ok = registry
            .descriptors_for(&["echo".to_string()])
            .expect("echo is registered");
        assert_eq!(ok.len(), 1);
        assert!(ok[0].is_pure);

        let missing = registry
            .descriptors_for(&["echo".to_string(), "nope".to_string(), "also_nope".to_string()])
            .unwrap_err();
        assert_eq!(missing, vec!["nope".to_string(), "also_nope".to_string()]);
    }

    #[tokio::test]
    async fn fn_skill_invokes_closure() {
        let skill = echo_skill();
        let out = skill.invoke(json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillDescriptor::new("flaky", "Fails twice then succeeds"),
            |_| {
                if CALLS.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SkillError::transient("503"))
                } else {
                    Ok(json!("recovered"))
                }
            },
        ));

        let cancel = CancellationToken::new();
        let out = invoke_with_policy(&skill, Value::Null, &cancel).await.unwrap();
        assert_eq!(out, json!("recovered"));
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillDescriptor::new("broken", "Always fails hard"),
            |_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Err(SkillError::permanent("bad arguments"))
            },
        ));

        let cancel = CancellationToken::new();
        let err = invoke_with_policy(&skill, Value::Null, &cancel).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_invocation() {
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillDescriptor::new("slow", "Never used"),
            |_| Ok(Value::Null),
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = invoke_with_policy(&skill, Value::Null, &cancel).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Fatal);
    }
}
