//! Instruction template rendering.
//!
//! Phase instructions, tool argument templates, and loop conditions are all
//! text bodies with `{{ placeholder }}` references resolved against session
//! state. The `Template` trait is the seam; the default implementation is
//! tera-backed, which gives dotted access (`{{ input.name }}`) and the
//! small filter set the engine guarantees (`default`, `length`,
//! `json_encode`). Anything beyond plain substitution (blocks, loops) still
//! renders but is flagged by the loader's lint pass.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{detail}")]
pub struct TemplateError {
    pub detail: String,
}

impl TemplateError {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// A renderable text body.
pub trait Template: Send + Sync {
    fn render(&self, values: &Value) -> Result<String, TemplateError>;
}

/// Default tera-backed template.
pub struct TeraTemplate {
    source: String,
}

impl TeraTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Template for TeraTemplate {
    fn render(&self, values: &Value) -> Result<String, TemplateError> {
        let mut tera = tera::Tera::default();
        tera.add_raw_template("inline", &self.source)
            .map_err(|e| TemplateError::new(flatten_tera(&e)))?;
        let context = tera::Context::from_value(values.clone())
            .map_err(|e| TemplateError::new(flatten_tera(&e)))?;
        tera.render("inline", &context)
            .map_err(|e| TemplateError::new(flatten_tera(&e)))
    }
}

/// Tera nests the useful message one level down; surface the whole chain.
fn flatten_tera(e: &tera::Error) -> String {
    let mut parts = vec![e.to_string()];
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

/// Render a template and return the result, the common one-shot path.
pub fn render(source: &str, values: &Value) -> Result<String, TemplateError> {
    TeraTemplate::new(source).render(values)
}

/// Evaluate a boolean condition template (`loop_until`, `handoff.when`).
/// The rendered text is truthy when it trims to `true`, `yes`, or `1`.
pub fn eval_condition(source: &str, values: &Value) -> Result<bool, TemplateError> {
    let rendered = render(source, values)?;
    Ok(matches!(
        rendered.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1"
    ))
}

static PLACEHOLDER_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[-\s]*([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"));

/// Root identifiers referenced by `{{ ... }}` expressions, for static
/// validation. Dotted paths report their first segment (`input.name` →
/// `input`); string literals and numbers are not identifiers and do not
/// match.
pub fn referenced_roots(source: &str) -> BTreeSet<String> {
    PLACEHOLDER_ROOT
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect()
}

/// Whether the template uses constructs beyond variable substitution
/// (`{% if %}`, `{% for %}`, ...). These render fine but are outside the
/// guaranteed feature set, so the loader lints them.
pub fn uses_extensions(source: &str) -> bool {
    source.contains("{%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_dotted_access() {
        let out = render(
            "Say hello to {{ input.name }}!",
            &json!({"input": {"name": "World"}}),
        )
        .unwrap();
        assert_eq!(out, "Say hello to World!");
    }

    #[test]
    fn renders_phase_output_reference() {
        let out = render(
            "Previous draft: {{ draft }}",
            &json!({"draft": "a poem about rust"}),
        )
        .unwrap();
        assert_eq!(out, "Previous draft: a poem about rust");
    }

    #[test]
    fn default_filter_covers_missing_values() {
        let out = render("{{ tone | default(value='neutral') }}", &json!({})).unwrap();
        assert_eq!(out, "neutral");
    }

    #[test]
    fn json_encode_filter_serializes_values() {
        let out = render(
            "{{ input | json_encode() }}",
            &json!({"input": {"k": 1}}),
        )
        .unwrap();
        assert_eq!(out, "{\"k\":1}");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let err = render("{{ missing_key }}", &json!({"other": 1})).unwrap_err();
        assert!(err.detail.contains("missing_key"), "got: {}", err.detail);
    }

    #[test]
    fn referenced_roots_reports_first_segments() {
        let roots = referenced_roots(
            "Hi {{ input.name }}, context: {{ state.notes }} and {{ draft | length }}.",
        );
        let expected: Vec<&str> = vec!["draft", "input", "state"];
        assert_eq!(roots.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn referenced_roots_ignores_literals() {
        let roots = referenced_roots("{{ \"quoted\" }} {{ 42 }}");
        assert!(roots.is_empty());
    }

    #[test]
    fn eval_condition_truthiness() {
        let values = json!({"done": "true", "count": 3});
        assert!(eval_condition("{{ done }}", &values).unwrap());
        assert!(!eval_condition("{{ count }}", &values).unwrap());
        assert!(!eval_condition("no", &values).unwrap());
        assert!(eval_condition("YES", &values).unwrap());
    }

    #[test]
    fn uses_extensions_detects_blocks() {
        assert!(uses_extensions("{% if x %}y{% endif %}"));
        assert!(!uses_extensions("plain {{ x }}"));
    }
}
