//! Cascade definition loading and static validation.
//!
//! Two equivalent surface forms, object notation (JSON) and indented
//! tabular notation (YAML), parse to the same `CascadeConfig` tree. Hard
//! rule violations are aggregated and returned together; the engine
//! refuses to execute an invalid cascade. `lint` reports warnings
//! (unknown keys, unused inputs, ignored settings) and never fails.

use super::{CascadeConfig, PhaseConfig};
use crate::errors::{LoadError, ValidationIssue};
use crate::template;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Json,
    Yaml,
}

/// Load, parse, and validate a cascade definition from disk. The file
/// extension picks the parser; anything that is not `.json` is treated as
/// YAML (a JSON document still parses, YAML being a superset).
pub fn load_path(path: &Path) -> Result<CascadeConfig, LoadError> {
    let source = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some(SourceFormat::Json),
        Some("yaml") | Some("yml") => Some(SourceFormat::Yaml),
        _ => None,
    };
    load_str(&source, format)
}

/// Parse and validate a cascade definition from a string.
pub fn load_str(source: &str, format: Option<SourceFormat>) -> Result<CascadeConfig, LoadError> {
    let config = parse_str(source, format)?;
    let issues = validate(&config);
    if issues.is_empty() {
        Ok(config)
    } else {
        Err(LoadError::Invalid { issues })
    }
}

/// Parse without validating. With no format hint, a document whose first
/// non-blank character is `{` is read as JSON, everything else as YAML.
pub fn parse_str(source: &str, format: Option<SourceFormat>) -> Result<CascadeConfig, LoadError> {
    let format = format.unwrap_or_else(|| {
        if source.trim_start().starts_with('{') {
            SourceFormat::Json
        } else {
            SourceFormat::Yaml
        }
    });
    match format {
        SourceFormat::Json => serde_json::from_str(source).map_err(|e| LoadError::Parse {
            detail: e.to_string(),
        }),
        SourceFormat::Yaml => serde_yaml::from_str(source).map_err(|e| LoadError::Parse {
            detail: e.to_string(),
        }),
    }
}

/// Names a phase's instruction template may legally reference: the
/// reserved keys, declared inputs, and every *preceding* phase.
fn known_roots(config: &CascadeConfig, phase_index: usize) -> BTreeSet<String> {
    let mut roots: BTreeSet<String> = ["input".to_string(), "state".to_string()].into();
    roots.extend(config.inputs_schema.keys().cloned());
    for phase in &config.phases[..phase_index] {
        roots.insert(phase.name.clone());
    }
    roots
}

/// Statically checkable hard rules. All violations are reported together.
pub fn validate(config: &CascadeConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if config.cascade_id.trim().is_empty() {
        issues.push(ValidationIssue::new(
            "missing_cascade_id",
            "cascade_id must be present and non-empty",
        ));
    }

    if config.phases.is_empty() {
        issues.push(ValidationIssue::new("no_phases", "cascade defines no phases"));
    }

    let mut seen = BTreeSet::new();
    for phase in &config.phases {
        if !seen.insert(phase.name.as_str()) {
            issues.push(ValidationIssue::new(
                "duplicate_phase_name",
                format!("phase `{}` is defined more than once", phase.name),
            ));
        }
    }

    let all_names: BTreeSet<&str> = config.phases.iter().map(|p| p.name.as_str()).collect();

    for (index, phase) in config.phases.iter().enumerate() {
        validate_phase(config, index, phase, &all_names, &mut issues);
    }

    if let Some(budget) = &config.token_budget
        && budget.limit == 0
    {
        issues.push(ValidationIssue::new(
            "budget_limit",
            "token_budget.limit must be greater than zero",
        ));
    }

    issues
}

fn validate_phase(
    config: &CascadeConfig,
    index: usize,
    phase: &PhaseConfig,
    all_names: &BTreeSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    let name = &phase.name;

    if let Some(retry) = &phase.rules.retry_on_failure
        && let Some(target) = &retry.target_phase
        && !all_names.contains(target.as_str())
    {
        issues.push(ValidationIssue::new(
            "unknown_target_phase",
            format!("phase `{name}`: retry_on_failure.target_phase `{target}` does not exist"),
        ));
    }

    if let Some(handoff) = &phase.handoff
        && !all_names.contains(handoff.target_phase.as_str())
    {
        issues.push(ValidationIssue::new(
            "unknown_handoff_target",
            format!(
                "phase `{name}`: handoff.target_phase `{}` does not exist",
                handoff.target_phase
            ),
        ));
    }

    if let Some(scope) = &phase.rules.context_scope {
        for entry in scope {
            if entry != "input" && !all_names.contains(entry.as_str()) {
                issues.push(ValidationIssue::new(
                    "unknown_context_scope",
                    format!("phase `{name}`: context_scope entry `{entry}` does not exist"),
                ));
            }
        }
    }

    if let Some(candidates) = &phase.candidates {
        if candidates.count < 1 {
            issues.push(ValidationIssue::new(
                "candidate_count",
                format!("phase `{name}`: candidates.count must be at least 1"),
            ));
        }
        if let Some(cost_aware) = &candidates.cost_aware
            && cost_aware.scalarize.is_some()
            && cost_aware.pareto.is_some()
        {
            issues.push(ValidationIssue::new(
                "both_cost_aware_modes",
                format!(
                    "phase `{name}`: cost_aware.scalarize and cost_aware.pareto are mutually exclusive"
                ),
            ));
        }
    }

    if let Some(wards) = &phase.wards {
        if wards.wards.is_empty() {
            issues.push(ValidationIssue::new(
                "empty_wards",
                format!("phase `{name}`: wards block lists no wards"),
            ));
        }
        for (ward_index, ward) in wards.wards.iter().enumerate() {
            let configured = ward.prompt.is_some() as u8 + ward.cascade.is_some() as u8;
            if configured != 1 {
                issues.push(ValidationIssue::new(
                    "ward_kind",
                    format!(
                        "phase `{name}`: ward `{}` must set exactly one of `prompt` or `cascade`",
                        ward.label(ward_index)
                    ),
                ));
            }
        }
    }

    let known = known_roots(config, index);
    for root in template::referenced_roots(&phase.instructions) {
        if !known.contains(&root) {
            issues.push(ValidationIssue::new(
                "unknown_placeholder",
                format!(
                    "phase `{name}`: instructions reference `{root}`, which is not an input, \
                     reserved key, or preceding phase"
                ),
            ));
        }
    }
}

/// Non-fatal findings. Safe to run on an invalid document.
pub fn lint(config: &CascadeConfig) -> Vec<ValidationIssue> {
    let mut warnings = Vec::new();

    for key in config.extra.keys() {
        warnings.push(ValidationIssue::new(
            "unknown_key",
            format!("unknown top-level key `{key}` is ignored"),
        ));
    }

    for (field, present) in [
        ("rag", config.rag.is_some()),
        ("audible", config.audible.is_some()),
        ("callouts", config.callouts.is_some()),
    ] {
        if present {
            warnings.push(ValidationIssue::new(
                "external_setting",
                format!("`{field}` is owned by an external subsystem and ignored by the engine"),
            ));
        }
    }

    let mut referenced = BTreeSet::new();
    for phase in &config.phases {
        referenced.extend(template::referenced_roots(&phase.instructions));
    }
    for input in config.inputs_schema.keys() {
        if !referenced.contains(input) && !referenced.contains("input") {
            warnings.push(ValidationIssue::new(
                "unused_input",
                format!("declared input `{input}` is never referenced by any phase"),
            ));
        }
    }

    for phase in &config.phases {
        for key in phase.extra.keys() {
            warnings.push(ValidationIssue::new(
                "unknown_key",
                format!("phase `{}`: unknown key `{key}` is ignored", phase.name),
            ));
        }
        if template::uses_extensions(&phase.instructions) {
            warnings.push(ValidationIssue::new(
                "template_extension",
                format!(
                    "phase `{}`: instructions use template constructs beyond substitution",
                    phase.name
                ),
            ));
        }
        if phase.sub_cascade.is_some() && phase.candidates.is_some() {
            warnings.push(ValidationIssue::new(
                "conflicting_blocks",
                format!(
                    "phase `{}`: sub_cascade takes precedence, candidates block is ignored",
                    phase.name
                ),
            ));
        }
        let ward_refs = phase
            .wards
            .iter()
            .flat_map(|w| w.wards.iter())
            .filter_map(|w| w.cascade.as_ref());
        for reference in [
            phase.sub_cascade.as_ref().map(|s| &s.cascade),
            phase.async_cascade.as_ref().map(|a| &a.cascade),
        ]
        .into_iter()
        .flatten()
        .chain(ward_refs)
        {
            warnings.push(ValidationIssue::new(
                "runtime_cascade_ref",
                format!(
                    "phase `{}`: cascade `{reference}` is resolved at run time against the registry",
                    phase.name
                ),
            ));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_json() -> String {
        json!({
            "cascade_id": "review_flow",
            "inputs_schema": {"topic": "What to write about"},
            "phases": [
                {"name": "draft", "instructions": "Write about {{ input.topic }}"},
                {
                    "name": "polish",
                    "instructions": "Improve this: {{ draft }}",
                    "rules": {"retry_on_failure": {"max_retries": 2, "target_phase": "draft"}}
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn loads_valid_json() {
        let config = load_str(&valid_json(), Some(SourceFormat::Json)).unwrap();
        assert_eq!(config.cascade_id, "review_flow");
        assert_eq!(config.phases.len(), 2);
    }

    #[test]
    fn json_and_yaml_parse_to_the_same_tree() {
        let from_json = load_str(&valid_json(), None).unwrap();
        let yaml = serde_yaml::to_string(&from_json).unwrap();
        let from_yaml = load_str(&yaml, None).unwrap();
        assert_eq!(from_json, from_yaml);
    }

    #[test]
    fn round_trips_through_both_formats() {
        let config = load_str(&valid_json(), None).unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let back: CascadeConfig = parse_str(&json, Some(SourceFormat::Json)).unwrap();
        assert_eq!(back, config);

        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: CascadeConfig = parse_str(&yaml, Some(SourceFormat::Yaml)).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn aggregates_all_violations() {
        let source = json!({
            "cascade_id": "",
            "phases": [
                {"name": "a", "instructions": "{{ nonexistent }}"},
                {"name": "a", "instructions": "dup name"},
                {
                    "name": "b",
                    "instructions": "ok",
                    "rules": {"retry_on_failure": {"target_phase": "ghost"}},
                    "candidates": {"count": 0}
                }
            ]
        })
        .to_string();

        let err = load_str(&source, None).unwrap_err();
        let issues = match err {
            LoadError::Invalid { issues } => issues,
            other => panic!("expected Invalid, got {other:?}"),
        };
        let rules: Vec<&str> = issues.iter().map(|i| i.rule.as_str()).collect();
        assert!(rules.contains(&"missing_cascade_id"));
        assert!(rules.contains(&"duplicate_phase_name"));
        assert!(rules.contains(&"unknown_placeholder"));
        assert!(rules.contains(&"unknown_target_phase"));
        assert!(rules.contains(&"candidate_count"));
    }

    #[test]
    fn placeholder_may_reference_preceding_phase_only() {
        let source = json!({
            "cascade_id": "c",
            "phases": [
                {"name": "first", "instructions": "uses {{ second }}"},
                {"name": "second", "instructions": "uses {{ first }}"}
            ]
        })
        .to_string();

        let config = parse_str(&source, None).unwrap();
        let issues = validate(&config);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, "unknown_placeholder");
        assert!(issues[0].message.contains("`second`"));
    }

    #[test]
    fn both_cost_aware_modes_is_a_load_error() {
        let source = json!({
            "cascade_id": "c",
            "phases": [{
                "name": "a",
                "instructions": "go",
                "candidates": {
                    "count": 2,
                    "cost_aware": {"scalarize": {"lambda": 0.5}, "pareto": {"lambda": 0.1}}
                }
            }]
        })
        .to_string();

        let err = load_str(&source, None).unwrap_err();
        assert!(err.to_string().contains("both_cost_aware_modes"));
    }

    #[test]
    fn ward_must_be_inline_or_cascade() {
        let source = json!({
            "cascade_id": "c",
            "phases": [{
                "name": "a",
                "instructions": "go",
                "wards": {"wards": [{"name": "nothing_set"}]}
            }]
        })
        .to_string();

        let err = load_str(&source, None).unwrap_err();
        assert!(err.to_string().contains("ward_kind"));
    }

    #[test]
    fn zero_budget_limit_rejected() {
        let source = json!({
            "cascade_id": "c",
            "token_budget": {"limit": 0},
            "phases": [{"name": "a", "instructions": "go"}]
        })
        .to_string();

        let err = load_str(&source, None).unwrap_err();
        assert!(err.to_string().contains("budget_limit"));
    }

    #[test]
    fn lint_flags_unknown_and_external_keys_without_failing() {
        let source = json!({
            "cascade_id": "c",
            "rag": {"collection": "docs"},
            "mystery": 1,
            "inputs_schema": {"unused_topic": "never referenced"},
            "phases": [{"name": "a", "instructions": "{% if x %}hi{% endif %}"}]
        })
        .to_string();

        let config = parse_str(&source, None).unwrap();
        let warnings = lint(&config);
        let rules: Vec<&str> = warnings.iter().map(|i| i.rule.as_str()).collect();
        assert!(rules.contains(&"unknown_key"));
        assert!(rules.contains(&"external_setting"));
        assert!(rules.contains(&"unused_input"));
        assert!(rules.contains(&"template_extension"));
        // Unknown keys are lint findings, never validation errors.
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn load_path_picks_parser_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("flow.json");
        std::fs::write(&json_path, valid_json()).unwrap();
        assert!(load_path(&json_path).is_ok());

        let yaml_path = dir.path().join("flow.yaml");
        let config = load_str(&valid_json(), None).unwrap();
        std::fs::write(&yaml_path, serde_yaml::to_string(&config).unwrap()).unwrap();
        assert_eq!(load_path(&yaml_path).unwrap(), config);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_path(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
