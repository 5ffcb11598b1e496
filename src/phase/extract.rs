//! Output extraction: turning a finished turn loop into the phase's value.

use super::window::MessageWindow;
use crate::cascade::{ExtractionMode, OutputExtractionConfig};
use crate::errors::PhaseError;
use regex::Regex;
use serde_json::Value;

/// Results of tool calls made during the attempt, in invocation order.
pub type ToolResults = Vec<(String, Value)>;

/// Extract the phase output per the configured mode.
pub fn extract_output(
    config: &OutputExtractionConfig,
    window: &MessageWindow,
    tool_results: &ToolResults,
    phase: &str,
) -> Result<Value, PhaseError> {
    match config.mode {
        ExtractionMode::LastAssistantText => window
            .last_assistant_text()
            .map(|text| Value::String(text.to_string()))
            .ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: "no assistant text produced".to_string(),
            }),

        ExtractionMode::JsonBlock => {
            let text = window.last_assistant_text().ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: "no assistant text to extract a JSON block from".to_string(),
            })?;
            extract_json_block(text).ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: "no parseable JSON block in the final response".to_string(),
            })
        }

        ExtractionMode::Regex => {
            let pattern = config.pattern.as_deref().ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: "regex extraction requires a pattern".to_string(),
            })?;
            let re = Regex::new(pattern).map_err(|e| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: format!("invalid extraction pattern: {e}"),
            })?;
            let text = window.last_assistant_text().ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: "no assistant text to match against".to_string(),
            })?;
            let captures = re.captures(text).ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: format!("pattern `{pattern}` matched nothing"),
            })?;
            let matched = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Ok(Value::String(matched))
        }

        ExtractionMode::ToolResult => {
            let tool = config.tool.as_deref().ok_or_else(|| PhaseError::Extraction {
                phase: phase.to_string(),
                detail: "tool_result extraction requires a tool name".to_string(),
            })?;
            tool_results
                .iter()
                .rev()
                .find(|(name, _)| name == tool)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| PhaseError::Extraction {
                    phase: phase.to_string(),
                    detail: format!("tool `{tool}` was never called in this phase"),
                })
        }
    }
}

/// Find the last parseable JSON object or array in `text`: a fenced block
/// if present, otherwise the bare text, otherwise the outermost brace
/// span. Shared with ward envelope and evaluator ranking parsing.
pub fn extract_json_block(text: &str) -> Option<Value> {
    let mut last_parsed = None;
    for block in fenced_blocks(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            if value.is_object() || value.is_array() {
                last_parsed = Some(value);
            }
        }
    }
    if last_parsed.is_some() {
        return last_parsed;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text.trim())
        && (value.is_object() || value.is_array())
    {
        return Some(value);
    }

    let start = text.find(['{', '['])?;
    let end = text.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(text[start..=end].trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Contents of ``` fenced blocks, language tag stripped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let mut block = &after_open[..close];
        // Strip a language tag on the opening line ("json", "yaml", ...).
        if let Some(newline) = block.find('\n') {
            let tag = block[..newline].trim();
            if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric()) {
                block = &block[newline + 1..];
            }
        }
        blocks.push(block);
        rest = &after_open[close + 3..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use serde_json::json;

    fn window_with(text: &str) -> MessageWindow {
        let mut window = MessageWindow::new();
        window.push(ChatMessage::system("sys"));
        window.push(ChatMessage::assistant(text));
        window
    }

    fn config(mode: ExtractionMode) -> OutputExtractionConfig {
        OutputExtractionConfig {
            mode,
            pattern: None,
            tool: None,
        }
    }

    #[test]
    fn last_assistant_text_is_default() {
        let window = window_with("final answer");
        let out = extract_output(&config(ExtractionMode::LastAssistantText), &window, &vec![], "p")
            .unwrap();
        assert_eq!(out, json!("final answer"));
    }

    #[test]
    fn json_block_parses_fenced_payload() {
        let window = window_with("Here you go:\n```json\n{\"score\": 9}\n```\nDone.");
        let out = extract_output(&config(ExtractionMode::JsonBlock), &window, &vec![], "p").unwrap();
        assert_eq!(out, json!({"score": 9}));
    }

    #[test]
    fn json_block_takes_the_last_fenced_block() {
        let text = "```json\n{\"draft\": 1}\n```\ntext\n```json\n{\"final\": 2}\n```";
        assert_eq!(extract_json_block(text), Some(json!({"final": 2})));
    }

    #[test]
    fn json_block_falls_back_to_bare_braces() {
        let window = window_with("The result is {\"ok\": true} as requested.");
        let out = extract_output(&config(ExtractionMode::JsonBlock), &window, &vec![], "p").unwrap();
        assert_eq!(out, json!({"ok": true}));
    }

    #[test]
    fn json_block_missing_is_extraction_error() {
        let window = window_with("no structured payload here");
        let err =
            extract_output(&config(ExtractionMode::JsonBlock), &window, &vec![], "p").unwrap_err();
        assert_eq!(err.kind(), "extraction");
    }

    #[test]
    fn regex_prefers_first_capture_group() {
        let window = window_with("ANSWER: 42 (confidence high)");
        let mut cfg = config(ExtractionMode::Regex);
        cfg.pattern = Some(r"ANSWER: (\d+)".to_string());
        let out = extract_output(&cfg, &window, &vec![], "p").unwrap();
        assert_eq!(out, json!("42"));
    }

    #[test]
    fn regex_without_match_fails() {
        let window = window_with("nothing numeric");
        let mut cfg = config(ExtractionMode::Regex);
        cfg.pattern = Some(r"ANSWER: (\d+)".to_string());
        assert!(extract_output(&cfg, &window, &vec![], "p").is_err());
    }

    #[test]
    fn tool_result_returns_last_invocation() {
        let window = window_with("done");
        let mut cfg = config(ExtractionMode::ToolResult);
        cfg.tool = Some("lookup".to_string());
        let results = vec![
            ("lookup".to_string(), json!(1)),
            ("other".to_string(), json!(2)),
            ("lookup".to_string(), json!(3)),
        ];
        let out = extract_output(&cfg, &window, &results, "p").unwrap();
        assert_eq!(out, json!(3));
    }

    #[test]
    fn tool_result_for_uncalled_tool_fails() {
        let window = window_with("done");
        let mut cfg = config(ExtractionMode::ToolResult);
        cfg.tool = Some("lookup".to_string());
        let err = extract_output(&cfg, &window, &vec![], "p").unwrap_err();
        assert!(err.to_string().contains("never called"));
    }
}
