//! ToolRouter: ranks catalog tools against a user utterance and executes
//! the ones a model response asks for.
//!
//! It handles:
//! - Relevance scoring (keyword, category and per-tool trigger words)
//! - Suggestion filtering and ordering
//! - Explicit `[TOOL_USE:name:{json}]` markers in model output
//! - Arithmetic auto-detection when the model did not ask for a tool
//!
//! Scores are computed in integer tenths so equal inputs always produce
//! identical rankings.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::mcp_client::session::ToolCall;
use crate::mcp_client::types::{ToolCallResult, ToolDescriptor};
use crate::mcp_client::McpSession;

use super::types::{ToolExecution, ToolSuggestion, ToolUseMarker};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Per utterance token found in the tool's name or description.
const KEYWORD_TENTHS: u32 = 3;

/// Per utterance token found in the tool's category.
const CATEGORY_TENTHS: u32 = 2;

/// Per utterance token found in the tool's trigger words.
const TRIGGER_TENTHS: u32 = 5;

const MAX_TENTHS: u32 = 10;

/// Suggestions must score strictly above this.
const MIN_RELEVANCE_TENTHS: u32 = 3;

const ARITHMETIC_TOOL: &str = "add_numbers";

static ARITHMETIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:\+|add|plus)\s*(\d+)").expect("Invalid arithmetic pattern")
});

static TOOL_USE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[TOOL_USE:(\w+):(\{.*?\})\]").expect("Invalid tool use pattern")
});

/// Words that strongly suggest a specific well-known tool.
fn trigger_words(tool_name: &str) -> &'static [&'static str] {
    match tool_name {
        "echo" => &["echo", "repeat", "say", "output"],
        "add_numbers" => &["add", "sum", "plus", "calculate", "math", "+", "addition"],
        "get_time" => &["time", "date", "now", "current"],
        "reverse_text" => &["reverse", "backward", "flip"],
        "generate_uuid" => &["uuid", "id", "unique", "identifier"],
        "hash_text" => &["hash", "encrypt", "sha", "checksum"],
        "generate_qr_code" => &["qr", "code", "barcode", "scan"],
        "password_generator" => &["password", "generate", "secure", "random"],
        "color_converter" => &["color", "hex", "rgb", "convert"],
        "text_analyzer" => &["analyze", "text", "count", "words", "statistics"],
        _ => &[],
    }
}

// ─── Scoring ────────────────────────────────────────────────────────────────

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn count_matches(words: &[String], matches: impl Fn(&str) -> bool) -> u32 {
    words.iter().filter(|w| matches(w.as_str())).count() as u32
}

/// Relevance of `tool` to `utterance` in tenths, clamped to `0..=10`.
///
/// Every utterance token is counted, repeats included.
pub fn score_tenths(utterance: &str, tool: &ToolDescriptor) -> u32 {
    let words = tokens(utterance);
    let tool_words = tokens(&format!("{} {}", tool.name, tool.description));
    let category_words = tool.category.as_deref().map(tokens).unwrap_or_default();
    let triggers = trigger_words(&tool.name);

    let keyword = count_matches(&words, |w| tool_words.iter().any(|t| t == w));
    let category = count_matches(&words, |w| category_words.iter().any(|c| c == w));
    let trigger = count_matches(&words, |w| triggers.iter().any(|t| *t == w));

    (keyword * KEYWORD_TENTHS + category * CATEGORY_TENTHS + trigger * TRIGGER_TENTHS)
        .min(MAX_TENTHS)
}

/// Relevance in `[0, 1]`.
pub fn score(utterance: &str, tool: &ToolDescriptor) -> f64 {
    f64::from(score_tenths(utterance, tool)) / 10.0
}

/// Tools scoring above 0.3, best first. Ties keep catalog order.
pub fn suggest(utterance: &str, tools: &[ToolDescriptor]) -> Vec<ToolSuggestion> {
    let mut scored: Vec<(u32, &ToolDescriptor)> = tools
        .iter()
        .map(|tool| (score_tenths(utterance, tool), tool))
        .filter(|(tenths, _)| *tenths > MIN_RELEVANCE_TENTHS)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .map(|(tenths, tool)| ToolSuggestion {
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            server: tool.server.clone(),
            category: tool.category.clone(),
            relevance_score: f64::from(tenths) / 10.0,
        })
        .collect()
}

// ─── Extraction ─────────────────────────────────────────────────────────────

/// A matched operand: an integer when it fits `i64`, else a float.
fn operand(digits: &str) -> Option<Value> {
    match digits.parse::<i64>() {
        Ok(n) => Some(Value::from(n)),
        Err(_) => digits
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
    }
}

/// Detect `N + M`, `N plus M` or `N add M` and build an `add_numbers` call.
///
/// Only addition is recognised. Operands too large for `i64` are passed as
/// floating-point numbers.
pub fn extract_arithmetic_call(utterance: &str) -> Option<ToolCall> {
    let captures = ARITHMETIC_PATTERN.captures(utterance)?;
    let a = operand(captures.get(1)?.as_str())?;
    let b = operand(captures.get(2)?.as_str())?;
    Some(ToolCall {
        name: ARITHMETIC_TOOL.to_string(),
        parameters: json!({ "a": a, "b": b }),
    })
}

/// Every `[TOOL_USE:name:{json}]` marker in `text`, in order.
pub fn extract_tool_use_markers(text: &str) -> Vec<ToolUseMarker> {
    TOOL_USE_PATTERN
        .captures_iter(text)
        .filter_map(|caps| {
            let tool_name = caps.get(1)?.as_str().to_string();
            let payload = caps.get(2)?.as_str();
            let parameters = serde_json::from_str::<Value>(payload).map_err(|e| e.to_string());
            Some(ToolUseMarker {
                tool_name,
                parameters,
            })
        })
        .collect()
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Executes tools on behalf of model responses through an [`McpSession`].
pub struct ToolRouter {
    session: McpSession,
}

impl ToolRouter {
    pub fn new(session: McpSession) -> Self {
        Self { session }
    }

    /// Rank the session's current catalog against `utterance`.
    pub fn suggest(&self, utterance: &str) -> Vec<ToolSuggestion> {
        let suggestions = suggest(utterance, &self.session.list_tools());
        tracing::debug!(
            utterance,
            suggestions = ?suggestions
                .iter()
                .map(|s| format!("{}({:.1})", s.tool_name, s.relevance_score))
                .collect::<Vec<_>>(),
            "ranked tools"
        );
        suggestions
    }

    /// Run the tools a model response asks for.
    ///
    /// Explicit markers are honoured only for suggested tools. When no marker
    /// produced a call, an arithmetic utterance runs `add_numbers` if that
    /// tool was suggested.
    pub async fn dispatch(&self, model_response: &str, utterance: &str) -> Vec<ToolExecution> {
        let suggestions = self.suggest(utterance);
        if suggestions.is_empty() {
            return Vec::new();
        }

        let mut executions = Vec::new();
        for marker in extract_tool_use_markers(model_response) {
            let Some(suggestion) = suggestions.iter().find(|s| s.tool_name == marker.tool_name)
            else {
                tracing::debug!(tool = %marker.tool_name, "ignoring marker for unsuggested tool");
                continue;
            };

            let result = match marker.parameters {
                Ok(parameters) => self.session.call_tool(&marker.tool_name, parameters).await,
                Err(reason) => {
                    tracing::warn!(tool = %marker.tool_name, %reason, "invalid tool marker parameters");
                    invalid_parameters(&marker.tool_name)
                }
            };
            executions.push(ToolExecution {
                result,
                server: suggestion.server.clone(),
                auto_detected: false,
            });
        }

        if executions.is_empty() {
            if let Some(execution) = self.auto_detect(utterance, &suggestions).await {
                executions.push(execution);
            }
        }

        tracing::info!(executed = executions.len(), "tool dispatch complete");
        executions
    }

    async fn auto_detect(
        &self,
        utterance: &str,
        suggestions: &[ToolSuggestion],
    ) -> Option<ToolExecution> {
        let math = suggestions
            .iter()
            .find(|s| s.tool_name == ARITHMETIC_TOOL && s.relevance_score > 0.3)?;
        let call = extract_arithmetic_call(utterance)?;
        tracing::info!(tool = %call.name, parameters = %call.parameters, "auto-detected tool call");

        let result = self.session.call_tool(&call.name, call.parameters).await;
        Some(ToolExecution {
            result,
            server: math.server.clone(),
            auto_detected: true,
        })
    }
}

fn invalid_parameters(tool_name: &str) -> ToolCallResult {
    ToolCallResult {
        tool_name: tool_name.to_string(),
        parameters: Value::Null,
        success: false,
        result: None,
        error: Some("Invalid parameters format".into()),
        error_kind: None,
        execution_time_ms: None,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mcp_client::test_support::{test_config, FakeServer};
    use crate::mcp_client::types::ToolOutput;

    fn tool(name: &str, description: &str, category: Option<&str>) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: description.into(),
            input_schema: json!({}),
            server: "simple-tools".into(),
            category: category.map(str::to_string),
        }
    }

    fn playground_tools() -> Vec<ToolDescriptor> {
        vec![
            tool("echo", "Echo back the input text", Some("basic")),
            tool("add_numbers", "Add two numbers together", Some("basic")),
            tool("get_time", "Get the current time", Some("basic")),
            tool("reverse_text", "Reverse the input text", Some("basic")),
        ]
    }

    #[test]
    fn test_add_ranks_above_echo() {
        let tools = playground_tools();
        assert_eq!(score_tenths("add 2 and 3", &tools[1]), 8);
        assert_eq!(score_tenths("add 2 and 3", &tools[0]), 0);

        let first = suggest("add 2 and 3", &tools);
        assert_eq!(first[0].tool_name, "add_numbers");
        assert_eq!(first[0].relevance_score, 0.8);
        assert!(first.iter().all(|s| s.tool_name != "echo"));

        let second = suggest("add 2 and 3", &tools);
        assert_eq!(first, second);
    }

    #[test]
    fn test_score_is_clamped() {
        let echo = tool("echo", "Echo back the input text", Some("basic"));
        assert_eq!(score("echo echo repeat say output", &echo), 1.0);
    }

    #[test]
    fn test_category_contributes() {
        let t = tool("other", "Something", Some("basic utility"));
        assert_eq!(score_tenths("basic utility", &t), 4);
    }

    #[test]
    fn test_threshold_is_strict() {
        // One keyword match is exactly 0.3 and is dropped.
        let tools = vec![tool("widget", "Frobnicate a widget", None)];
        assert_eq!(score_tenths("widget", &tools[0]), 3);
        assert!(suggest("widget", &tools).is_empty());
    }

    #[test]
    fn test_ties_keep_catalog_order() {
        let tools = vec![
            tool("alpha", "shared words here", None),
            tool("beta", "shared words here", None),
        ];
        let ranked = suggest("shared words", &tools);
        let names: Vec<&str> = ranked.iter().map(|s| s.tool_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_extract_arithmetic_call() {
        let call = extract_arithmetic_call("what is 12 + 30?").unwrap();
        assert_eq!(call.name, "add_numbers");
        assert_eq!(call.parameters, json!({"a": 12, "b": 30}));

        let call = extract_arithmetic_call("7 PLUS 8").unwrap();
        assert_eq!(call.parameters, json!({"a": 7, "b": 8}));

        assert!(extract_arithmetic_call("add 2 and 3").is_none());
        assert!(extract_arithmetic_call("9 - 4").is_none());
    }

    #[test]
    fn test_patterns_compile() {
        assert!(ARITHMETIC_PATTERN.is_match("1 + 2"));
        assert!(TOOL_USE_PATTERN.is_match(r#"[TOOL_USE:echo:{"message":"hi"}]"#));
    }

    #[test]
    fn test_arithmetic_operands_beyond_i64() {
        let call = extract_arithmetic_call("99999999999999999999 + 1").unwrap();
        assert_eq!(call.parameters["a"].as_f64(), Some(1e20));
        assert_eq!(call.parameters["b"], json!(1));
    }

    #[test]
    fn test_extract_tool_use_markers() {
        let text = r#"Sure. [TOOL_USE:add_numbers:{"a":5,"b":3}] and [TOOL_USE:echo:{bad}]"#;
        let markers = extract_tool_use_markers(text);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].tool_name, "add_numbers");
        assert_eq!(markers[0].parameters, Ok(json!({"a": 5, "b": 3})));
        assert_eq!(markers[1].tool_name, "echo");
        assert!(markers[1].parameters.is_err());

        assert!(extract_tool_use_markers("no markers here").is_empty());
    }

    async fn connected_router() -> (ToolRouter, FakeServer) {
        let server = FakeServer::new();
        let session = McpSession::new(test_config(), Arc::new(server.clone()));
        session.connect().await.unwrap();
        (ToolRouter::new(session), server)
    }

    #[tokio::test]
    async fn test_dispatch_runs_marker() {
        let (router, _server) = connected_router().await;

        let executions = router
            .dispatch(r#"[TOOL_USE:echo:{"message":"hi"}]"#, "please echo hi")
            .await;
        assert_eq!(executions.len(), 1);
        assert!(!executions[0].auto_detected);
        assert_eq!(executions[0].server, "fake");
        assert_eq!(
            executions[0].result.result,
            Some(ToolOutput::Text("Echo: hi".into()))
        );
    }

    #[tokio::test]
    async fn test_dispatch_ignores_unsuggested_marker() {
        let (router, server) = connected_router().await;

        let executions = router
            .dispatch(r#"[TOOL_USE:echo:{"message":"hi"}]"#, "add 4 plus 5")
            .await;
        // echo is not relevant; arithmetic fallback runs instead.
        assert_eq!(executions.len(), 1);
        assert!(executions[0].auto_detected);
        assert_eq!(executions[0].result.tool_name, "add_numbers");
        assert_eq!(executions[0].result.result.as_ref().unwrap().as_text(), Some("9"));
        assert_eq!(
            server
                .received_methods()
                .iter()
                .filter(|m| *m == "tools/call")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_dispatch_reports_malformed_marker() {
        let (router, _server) = connected_router().await;

        let executions = router
            .dispatch("[TOOL_USE:echo:{oops}]", "echo this back")
            .await;
        assert_eq!(executions.len(), 1);
        assert!(!executions[0].result.success);
        assert_eq!(
            executions[0].result.error.as_deref(),
            Some("Invalid parameters format")
        );
    }

    #[tokio::test]
    async fn test_dispatch_without_suggestions_does_nothing() {
        let (router, server) = connected_router().await;
        let executions = router.dispatch("[TOOL_USE:echo:{}]", "hello there").await;
        assert!(executions.is_empty());
        assert!(!server.received_methods().iter().any(|m| m == "tools/call"));
    }
}
