//! Chat message composition (§4.J steps 1 and 5): the system prompt, the
//! per-request user message with environment context, and the
//! `Observation:`-formatted tool-result message fed back after Acting.

use serde::{Deserialize, Serialize};
use tesslate_exec_events::ToolResultRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Compose the system prompt from the agent's base prompt, an optional
/// specialization block, and the rendered tool listing.
pub fn build_system_prompt(base_prompt: &str, specialization_prompt: &str, tool_listing: &str) -> String {
    let mut out = String::new();
    out.push_str(base_prompt.trim());
    out.push('\n');
    if !specialization_prompt.trim().is_empty() {
        out.push('\n');
        out.push_str(specialization_prompt.trim());
        out.push('\n');
    }
    out.push_str("\n# Available Tools\n\n");
    out.push_str(tool_listing);
    out
}

/// Compose the per-run user message: the request text plus an environment
/// context block naming the deployment backend, container, and project
/// path the agent is operating against.
pub fn build_user_message(request: &str, deployment_mode: &str, container_name: &str, project_path: &str) -> String {
    format!(
        "# Environment\n- deployment: {deployment_mode}\n- container: {container_name}\n- project path: {project_path}\n\n# Request\n{request}"
    )
}

const ELISION_NOTICE: &str = "\n... [elided] ...\n";

/// Elide the middle of `text` if it exceeds `max_chars`, keeping the head
/// and tail so truncated tool output still shows both ends.
fn elide(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let chars: Vec<char> = text.chars().collect();
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    format!("{head}{ELISION_NOTICE}{tail}")
}

/// Build the `Observation:` message reported back to the model after a
/// round of tool dispatch, one entry per call, each elided independently.
pub fn format_observation(results: &[ToolResultRecord], max_chars_per_result: usize) -> String {
    let mut out = String::from("Observation:\n");
    for result in results {
        let status = if result.success { "success" } else { "error" };
        let body = serde_json::to_string_pretty(&result.result).unwrap_or_else(|_| result.result.to_string());
        out.push_str(&format!("\n[{}] {} ({status}):\n{}\n", result.tool, status, elide(&body, max_chars_per_result)));
        if let Some(suggestion) = &result.suggestion {
            out.push_str(&format!("suggestion: {suggestion}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_system_prompt_includes_tool_listing() {
        let prompt = build_system_prompt("You are an agent.", "", "## filesystem\n- read_file: reads a file\n");
        assert!(prompt.contains("Available Tools"));
        assert!(prompt.contains("read_file"));
    }

    #[test]
    fn format_observation_elides_long_results() {
        let long_body = "x".repeat(50_000);
        let results = vec![ToolResultRecord {
            success: true,
            tool: "read_file".to_string(),
            result: json!(long_body),
            suggestion: None,
        }];
        let observation = format_observation(&results, 10_000);
        assert!(observation.contains(ELISION_NOTICE.trim()));
        assert!(observation.len() < long_body.len());
    }

    #[test]
    fn format_observation_includes_suggestion() {
        let results = vec![ToolResultRecord {
            success: false,
            tool: "patch_file".to_string(),
            result: json!({"error": "no match"}),
            suggestion: Some("re-read the file and retry".to_string()),
        }];
        let observation = format_observation(&results, 10_000);
        assert!(observation.contains("suggestion: re-read the file and retry"));
    }
}
