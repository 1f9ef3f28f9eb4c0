//! Structured event schema streamed out of the iterative agent run loop
//! (§4.J "Events emitted to caller"). Each variant corresponds 1:1 to one
//! of the event kinds the specification names; the run loop never invents
//! an ad-hoc shape on top of this enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultRecord {
    pub success: bool,
    pub tool: String,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStepRecord {
    pub iteration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_results: Vec<ToolResultRecord>,
    pub response_text: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatsRecord {
    pub cost_cents: i64,
    pub iterations: u64,
}

/// One event pushed onto the bounded channel a consumer drains while the
/// iterative agent runs (§9 "Async generators").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextChunk {
        content: String,
        iteration: u64,
    },
    AgentStep(AgentStepRecord),
    ApprovalRequired {
        approval_id: Uuid,
        tool_name: String,
        parameters: Value,
        tool_description: String,
    },
    Complete {
        success: bool,
        iterations: u64,
        final_response: String,
        tool_calls_made: u64,
        completion_reason: String,
        resource_stats: ResourceStatsRecord,
    },
    Error {
        content: String,
    },
}

impl AgentEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_event_round_trips_through_json() {
        let event = AgentEvent::Complete {
            success: true,
            iterations: 3,
            final_response: "done".to_string(),
            tool_calls_made: 2,
            completion_reason: "task_complete_signal".to_string(),
            resource_stats: ResourceStatsRecord {
                cost_cents: 120,
                iterations: 3,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
