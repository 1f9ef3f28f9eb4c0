//! Iterative agent (§4.J): a bounded state machine that alternates model
//! calls with tool dispatch until the model signals completion, runs out
//! of actions, or a resource limit trips.

pub mod messages;

use crate::limiter::ResourceLimiter;
use crate::parser::{self, ToolCall};
use crate::tools::{RunContext, ToolRegistry, ToolResult};
use async_trait::async_trait;
use messages::{ChatMessage, Role, build_system_prompt, build_user_message, format_observation};
use std::sync::Arc;
use tesslate_exec_events::{AgentEvent, AgentStepRecord, ResourceStatsRecord, ToolCallRecord, ToolResultRecord};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Ready,
    Thinking,
    Parsing,
    Acting,
    Observing,
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model adapter error: {0}")]
    Model(String),
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Stream a completion for `messages`, sending chunks into `tx` as
    /// they arrive. The adapter is responsible for closing `tx` when done.
    async fn stream(&self, messages: Vec<ChatMessage>, tx: mpsc::Sender<String>) -> Result<(), AgentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Stop,
    AllowOnce,
    AllowAll,
}

/// Edit-mode=`ask` tools block the loop until this resolves. The caller
/// supplies a decision via the oneshot sender handed back through the
/// `approval_required` event's side channel.
#[async_trait]
pub trait ApprovalWaiter: Send + Sync {
    async fn wait_for_decision(&self, approval_id: uuid::Uuid) -> ApprovalDecision;
}

pub struct AgentRunConfig {
    pub system_prompt: String,
    pub specialization_prompt: String,
    pub chat_history: Vec<ChatMessage>,
    pub user_request: String,
    pub deployment_mode: String,
    pub container_name: String,
    pub project_path: String,
    pub run_id: String,
}

const MAX_OBSERVATION_CHARS: usize = 10_000;

/// Run the iterative loop to completion, emitting events on `events_tx` as
/// the lazy, finite sequence described in §4.J. Returns once a terminal
/// state is reached; the consumer may stop draining `events_tx` early,
/// which simply drops the still-running task's interest (the task itself
/// keeps running to completion — cancellation is the caller's job via the
/// returned `JoinHandle`, not implicit from dropping the receiver).
pub async fn run_iterative_agent(
    config: AgentRunConfig,
    model: Arc<dyn ModelAdapter>,
    tools: ToolRegistry,
    run_context: Arc<RunContext>,
    limiter: Arc<ResourceLimiter>,
    approvals: Arc<dyn ApprovalWaiter>,
    events_tx: mpsc::Sender<AgentEvent>,
) {
    let tool_listing = tools.render_prompt_listing();
    let system_prompt = build_system_prompt(&config.system_prompt, &config.specialization_prompt, &tool_listing);

    let mut messages = vec![ChatMessage { role: Role::System, content: system_prompt }];
    messages.extend(config.chat_history.clone());
    messages.push(ChatMessage {
        role: Role::User,
        content: build_user_message(
            &config.user_request,
            &config.deployment_mode,
            &config.container_name,
            &config.project_path,
        ),
    });

    let mut state = AgentState::Ready;
    let mut iteration: u64 = 0;
    let mut tool_calls_made: u64 = 0;
    let mut previous_iteration_had_failures = false;

    loop {
        match state {
            AgentState::Ready => {
                state = AgentState::Thinking;
            }
            AgentState::Thinking => {
                let (chunk_tx, mut chunk_rx) = mpsc::channel(32);
                let model = model.clone();
                let messages_snapshot = messages.clone();
                let stream_handle = tokio::spawn(async move { model.stream(messages_snapshot, chunk_tx).await });

                let mut response = String::new();
                while let Some(chunk) = chunk_rx.recv().await {
                    if events_tx
                        .send(AgentEvent::TextChunk { content: chunk.clone(), iteration: iteration + 1 })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    response.push_str(&chunk);
                }
                if let Err(e) = stream_handle.await.unwrap_or_else(|e| Err(AgentError::Model(e.to_string()))) {
                    let _ = events_tx.send(AgentEvent::Error { content: e.to_string() }).await;
                    state = AgentState::Failed;
                    continue;
                }

                state = AgentState::Parsing;
                messages.push(ChatMessage { role: Role::Assistant, content: response });
            }
            AgentState::Parsing => {
                state = AgentState::Acting;
            }
            AgentState::Acting => {
                iteration += 1;
                let response = match messages.last() {
                    Some(ChatMessage { role: Role::Assistant, content }) => content.clone(),
                    _ => String::new(),
                };
                let sections = parser::extract_sections(&response);
                let tool_calls = parser::extract_tool_calls(&response);
                let is_complete = parser::is_complete(&response);

                let mut tool_result_records = Vec::new();
                let mut any_failed = false;

                for call in &tool_calls {
                    match dispatch_tool_call(call, &tools, &run_context, &approvals, &events_tx).await {
                        DispatchOutcome::Stopped => {
                            tool_calls_made += tool_result_records.len() as u64;
                            let _ = events_tx
                                .send(AgentEvent::Complete {
                                    success: false,
                                    iterations: iteration,
                                    final_response: String::new(),
                                    tool_calls_made,
                                    completion_reason: "user_stopped".to_string(),
                                    resource_stats: stats_record(&limiter, &config.run_id),
                                })
                                .await;
                            limiter.cleanup_run(&config.run_id);
                            return;
                        }
                        DispatchOutcome::Result(record) => {
                            if !record.success {
                                any_failed = true;
                            }
                            tool_result_records.push(record);
                        }
                    }
                }
                tool_calls_made += tool_calls.len() as u64;

                if !tool_calls.is_empty() {
                    let step = AgentStepRecord {
                        iteration,
                        thought: sections.thought.clone(),
                        tool_calls: tool_calls
                            .iter()
                            .map(|c| ToolCallRecord { name: c.name.clone(), parameters: c.parameters.clone() })
                            .collect(),
                        tool_results: tool_result_records.clone(),
                        response_text: parser::conversational_text(&response),
                        is_complete,
                    };
                    if events_tx.send(AgentEvent::AgentStep(step)).await.is_err() {
                        return;
                    }
                }

                state = AgentState::Observing;
                let observation = format_observation(&tool_result_records, MAX_OBSERVATION_CHARS);
                if !tool_calls.is_empty() {
                    messages.push(ChatMessage { role: Role::User, content: observation });
                }

                if is_complete && previous_iteration_had_failures {
                    messages.push(ChatMessage {
                        role: Role::User,
                        content: "You marked the task complete but the previous iteration had tool failures. \
                                  Please address them before declaring completion."
                            .to_string(),
                    });
                    previous_iteration_had_failures = any_failed;
                    state = AgentState::Thinking;
                } else if is_complete {
                    let final_response = parser::conversational_text(&response);
                    let _ = events_tx
                        .send(AgentEvent::Complete {
                            success: true,
                            iterations: iteration,
                            final_response,
                            tool_calls_made,
                            completion_reason: "task_complete_signal".to_string(),
                            resource_stats: stats_record(&limiter, &config.run_id),
                        })
                        .await;
                    limiter.cleanup_run(&config.run_id);
                    return;
                } else if tool_calls.is_empty() && previous_iteration_had_failures {
                    messages.push(ChatMessage {
                        role: Role::User,
                        content: "No tool calls were made and the previous iteration had failures. \
                                  Please retry or explain how to proceed."
                            .to_string(),
                    });
                    previous_iteration_had_failures = any_failed;
                    state = AgentState::Thinking;
                } else if tool_calls.is_empty() {
                    let final_response = parser::conversational_text(&response);
                    let _ = events_tx
                        .send(AgentEvent::Complete {
                            success: true,
                            iterations: iteration,
                            final_response,
                            tool_calls_made,
                            completion_reason: "no_more_actions".to_string(),
                            resource_stats: stats_record(&limiter, &config.run_id),
                        })
                        .await;
                    limiter.cleanup_run(&config.run_id);
                    return;
                } else {
                    previous_iteration_had_failures = any_failed;
                    if let Err(_breach) = limiter.add_iteration(Some(&config.run_id)) {
                        let _ = events_tx
                            .send(AgentEvent::Complete {
                                success: false,
                                iterations: iteration,
                                final_response: String::new(),
                                tool_calls_made,
                                completion_reason: "resource_limit_exceeded".to_string(),
                                resource_stats: stats_record(&limiter, &config.run_id),
                            })
                            .await;
                        limiter.cleanup_run(&config.run_id);
                        return;
                    }
                    state = AgentState::Thinking;
                }
            }
            AgentState::Observing => {
                // Unreachable: Acting always transitions directly onward.
                state = AgentState::Thinking;
            }
            AgentState::Done | AgentState::Failed => {
                if state == AgentState::Failed {
                    let _ = events_tx
                        .send(AgentEvent::Complete {
                            success: false,
                            iterations: iteration,
                            final_response: String::new(),
                            tool_calls_made,
                            completion_reason: "unrecoverable_error".to_string(),
                            resource_stats: stats_record(&limiter, &config.run_id),
                        })
                        .await;
                    limiter.cleanup_run(&config.run_id);
                }
                return;
            }
        }
    }
}

fn stats_record(limiter: &ResourceLimiter, run_id: &str) -> ResourceStatsRecord {
    let stats = limiter.get_stats(Some(run_id));
    ResourceStatsRecord { cost_cents: stats.cost_cents, iterations: stats.iterations }
}

/// Outcome of dispatching one tool call. `Stopped` means the user declined
/// an approval-required call outright — the loop terminates rather than
/// folding the decline in as an ordinary tool failure the model might retry.
enum DispatchOutcome {
    Result(ToolResultRecord),
    Stopped,
}

async fn dispatch_tool_call(
    call: &ToolCall,
    tools: &ToolRegistry,
    run_context: &Arc<RunContext>,
    approvals: &Arc<dyn ApprovalWaiter>,
    events_tx: &mpsc::Sender<AgentEvent>,
) -> DispatchOutcome {
    if call.is_parse_error() {
        let suggestion = call.parameters.get("suggestion").and_then(|v| v.as_str()).unwrap_or(
            "Re-emit the tool call with valid, properly escaped JSON parameters.",
        );
        return DispatchOutcome::Result(ToolResultRecord {
            success: false,
            tool: "__parse_error__".to_string(),
            result: call.parameters.clone(),
            suggestion: Some(format!("⚠ REQUIRED ACTION: {suggestion}")),
        });
    }

    let outcome: ToolResult = tools.execute(&call.name, call.parameters.clone(), run_context.clone()).await;

    if outcome.approval_required.unwrap_or(false) {
        let approval_id = uuid::Uuid::new_v4();
        let _ = events_tx
            .send(AgentEvent::ApprovalRequired {
                approval_id,
                tool_name: call.name.clone(),
                parameters: call.parameters.clone(),
                tool_description: outcome.error.clone().unwrap_or_default(),
            })
            .await;
        match approvals.wait_for_decision(approval_id).await {
            ApprovalDecision::Stop => return DispatchOutcome::Stopped,
            ApprovalDecision::AllowOnce | ApprovalDecision::AllowAll => {
                let retried_context = Arc::new(run_context.with_approval_skipped());
                let retried = tools.execute(&call.name, call.parameters.clone(), retried_context).await;
                return DispatchOutcome::Result(ToolResultRecord {
                    success: retried.success,
                    tool: retried.tool,
                    result: retried.result,
                    suggestion: retried.suggestion,
                });
            }
        }
    }

    DispatchOutcome::Result(ToolResultRecord {
        success: outcome.success,
        tool: outcome.tool,
        result: outcome.result,
        suggestion: outcome.suggestion,
    })
}
