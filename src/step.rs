//! One model-directed step: a model call plus the tool calls it requests.

use std::{ops::Range, sync::Arc};

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    constants::COMMAND_PREVIEW_LENGTH,
    events::{EventSink, LogContext, WorkflowEvent},
    llm::{LlmError, ModelClient},
    model::{Message, ModelResponse, ToolCallRequest, ToolInvocation, ToolOutcome, preview},
    sandbox::{Sandbox, SandboxError},
    tools::{ToolName, ToolRegistry},
};

/// Per-turn step budget and the transcript the steps extend.
#[derive(Debug, Clone)]
pub struct AgentRunState {
    pub steps_taken: usize,
    pub max_steps:   usize,
    pub history:     Vec<Message>,
}

impl AgentRunState {
    pub fn new(max_steps: usize, history: Vec<Message>) -> Self {
        Self {
            steps_taken: 0,
            max_steps,
            history,
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.steps_taken >= self.max_steps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The model answered; the turn may end.
    Completed { answer: String },
    /// Tool calls ran and their results were appended.
    ToolsExecuted { invocations: usize, failures: usize },
    /// The model returned neither an answer nor tool calls.
    Empty,
}

/// Failures that abort the step and end the turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("model unavailable after {attempts} attempts: {source}")]
    ModelUnavailable { attempts: usize, source: LlmError },
    #[error("step cancelled")]
    Cancelled,
    #[error("step budget of {0} already spent")]
    BudgetExhausted(usize),
}

/// Split a response's tool calls into batches that may run concurrently.
///
/// Adjacent read-only calls share a batch. A mutating call always runs alone, and a call
/// that declares a dependency starts a new batch.
pub fn plan_batches(calls: &[ToolCallRequest]) -> Vec<Range<usize>> {
    let mut batches: Vec<Range<usize>> = Vec::new();
    let mut open_read_batch = false;

    for (idx, call) in calls.iter().enumerate() {
        let mutating = ToolName::from_identifier(&call.name).is_some_and(ToolName::is_mutating);
        let joins_current = open_read_batch && !mutating && !call.depends_on_previous;

        match batches.last_mut() {
            Some(batch) if joins_current => batch.end = idx + 1,
            _ => batches.push(idx..idx + 1),
        }
        open_read_batch = !mutating;
    }

    batches
}

pub struct StepExecutor {
    model:         Arc<dyn ModelClient>,
    registry:      ToolRegistry,
    sink:          Arc<dyn EventSink>,
    model_retries: usize,
}

impl StepExecutor {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: ToolRegistry,
        sink: Arc<dyn EventSink>,
        model_retries: usize,
    ) -> Self {
        Self {
            model,
            registry,
            sink,
            model_retries,
        }
    }

    /// Run one step against `sandbox`. Never call this once the budget is spent.
    pub async fn run_step(
        &self,
        state: &mut AgentRunState,
        sandbox: &Sandbox,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, StepError> {
        if state.budget_exhausted() {
            return Err(StepError::BudgetExhausted(state.max_steps));
        }
        sandbox.ensure_ready()?;

        let response = self.invoke_model(&state.history, run_id, cancel).await?;
        state.steps_taken += 1;
        let step = state.steps_taken;

        let ModelResponse {
            final_answer,
            tool_calls,
        } = response;

        if tool_calls.is_empty() {
            return Ok(match final_answer {
                Some(answer) => {
                    state.history.push(Message::Assistant {
                        content:    Some(answer.clone()),
                        tool_calls: Vec::new(),
                    });
                    self.sink.emit(
                        WorkflowEvent::info(LogContext::Workflow, "step.answered")
                            .run(run_id)
                            .field("step", step),
                    );
                    StepOutcome::Completed { answer }
                }
                None => {
                    self.sink.emit(
                        WorkflowEvent::warn(LogContext::Workflow, "step.empty_response")
                            .run(run_id)
                            .field("step", step),
                    );
                    StepOutcome::Empty
                }
            });
        }

        self.sink.emit(
            WorkflowEvent::info(LogContext::Workflow, "step.tool_calls_requested")
                .run(run_id)
                .field("step", step)
                .field("count", tool_calls.len()),
        );

        let invocations = self
            .execute_calls(&tool_calls, sandbox, run_id, cancel)
            .await?;
        let failures = invocations.iter().filter(|i| !i.result.is_success()).count();
        let count = invocations.len();

        state.history.push(Message::Assistant {
            content: final_answer,
            tool_calls,
        });
        state
            .history
            .extend(invocations.into_iter().map(Message::Tool));

        Ok(StepOutcome::ToolsExecuted {
            invocations: count,
            failures,
        })
    }

    async fn invoke_model(
        &self,
        history: &[Message],
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, StepError> {
        let attempts = self.model_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                result = self.model.respond(history, self.registry.tools()) => result,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    self.sink.emit(
                        WorkflowEvent::warn(LogContext::Workflow, "step.model_failed")
                            .run(run_id)
                            .field("attempt", attempt)
                            .field("error", &err),
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(StepError::ModelUnavailable {
            attempts,
            source: last_error
                .unwrap_or_else(|| LlmError::RequestFailed("no attempt made".into())),
        })
    }

    /// Execute `calls` batch by batch; results come back in request order.
    async fn execute_calls(
        &self,
        calls: &[ToolCallRequest],
        sandbox: &Sandbox,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolInvocation>, StepError> {
        let mut invocations = Vec::with_capacity(calls.len());

        for batch in plan_batches(calls) {
            let pending = join_all(
                calls[batch]
                    .iter()
                    .map(|call| self.invoke_tool(call, sandbox, run_id)),
            );
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                results = pending => results,
            };
            for result in results {
                invocations.push(result?);
            }
        }

        Ok(invocations)
    }

    async fn invoke_tool(
        &self,
        call: &ToolCallRequest,
        sandbox: &Sandbox,
        run_id: &str,
    ) -> Result<ToolInvocation, SandboxError> {
        let tool = ToolName::from_identifier(&call.name);
        let context = tool
            .map(|t| LogContext::Step(t.step_name()))
            .unwrap_or(LogContext::Workflow);
        let arguments: Value = serde_json::from_str(&call.arguments)
            .unwrap_or_else(|_| Value::String(call.arguments.clone()));

        self.sink.emit(
            WorkflowEvent::info(context, "tool.started")
                .run(run_id)
                .field("tool", &call.name)
                .field("args", argument_preview(tool, &arguments)),
        );

        let result = match self.registry.execute(sandbox, call).await {
            Ok(output) => {
                self.sink.emit(
                    WorkflowEvent::info(context, "tool.completed")
                        .run(run_id)
                        .field("tool", &call.name),
                );
                ToolOutcome::Success { output }
            }
            Err(err) => {
                if let Some(fatal) = err.fatal() {
                    self.sink.emit(
                        WorkflowEvent::error(context, "tool.sandbox_failed")
                            .run(run_id)
                            .field("tool", &call.name)
                            .field("error", fatal),
                    );
                    return Err(fatal.clone());
                }
                self.sink.emit(
                    WorkflowEvent::warn(context, "tool.failed")
                        .run(run_id)
                        .field("tool", &call.name)
                        .field("error", preview(&err.to_string(), COMMAND_PREVIEW_LENGTH)),
                );
                ToolOutcome::Failure {
                    reason: err.to_string(),
                }
            }
        };

        Ok(ToolInvocation {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments,
            result,
        })
    }
}

fn argument_preview(tool: Option<ToolName>, arguments: &Value) -> String {
    match (tool, arguments.get("command").and_then(Value::as_str)) {
        (Some(ToolName::Bash), Some(command)) => preview(command, COMMAND_PREVIEW_LENGTH),
        _ => preview(&arguments.to_string(), COMMAND_PREVIEW_LENGTH),
    }
}
