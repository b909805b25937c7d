use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventSink, LogContext, WorkflowEvent},
    model::Message,
    sandbox::Sandbox,
    step::{AgentRunState, StepExecutor, StepOutcome},
    workflow::{FailureKind, WorkflowFailure, WorkflowState},
};

/// How a single turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { answer: String, steps: usize },
    /// The step budget ran out before the model produced an answer.
    BudgetExhausted { steps: usize },
    Failed(WorkflowFailure),
}

impl TurnOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            TurnOutcome::Completed { answer, .. } => Some(answer),
            _ => None,
        }
    }
}

/// Runs the step loop for one user message under a fresh step budget.
pub struct TurnCoordinator {
    executor:  StepExecutor,
    max_steps: usize,
    sink:      Arc<dyn EventSink>,
}

impl TurnCoordinator {
    pub fn new(executor: StepExecutor, max_steps: usize, sink: Arc<dyn EventSink>) -> Self {
        Self {
            executor,
            max_steps,
            sink,
        }
    }

    pub async fn run_turn(
        &self,
        state: &mut WorkflowState,
        history: &mut Vec<Message>,
        user_message: String,
        sandbox: &Sandbox,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let run_id = state.workflow_run_id.clone();
        if state.turns_taken >= state.max_turns {
            return TurnOutcome::Failed(WorkflowFailure::new(
                FailureKind::Internal,
                format!("turn budget of {} already spent", state.max_turns),
            ));
        }

        let turn = state.turns_taken + 1;
        self.sink.emit(
            WorkflowEvent::info(LogContext::Workflow, "turn.started")
                .run(&run_id)
                .field("turn", turn)
                .field("max_steps", self.max_steps),
        );

        history.push(Message::user(user_message));
        let mut run = AgentRunState::new(self.max_steps, std::mem::take(history));

        let outcome = loop {
            if run.budget_exhausted() {
                break TurnOutcome::BudgetExhausted {
                    steps: run.steps_taken,
                };
            }
            match self
                .executor
                .run_step(&mut run, sandbox, &run_id, cancel)
                .await
            {
                Ok(StepOutcome::Completed { answer }) => {
                    break TurnOutcome::Completed {
                        answer,
                        steps: run.steps_taken,
                    };
                }
                Ok(StepOutcome::ToolsExecuted { .. } | StepOutcome::Empty) => {}
                Err(err) => break TurnOutcome::Failed(err.into()),
            }
        };
        *history = run.history;

        match &outcome {
            TurnOutcome::Completed { steps, .. } => {
                state.turns_taken += 1;
                self.sink.emit(
                    WorkflowEvent::info(LogContext::Workflow, "turn.completed")
                        .run(&run_id)
                        .field("turn", turn)
                        .field("steps", steps),
                );
            }
            TurnOutcome::BudgetExhausted { steps } => {
                state.turns_taken += 1;
                self.sink.emit(
                    WorkflowEvent::warn(LogContext::Workflow, "turn.budget_exhausted")
                        .run(&run_id)
                        .field("turn", turn)
                        .field("steps", steps),
                );
            }
            TurnOutcome::Failed(failure) => self.sink.emit(
                WorkflowEvent::error(LogContext::Workflow, "turn.failed")
                    .run(&run_id)
                    .field("turn", turn)
                    .field("kind", failure.kind)
                    .field("reason", &failure.reason),
            ),
        }

        outcome
    }
}
