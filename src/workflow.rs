//! The workflow orchestrator: owns one sandbox and drives turns until the
//! conversation ends, fails, or runs out of turns.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{
    mpsc::{Receiver, UnboundedSender},
    watch,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::AgentConfig,
    constants::SYSTEM_PROMPT,
    events::{EventSink, LogContext, WorkflowEvent},
    llm::ModelClient,
    model::{AgentMode, Message},
    sandbox::{Sandbox, SandboxError, SandboxHandle, SandboxProvider},
    session::{self, SessionStore},
    step::{StepError, StepExecutor},
    tools::ToolRegistry,
    turn::{TurnCoordinator, TurnOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Initializing,
    ProvisioningSandbox,
    AwaitingUserMessage,
    RunningTurn,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowPhase::Initializing => "initializing",
            WorkflowPhase::ProvisioningSandbox => "provisioning_sandbox",
            WorkflowPhase::AwaitingUserMessage => "awaiting_user_message",
            WorkflowPhase::RunningTurn => "running_turn",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers and counters of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub conversation_id: String,
    pub workflow_run_id: String,
    pub turns_taken:     usize,
    pub max_turns:       usize,
    pub mode:            AgentMode,
    /// Set while a sandbox is live.
    pub sandbox_id:      Option<String>,
}

impl WorkflowState {
    pub fn new(
        conversation_id: impl Into<String>,
        workflow_run_id: impl Into<String>,
        max_turns: usize,
        mode: AgentMode,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            workflow_run_id: workflow_run_id.into(),
            turns_taken: 0,
            max_turns,
            mode,
            sandbox_id: None,
        }
    }
}

/// Present only while the workflow is suspended waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUserReply {
    pub workflow_run_id: String,
    pub deadline:        DateTime<Utc>,
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowStatus {
    pub phase:         WorkflowPhase,
    pub turns_taken:   usize,
    pub pending_reply: Option<PendingUserReply>,
    /// The run's sandbox as of its last lifecycle change; kept after teardown.
    pub sandbox:       Option<SandboxHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Provision,
    SandboxExpired,
    SandboxLost,
    ModelUnavailable,
    UserReplyTimeout,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Config => "config",
            FailureKind::Provision => "provision",
            FailureKind::SandboxExpired => "sandbox_expired",
            FailureKind::SandboxLost => "sandbox_lost",
            FailureKind::ModelUnavailable => "model_unavailable",
            FailureKind::UserReplyTimeout => "user_reply_timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {reason}")]
pub struct WorkflowFailure {
    pub kind:   FailureKind,
    pub reason: String,
}

impl WorkflowFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<SandboxError> for WorkflowFailure {
    fn from(err: SandboxError) -> Self {
        let kind = match &err {
            SandboxError::Config(_) => FailureKind::Config,
            SandboxError::Provision(_) => FailureKind::Provision,
            SandboxError::Expired { .. } => FailureKind::SandboxExpired,
            SandboxError::NotReady { .. } | SandboxError::Lost { .. } => FailureKind::SandboxLost,
        };
        WorkflowFailure::new(kind, err.to_string())
    }
}

impl From<StepError> for WorkflowFailure {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Sandbox(err) => err.into(),
            StepError::ModelUnavailable { .. } => {
                WorkflowFailure::new(FailureKind::ModelUnavailable, err.to_string())
            }
            StepError::Cancelled => WorkflowFailure::new(FailureKind::Cancelled, err.to_string()),
            StepError::BudgetExhausted(_) => {
                WorkflowFailure::new(FailureKind::Internal, err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    TurnBudgetReached,
    /// The user side closed the message channel.
    ConversationClosed,
    /// Stateless mode runs exactly one turn.
    SingleTurn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed { reason: CompletionReason },
    Failed(WorkflowFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowReport {
    pub state:   WorkflowState,
    pub outcome: WorkflowOutcome,
    pub history: Vec<Message>,
}

/// Progress pushed to whoever started the run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowUpdate {
    AwaitingReply(PendingUserReply),
    TurnFinished { turn: usize, outcome: TurnOutcome },
    Finished(WorkflowReport),
}

/// Collaborators shared by every workflow a host starts.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub provider: Arc<dyn SandboxProvider>,
    pub model:    Arc<dyn ModelClient>,
    pub sink:     Arc<dyn EventSink>,
}

pub struct Workflow {
    config:  AgentConfig,
    deps:    WorkflowDeps,
    store:   Arc<dyn SessionStore>,
    turns:   TurnCoordinator,
    state:   WorkflowState,
    cancel:  CancellationToken,
    status:  watch::Sender<WorkflowStatus>,
    updates: Option<UnboundedSender<WorkflowUpdate>>,
}

impl Workflow {
    pub fn new(
        config: AgentConfig,
        deps: WorkflowDeps,
        store: Arc<dyn SessionStore>,
        mode: AgentMode,
    ) -> Self {
        let executor = StepExecutor::new(
            deps.model.clone(),
            ToolRegistry::new(config.tools.clone()),
            deps.sink.clone(),
            config.agent.model_retries,
        );
        let turns = TurnCoordinator::new(executor, config.agent.max_steps, deps.sink.clone());
        let state = WorkflowState::new(
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            config.workflow.max_turns,
            mode,
        );
        let (status, _) = watch::channel(WorkflowStatus {
            phase:         WorkflowPhase::Initializing,
            turns_taken:   0,
            pending_reply: None,
            sandbox:       None,
        });

        Self {
            config,
            deps,
            store,
            turns,
            state,
            cancel: CancellationToken::new(),
            status,
            updates: None,
        }
    }

    /// Continue an existing conversation under a new run id.
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.state.conversation_id = conversation_id.into();
        self
    }

    pub fn with_updates(mut self, updates: UnboundedSender<WorkflowUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowStatus> {
        self.status.subscribe()
    }

    /// Run to a terminal phase. `first_message`, when given, starts the first turn
    /// without waiting on `inbox`.
    pub async fn run(
        mut self,
        first_message: Option<String>,
        mut inbox: Receiver<String>,
    ) -> WorkflowReport {
        let run_id = self.state.workflow_run_id.clone();
        self.emit(
            WorkflowEvent::info(LogContext::Workflow, "workflow.started")
                .run(&run_id)
                .field("conversation_id", &self.state.conversation_id)
                .field("mode", self.state.mode)
                .field("max_turns", self.state.max_turns),
        );
        session::persist(self.store.as_ref(), &self.state);

        let mut history = vec![Message::system(SYSTEM_PROMPT)];
        let provisioned = AssertUnwindSafe(self.provision())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(WorkflowFailure::new(
                    FailureKind::Internal,
                    format!("sandbox provisioning panicked: {}", panic_message(panic.as_ref())),
                ))
            });
        let outcome = match provisioned {
            Err(failure) => WorkflowOutcome::Failed(failure),
            Ok(sandbox) => {
                let driven = AssertUnwindSafe(self.drive(
                    &sandbox,
                    &mut history,
                    first_message,
                    &mut inbox,
                ))
                .catch_unwind()
                .await;
                let outcome = driven.unwrap_or_else(|panic| {
                    WorkflowOutcome::Failed(WorkflowFailure::new(
                        FailureKind::Internal,
                        format!("workflow panicked: {}", panic_message(panic.as_ref())),
                    ))
                });
                sandbox.terminate().await;
                self.state.sandbox_id = None;
                self.publish_sandbox(&sandbox);
                outcome
            }
        };

        self.finish(outcome, history)
    }

    async fn provision(&mut self) -> Result<Sandbox, WorkflowFailure> {
        if self.cancel.is_cancelled() {
            return Err(WorkflowFailure::new(
                FailureKind::Cancelled,
                "cancelled before provisioning",
            ));
        }
        self.config
            .validate()
            .map_err(|err| WorkflowFailure::new(FailureKind::Config, err.to_string()))?;

        self.set_phase(WorkflowPhase::ProvisioningSandbox);
        let provisioned = Sandbox::provision(
            self.deps.provider.clone(),
            self.config.sandbox.clone(),
            self.deps.sink.clone(),
            &self.state.workflow_run_id,
        )
        .await;
        let sandbox = match provisioned {
            Ok(sandbox) => sandbox,
            Err(err) => {
                self.emit(
                    WorkflowEvent::error(LogContext::Workflow, "workflow.provision_failed")
                        .run(&self.state.workflow_run_id)
                        .field("retryable", err.is_retryable())
                        .field("error", &err),
                );
                return Err(err.into());
            }
        };
        self.publish_sandbox(&sandbox);

        // Provisioning itself is not interruptible; tear down what it produced.
        if self.cancel.is_cancelled() {
            sandbox.terminate().await;
            self.publish_sandbox(&sandbox);
            return Err(WorkflowFailure::new(
                FailureKind::Cancelled,
                "cancelled during provisioning",
            ));
        }

        self.state.sandbox_id = Some(sandbox.id().to_string());
        session::persist(self.store.as_ref(), &self.state);
        Ok(sandbox)
    }

    async fn drive(
        &mut self,
        sandbox: &Sandbox,
        history: &mut Vec<Message>,
        first_message: Option<String>,
        inbox: &mut Receiver<String>,
    ) -> WorkflowOutcome {
        let mut next = first_message;

        loop {
            let message = match next.take() {
                Some(message) => message,
                None => match self.await_user_message(inbox).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        return WorkflowOutcome::Completed {
                            reason: CompletionReason::ConversationClosed,
                        };
                    }
                    Err(failure) => return WorkflowOutcome::Failed(failure),
                },
            };

            self.set_phase(WorkflowPhase::RunningTurn);
            let outcome = self
                .turns
                .run_turn(&mut self.state, history, message, sandbox, &self.cancel)
                .await;
            session::persist(self.store.as_ref(), &self.state);
            self.send(WorkflowUpdate::TurnFinished {
                turn:    self.state.turns_taken,
                outcome: outcome.clone(),
            });

            if let TurnOutcome::Failed(failure) = outcome {
                return WorkflowOutcome::Failed(failure);
            }
            if self.state.turns_taken >= self.state.max_turns {
                return WorkflowOutcome::Completed {
                    reason: CompletionReason::TurnBudgetReached,
                };
            }
            if self.state.mode == AgentMode::Stateless {
                return WorkflowOutcome::Completed {
                    reason: CompletionReason::SingleTurn,
                };
            }
        }
    }

    /// Suspend until the next user message, the hook timeout, or cancellation.
    /// `Ok(None)` means the sending side hung up.
    async fn await_user_message(
        &mut self,
        inbox: &mut Receiver<String>,
    ) -> Result<Option<String>, WorkflowFailure> {
        let hook_timeout = self.config.workflow.hook_timeout;
        let pending = PendingUserReply {
            workflow_run_id: self.state.workflow_run_id.clone(),
            deadline:        chrono::Duration::from_std(hook_timeout)
                .ok()
                .and_then(|timeout| Utc::now().checked_add_signed(timeout))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        self.status.send_modify(|status| {
            status.phase = WorkflowPhase::AwaitingUserMessage;
            status.pending_reply = Some(pending.clone());
        });
        self.emit(
            WorkflowEvent::info(LogContext::Workflow, "workflow.awaiting_user_message")
                .run(&self.state.workflow_run_id)
                .field("timeout_secs", hook_timeout.as_secs()),
        );
        self.send(WorkflowUpdate::AwaitingReply(pending));

        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WorkflowFailure::new(
                FailureKind::Cancelled,
                "cancelled while awaiting a user message",
            )),
            received = tokio::time::timeout(hook_timeout, inbox.recv()) => {
                received.map_err(|_| WorkflowFailure::new(
                    FailureKind::UserReplyTimeout,
                    format!("no user message within {}s", hook_timeout.as_secs()),
                ))
            }
        };

        self.status.send_modify(|status| status.pending_reply = None);
        received
    }

    fn finish(mut self, outcome: WorkflowOutcome, history: Vec<Message>) -> WorkflowReport {
        let run_id = self.state.workflow_run_id.clone();
        match &outcome {
            WorkflowOutcome::Completed { reason } => {
                self.set_phase(WorkflowPhase::Completed);
                self.emit(
                    WorkflowEvent::info(LogContext::Workflow, "workflow.completed")
                        .run(&run_id)
                        .field("reason", format!("{reason:?}"))
                        .field("turns_taken", self.state.turns_taken),
                );
            }
            WorkflowOutcome::Failed(failure) => {
                self.set_phase(WorkflowPhase::Failed);
                self.emit(
                    WorkflowEvent::error(LogContext::Workflow, "workflow.failed")
                        .run(&run_id)
                        .field("kind", failure.kind)
                        .field("reason", &failure.reason)
                        .field("turns_taken", self.state.turns_taken),
                );
            }
        }
        session::persist(self.store.as_ref(), &self.state);

        let report = WorkflowReport {
            state: self.state.clone(),
            outcome,
            history,
        };
        self.send(WorkflowUpdate::Finished(report.clone()));
        report
    }

    fn set_phase(&mut self, phase: WorkflowPhase) {
        let turns_taken = self.state.turns_taken;
        self.status.send_modify(|status| {
            status.phase = phase;
            status.turns_taken = turns_taken;
            status.pending_reply = None;
        });
        self.emit(
            WorkflowEvent::info(LogContext::Workflow, "workflow.phase")
                .run(&self.state.workflow_run_id)
                .field("phase", phase),
        );
    }

    fn publish_sandbox(&self, sandbox: &Sandbox) {
        let handle = sandbox.handle();
        self.status.send_modify(|status| status.sandbox = Some(handle));
    }

    fn emit(&self, event: WorkflowEvent) {
        self.deps.sink.emit(event);
    }

    fn send(&self, update: WorkflowUpdate) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::{sync::mpsc, task::JoinHandle};

    use super::*;
    use crate::{
        model::{ModelResponse, ToolCallRequest},
        sandbox::SandboxState,
        session::MemorySessionStore,
        testing::{FakeProvider, RecordingSink, Scripted, ScriptedModel},
    };

    struct Harness {
        provider: Arc<FakeProvider>,
        model:    Arc<ScriptedModel>,
        sink:     Arc<RecordingSink>,
        store:    Arc<MemorySessionStore>,
    }

    impl Harness {
        fn new(model: ScriptedModel) -> Self {
            Self {
                provider: Arc::new(FakeProvider::with_files(&[("README.md", "hello")])),
                model:    Arc::new(model),
                sink:     Arc::new(RecordingSink::default()),
                store:    Arc::new(MemorySessionStore::default()),
            }
        }

        fn workflow(&self, config: AgentConfig, mode: AgentMode) -> Workflow {
            let deps = WorkflowDeps {
                provider: self.provider.clone(),
                model:    self.model.clone(),
                sink:     self.sink.clone(),
            };
            Workflow::new(config, deps, self.store.clone(), mode)
        }

        fn start(
            &self,
            config: AgentConfig,
            mode: AgentMode,
            first: Option<&str>,
        ) -> (mpsc::Sender<String>, JoinHandle<WorkflowReport>) {
            let (tx, rx) = mpsc::channel(8);
            let workflow = self.workflow(config, mode);
            let handle = tokio::spawn(workflow.run(first.map(str::to_string), rx));
            (tx, handle)
        }
    }

    fn failure_kind(report: &WorkflowReport) -> Option<FailureKind> {
        match &report.outcome {
            WorkflowOutcome::Failed(failure) => Some(failure.kind),
            WorkflowOutcome::Completed { .. } => None,
        }
    }

    #[tokio::test]
    async fn multi_turn_conversation_completes_when_user_hangs_up() {
        let h = Harness::new(ScriptedModel::responses([
            ModelResponse::tools(vec![ToolCallRequest::new("1", "list_files", json!({}))]),
            ModelResponse::answer("One README."),
            ModelResponse::answer("It says hello."),
        ]));
        let (tx, handle) = h.start(AgentConfig::default(), AgentMode::Workflow, Some("What is here?"));

        tx.send("What does it say?".into()).await.unwrap();
        drop(tx);
        let report = handle.await.unwrap();

        assert_eq!(report.outcome, WorkflowOutcome::Completed {
            reason: CompletionReason::ConversationClosed,
        });
        assert_eq!(report.state.turns_taken, 2);
        assert_eq!(report.state.sandbox_id, None);
        assert_eq!(h.provider.provision_calls(), 1);
        assert_eq!(h.provider.terminate_calls(), 1);
        assert_eq!(h.provider.live_sandboxes(), 0);
        assert_eq!(report.history.first(), Some(&Message::system(SYSTEM_PROMPT)));
        assert_eq!(h.store.get("turns-taken").as_deref(), Some("2"));
        assert_eq!(h.store.get("sandbox-id"), None);
    }

    #[tokio::test]
    async fn exhausted_turn_waits_for_the_next_message() {
        let list = || ModelResponse::tools(vec![ToolCallRequest::new("c", "list_files", json!({}))]);
        let h = Harness::new(ScriptedModel::responses([list(), list(), list(), list()]));
        let mut config = AgentConfig::default();
        config.agent.max_steps = 3;
        let (updates_tx, mut updates) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(1);
        let workflow = h.workflow(config, AgentMode::Workflow).with_updates(updates_tx);
        let handle = tokio::spawn(workflow.run(Some("explore".into()), rx));

        let first = updates.recv().await.unwrap();
        assert_eq!(first, WorkflowUpdate::TurnFinished {
            turn:    1,
            outcome: TurnOutcome::BudgetExhausted { steps: 3 },
        });
        assert!(matches!(updates.recv().await, Some(WorkflowUpdate::AwaitingReply(_))));
        assert_eq!(h.model.calls(), 3);

        drop(tx);
        let report = handle.await.unwrap();
        assert_eq!(report.state.turns_taken, 1);
        assert!(matches!(updates.recv().await, Some(WorkflowUpdate::Finished(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn hook_timeout_fails_and_tears_down() {
        let h = Harness::new(ScriptedModel::responses([ModelResponse::answer("hi")]));
        let (_tx, handle) = h.start(AgentConfig::default(), AgentMode::Workflow, Some("hello"));

        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::UserReplyTimeout));
        assert_eq!(h.provider.terminate_calls(), 1);
        assert_eq!(h.provider.live_sandboxes(), 0);
        assert_eq!(h.sink.count("workflow.failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_expiry_mid_run_fails_without_reprovisioning() {
        let h = Harness::new(ScriptedModel::responses([
            ModelResponse::answer("first"),
            ModelResponse::answer("never"),
        ]));
        let mut config = AgentConfig::default();
        config.sandbox.timeout = Duration::from_secs(60);
        config.tools.bash_timeout = Duration::from_secs(30);
        let (tx, handle) = h.start(config, AgentMode::Workflow, Some("first question"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        tx.send("second question".into()).await.unwrap();
        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::SandboxExpired));
        assert_eq!(report.state.turns_taken, 1);
        assert_eq!(h.model.calls(), 1);
        assert_eq!(h.provider.provision_calls(), 1);
        assert_eq!(h.provider.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn turns_never_exceed_the_turn_budget() {
        let h = Harness::new(ScriptedModel::responses(
            (0..5).map(|i| ModelResponse::answer(format!("answer {i}"))),
        ));
        let mut config = AgentConfig::default();
        config.workflow.max_turns = 2;
        let (tx, handle) = h.start(config, AgentMode::Workflow, Some("one"));
        tx.send("two".into()).await.unwrap();
        let _ = tx.send("three".into()).await;

        let report = handle.await.unwrap();

        assert_eq!(report.outcome, WorkflowOutcome::Completed {
            reason: CompletionReason::TurnBudgetReached,
        });
        assert_eq!(report.state.turns_taken, 2);
        assert_eq!(h.model.calls(), 2);
    }

    #[tokio::test]
    async fn stateless_mode_runs_a_single_turn() {
        let h = Harness::new(ScriptedModel::responses([ModelResponse::answer("done")]));
        let (_tx, handle) = h.start(AgentConfig::default(), AgentMode::Stateless, Some("go"));

        let report = handle.await.unwrap();

        assert_eq!(report.outcome, WorkflowOutcome::Completed {
            reason: CompletionReason::SingleTurn,
        });
        assert_eq!(h.store.get("agent-mode").as_deref(), Some("stateless"));
        assert_eq!(h.provider.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn provisioning_failure_runs_no_turns() {
        let h = Harness::new(ScriptedModel::responses([ModelResponse::answer("unused")]));
        h.provider.fail_provisioning("capacity");
        let (_tx, handle) = h.start(AgentConfig::default(), AgentMode::Workflow, Some("hi"));

        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::Provision));
        assert_eq!(h.model.calls(), 0);
        assert_eq!(h.provider.terminate_calls(), 0);

        let events = h.sink.events();
        let failed = events
            .iter()
            .find(|event| event.message == "workflow.provision_failed")
            .expect("provision failure logged");
        assert_eq!(failed.get("retryable"), Some("true"));
    }

    #[tokio::test]
    async fn provider_panic_while_provisioning_is_reported_as_a_failure() {
        let h = Harness::new(ScriptedModel::default());
        h.provider.panic_on_provision();
        let (updates_tx, mut updates) = mpsc::unbounded_channel();
        let (_tx, rx) = mpsc::channel(1);
        let workflow = h
            .workflow(AgentConfig::default(), AgentMode::Workflow)
            .with_updates(updates_tx);
        let mut status = workflow.subscribe();

        let report = workflow.run(Some("hi".into()), rx).await;

        assert_eq!(failure_kind(&report), Some(FailureKind::Internal));
        assert!(matches!(
            &report.outcome,
            WorkflowOutcome::Failed(failure) if failure.reason.contains("scripted provider panic")
        ));
        assert!(matches!(updates.recv().await, Some(WorkflowUpdate::Finished(_))));
        assert_eq!(status.borrow_and_update().phase, WorkflowPhase::Failed);
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn sandbox_handle_is_published_through_teardown() {
        let h = Harness::new(ScriptedModel::responses([ModelResponse::answer("hi")]));
        let (tx, rx) = mpsc::channel(1);
        let workflow = h.workflow(AgentConfig::default(), AgentMode::Workflow);
        let mut status = workflow.subscribe();
        assert_eq!(status.borrow().sandbox, None);
        let handle = tokio::spawn(workflow.run(Some("hello".into()), rx));

        status
            .wait_for(|s| s.phase == WorkflowPhase::AwaitingUserMessage)
            .await
            .unwrap();
        let live = status.borrow().sandbox.clone().expect("sandbox handle");
        assert_eq!(live.state, SandboxState::Ready);
        assert_eq!(h.store.get("sandbox-id"), Some(live.id.clone()));

        drop(tx);
        handle.await.unwrap();
        let released = status.borrow().sandbox.clone().expect("sandbox handle");
        assert_eq!(released.id, live.id);
        assert_eq!(released.state, SandboxState::Terminated);
    }

    #[tokio::test]
    async fn invalid_config_never_contacts_the_provider() {
        let h = Harness::new(ScriptedModel::default());
        let mut config = AgentConfig::default();
        config.sandbox.vcpus = 0;
        let (_tx, handle) = h.start(config, AgentMode::Workflow, Some("hi"));

        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::Config));
        assert_eq!(h.provider.provision_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_tears_down() {
        let h = Harness::new(ScriptedModel::responses([ModelResponse::answer("hi")]));
        let (_tx, rx) = mpsc::channel(1);
        let workflow = h.workflow(AgentConfig::default(), AgentMode::Workflow);
        let cancel = workflow.cancellation_token();
        let mut status = workflow.subscribe();
        let handle = tokio::spawn(workflow.run(Some("hello".into()), rx));

        status
            .wait_for(|s| s.phase == WorkflowPhase::AwaitingUserMessage)
            .await
            .unwrap();
        assert!(status.borrow().pending_reply.is_some());
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::Cancelled));
        assert_eq!(h.provider.terminate_calls(), 1);
        assert_eq!(status.borrow().phase, WorkflowPhase::Failed);
    }

    #[tokio::test]
    async fn cancellation_mid_turn_fails_the_run() {
        let h = Harness::new(ScriptedModel::new([Scripted::Hang]));
        let (_tx, rx) = mpsc::channel(1);
        let workflow = h.workflow(AgentConfig::default(), AgentMode::Workflow);
        let cancel = workflow.cancellation_token();
        let mut status = workflow.subscribe();
        let handle = tokio::spawn(workflow.run(Some("hello".into()), rx));

        status
            .wait_for(|s| s.phase == WorkflowPhase::RunningTurn)
            .await
            .unwrap();
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::Cancelled));
        assert_eq!(report.state.turns_taken, 0);
        assert_eq!(h.provider.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn model_outage_fails_the_run() {
        let h = Harness::new(ScriptedModel::default());
        let (_tx, handle) = h.start(AgentConfig::default(), AgentMode::Workflow, Some("hi"));

        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::ModelUnavailable));
        assert_eq!(h.provider.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn panics_still_terminate_the_sandbox_once() {
        let h = Harness::new(ScriptedModel::new([Scripted::Panic]));
        let (_tx, handle) = h.start(AgentConfig::default(), AgentMode::Workflow, Some("hi"));

        let report = handle.await.unwrap();

        assert_eq!(failure_kind(&report), Some(FailureKind::Internal));
        assert_eq!(h.provider.terminate_calls(), 1);
        assert_eq!(h.provider.live_sandboxes(), 0);
    }

    #[test]
    fn failures_serialize_with_kind_and_reason() {
        let failure = WorkflowFailure::new(FailureKind::UserReplyTimeout, "no reply");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value, json!({ "kind": "user_reply_timeout", "reason": "no reply" }));
        assert_eq!(failure.to_string(), "user_reply_timeout: no reply");
    }
}
