//! Actor that owns every running conversation and routes user messages to it.

use std::{collections::HashMap, sync::Arc};

use kameo::{
    Actor,
    message::{Context, Message},
};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, error::TrySendError},
    watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AgentConfig,
    events::{LogContext, WorkflowEvent},
    model::AgentMode,
    session::{self, MemorySessionStore, SessionStore},
    workflow::{Workflow, WorkflowDeps, WorkflowState, WorkflowStatus, WorkflowUpdate},
};

/// Messages queued per conversation before senders are told to back off.
const INBOX_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("unknown conversation `{0}`")]
    UnknownConversation(String),
    #[error("conversation `{0}` already has a running workflow")]
    AlreadyRunning(String),
    #[error("conversation `{0}` is no longer accepting messages")]
    NotAccepting(String),
    #[error("conversation `{0}` has too many queued messages")]
    Busy(String),
}

struct Conversation {
    /// Start order, used to evict the oldest finished conversations first.
    sequence:        u64,
    workflow_run_id: String,
    mode:            AgentMode,
    inbox:           Option<mpsc::Sender<String>>,
    cancel:          CancellationToken,
    status:          watch::Receiver<WorkflowStatus>,
    store:           Arc<MemorySessionStore>,
}

impl Conversation {
    fn is_running(&self) -> bool {
        !self.status.borrow().phase.is_terminal()
    }
}

/// Point-in-time view of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub workflow_run_id: String,
    pub mode:            AgentMode,
    pub status:          WorkflowStatus,
    /// What the session store holds for the run, if it is readable.
    pub session:         Option<WorkflowState>,
}

#[derive(Debug)]
pub struct ConversationStarted {
    pub conversation_id: String,
    pub workflow_run_id: String,
    pub updates:         UnboundedReceiver<WorkflowUpdate>,
}

/// Start a workflow run. Passing an existing `conversation_id` whose last run has
/// finished continues that conversation under a new run id.
#[derive(Debug, Clone, Default)]
pub struct StartConversation {
    pub conversation_id: Option<String>,
    pub first_message:   Option<String>,
    pub mode:            AgentMode,
}

#[derive(Debug, Clone)]
pub struct SendUserMessage {
    pub conversation_id: String,
    pub text:            String,
}

/// Close the conversation's inbox; the workflow completes once it next waits.
#[derive(Debug, Clone)]
pub struct EndConversation {
    pub conversation_id: String,
}

#[derive(Debug, Clone)]
pub struct CancelConversation {
    pub conversation_id: String,
}

#[derive(Debug, Clone)]
pub struct GetConversation {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ListConversations;

/// Cancel every running workflow; replies with how many were cancelled.
#[derive(Debug, Clone, Copy)]
pub struct CancelAll;

#[derive(Actor)]
pub struct WorkflowHost {
    config:        AgentConfig,
    deps:          WorkflowDeps,
    conversations: HashMap<String, Conversation>,
    next_sequence: u64,
}

impl WorkflowHost {
    pub fn new(config: AgentConfig, deps: WorkflowDeps) -> Self {
        Self {
            config,
            deps,
            conversations: HashMap::new(),
            next_sequence: 0,
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        self.deps.sink.emit(event);
    }

    fn conversation(&self, conversation_id: &str) -> Result<&Conversation, HostError> {
        self.conversations
            .get(conversation_id)
            .ok_or_else(|| HostError::UnknownConversation(conversation_id.to_string()))
    }

    fn snapshot(&self, conversation_id: &str, conversation: &Conversation) -> ConversationSnapshot {
        let max_turns = self.config.workflow.max_turns;
        ConversationSnapshot {
            conversation_id: conversation_id.to_string(),
            workflow_run_id: conversation.workflow_run_id.clone(),
            mode:            conversation.mode,
            status:          conversation.status.borrow().clone(),
            session:         session::restore(conversation.store.as_ref(), max_turns).ok(),
        }
    }

    fn start(&mut self, request: StartConversation) -> Result<ConversationStarted, HostError> {
        if let Some(id) = &request.conversation_id {
            if self.conversations.get(id).is_some_and(Conversation::is_running) {
                return Err(HostError::AlreadyRunning(id.clone()));
            }
        }

        let store = Arc::new(MemorySessionStore::default());
        let store_dyn: Arc<dyn SessionStore> = store.clone();
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let mut workflow = Workflow::new(self.config.clone(), self.deps.clone(), store_dyn, request.mode)
            .with_updates(updates_tx);
        if let Some(id) = request.conversation_id {
            workflow = workflow.with_conversation_id(id);
        }

        let conversation_id = workflow.state().conversation_id.clone();
        let workflow_run_id = workflow.state().workflow_run_id.clone();
        self.next_sequence += 1;
        let conversation = Conversation {
            sequence: self.next_sequence,
            workflow_run_id: workflow_run_id.clone(),
            mode: request.mode,
            inbox: Some(inbox_tx),
            cancel: workflow.cancellation_token(),
            status: workflow.subscribe(),
            store,
        };

        self.emit(
            WorkflowEvent::info(LogContext::Api, "conversation.started")
                .run(&workflow_run_id)
                .field("conversation_id", &conversation_id)
                .field("mode", request.mode)
                .field("has_first_message", request.first_message.is_some()),
        );

        tokio::spawn(workflow.run(request.first_message, inbox_rx));
        self.conversations.insert(conversation_id.clone(), conversation);
        self.evict_finished();

        Ok(ConversationStarted {
            conversation_id,
            workflow_run_id,
            updates,
        })
    }

    /// Forget the oldest finished conversations beyond the retention limit.
    fn evict_finished(&mut self) {
        let retained = self.config.workflow.retained_conversations;
        let mut finished: Vec<(u64, String)> = self
            .conversations
            .iter()
            .filter(|(_, conversation)| !conversation.is_running())
            .map(|(id, conversation)| (conversation.sequence, id.clone()))
            .collect();
        if finished.len() <= retained {
            return;
        }

        finished.sort_unstable();
        let excess = finished.len() - retained;
        for (_, conversation_id) in finished.into_iter().take(excess) {
            if let Some(conversation) = self.conversations.remove(&conversation_id) {
                self.emit(
                    WorkflowEvent::info(LogContext::Api, "conversation.evicted")
                        .run(&conversation.workflow_run_id)
                        .field("conversation_id", &conversation_id),
                );
            }
        }
    }

    fn route(&self, msg: SendUserMessage) -> Result<(), HostError> {
        let conversation = self.conversation(&msg.conversation_id)?;
        let not_accepting = || HostError::NotAccepting(msg.conversation_id.clone());

        let inbox = conversation.inbox.as_ref().ok_or_else(not_accepting)?;
        if !conversation.is_running() {
            return Err(not_accepting());
        }
        let run_id = conversation.workflow_run_id.clone();

        match inbox.try_send(msg.text) {
            Ok(()) => {
                self.emit(
                    WorkflowEvent::info(LogContext::Api, "conversation.message_routed")
                        .run(&run_id)
                        .field("conversation_id", &msg.conversation_id),
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(HostError::Busy(msg.conversation_id.clone())),
            Err(TrySendError::Closed(_)) => Err(not_accepting()),
        }
    }
}

impl Message<StartConversation> for WorkflowHost {
    type Reply = Result<ConversationStarted, HostError>;

    async fn handle(
        &mut self,
        msg: StartConversation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.start(msg)
    }
}

impl Message<SendUserMessage> for WorkflowHost {
    type Reply = Result<(), HostError>;

    async fn handle(
        &mut self,
        msg: SendUserMessage,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let conversation_id = msg.conversation_id.clone();
        self.route(msg).inspect_err(|err| {
            self.emit(
                WorkflowEvent::warn(LogContext::Api, "conversation.message_rejected")
                    .field("conversation_id", &conversation_id)
                    .field("error", err),
            );
        })
    }
}

impl Message<EndConversation> for WorkflowHost {
    type Reply = Result<(), HostError>;

    async fn handle(
        &mut self,
        msg: EndConversation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let conversation = self
            .conversations
            .get_mut(&msg.conversation_id)
            .ok_or_else(|| HostError::UnknownConversation(msg.conversation_id.clone()))?;
        conversation.inbox = None;
        let run_id = conversation.workflow_run_id.clone();

        self.emit(
            WorkflowEvent::info(LogContext::Api, "conversation.ended")
                .run(&run_id)
                .field("conversation_id", &msg.conversation_id),
        );
        Ok(())
    }
}

impl Message<CancelConversation> for WorkflowHost {
    type Reply = Result<(), HostError>;

    async fn handle(
        &mut self,
        msg: CancelConversation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let conversation = self.conversation(&msg.conversation_id)?;
        conversation.cancel.cancel();
        let run_id = conversation.workflow_run_id.clone();

        self.emit(
            WorkflowEvent::warn(LogContext::Api, "conversation.cancelled")
                .run(&run_id)
                .field("conversation_id", &msg.conversation_id),
        );
        Ok(())
    }
}

impl Message<GetConversation> for WorkflowHost {
    type Reply = Result<ConversationSnapshot, HostError>;

    async fn handle(
        &mut self,
        msg: GetConversation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let conversation = self.conversation(&msg.conversation_id)?;
        Ok(self.snapshot(&msg.conversation_id, conversation))
    }
}

impl Message<ListConversations> for WorkflowHost {
    type Reply = Vec<ConversationSnapshot>;

    async fn handle(
        &mut self,
        _msg: ListConversations,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut snapshots: Vec<_> = self
            .conversations
            .iter()
            .map(|(id, conversation)| self.snapshot(id, conversation))
            .collect();
        snapshots.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        snapshots
    }
}

impl Message<CancelAll> for WorkflowHost {
    type Reply = usize;

    async fn handle(&mut self, _msg: CancelAll, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let mut cancelled = 0;
        for conversation in self.conversations.values().filter(|c| c.is_running()) {
            conversation.cancel.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            self.emit(
                WorkflowEvent::warn(LogContext::Api, "conversation.cancelled_all")
                    .field("count", cancelled),
            );
        }
        cancelled
    }
}
