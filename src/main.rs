mod config;
mod constants;
mod events;
mod host;
mod llm;
mod model;
mod sandbox;
mod session;
mod step;
#[cfg(test)]
mod testing;
mod tools;
mod turn;
mod workflow;

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result, anyhow};
use bpaf::{OptionParser, Parser, construct, long, positional};
use config::{AgentConfig, ConfigError};
use events::{EventLevel, LogContext, WorkflowEvent};
use host::{
    CancelConversation, ConversationStarted, EndConversation, ListConversations, SendUserMessage,
    StartConversation, WorkflowHost,
};
use kameo::{Actor, actor::ActorRef};
use llm::OpenAiModel;
use model::AgentMode;
use sandbox::LocalSandboxProvider;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::{self, UnboundedReceiver},
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use turn::TurnOutcome;
use workflow::{WorkflowDeps, WorkflowOutcome, WorkflowUpdate};

#[derive(Debug, Clone)]
struct ChatArgs {
    repo:              Option<String>,
    mode:              AgentMode,
    max_steps:         Option<usize>,
    max_turns:         Option<usize>,
    hook_timeout_secs: Option<u64>,
    sandbox_root:      Option<PathBuf>,
    prompt:            Option<String>,
}

#[derive(Debug, Clone)]
enum Command {
    Chat(ChatArgs),
}

fn chat_args() -> impl Parser<ChatArgs> {
    let repo = long("repo")
        .help("Repository to clone into the sandbox before the first turn")
        .argument::<String>("URL")
        .optional();
    let mode = long("mode")
        .help("workflow (multi-turn) or stateless (single turn)")
        .argument::<AgentMode>("MODE")
        .fallback(AgentMode::Workflow);
    let max_steps = long("max-steps")
        .help("Model steps allowed per turn")
        .argument::<usize>("N")
        .optional();
    let max_turns = long("max-turns")
        .help("Turns allowed per conversation")
        .argument::<usize>("N")
        .optional();
    let hook_timeout_secs = long("hook-timeout-secs")
        .help("Seconds to wait for the next message before failing")
        .argument::<u64>("SECS")
        .optional();
    let sandbox_root = long("sandbox-root")
        .help("Directory that holds sandbox workspaces")
        .argument::<PathBuf>("DIR")
        .optional();
    let prompt = positional::<String>("PROMPT")
        .help("First message; further messages are read from stdin")
        .optional();

    construct!(ChatArgs {
        repo,
        mode,
        max_steps,
        max_turns,
        hook_timeout_secs,
        sandbox_root,
        prompt,
    })
}

fn cli() -> OptionParser<Command> {
    chat_args()
        .to_options()
        .descr("Start a conversation with the code analysis agent")
        .command("chat")
        .map(Command::Chat)
        .to_options()
        .descr("Sandboxed code analysis agent")
        .version(env!("CARGO_PKG_VERSION"))
}

impl ChatArgs {
    fn apply(&self, mut config: AgentConfig) -> Result<AgentConfig, ConfigError> {
        if let Some(max_steps) = self.max_steps {
            config.agent.max_steps = max_steps;
        }
        if let Some(max_turns) = self.max_turns {
            config.workflow.max_turns = max_turns;
        }
        if let Some(secs) = self.hook_timeout_secs {
            config.workflow.hook_timeout = std::time::Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    fn first_message(&self) -> Option<String> {
        match (&self.repo, &self.prompt) {
            (Some(repo), Some(prompt)) => {
                Some(format!("Clone {repo} with git_clone, then answer: {prompt}"))
            }
            (Some(repo), None) => Some(format!(
                "Clone {repo} with git_clone and give a short overview of its layout."
            )),
            (None, prompt) => prompt.clone(),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let Command::Chat(args) = cli().run();
    init_tracing();

    let config = args
        .apply(AgentConfig::from_env()?)
        .context("invalid configuration")?;
    let sandbox_root = args
        .sandbox_root
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("codescout"));
    let model = OpenAiModel::from_env()?;

    info!(
        model = model.model(),
        sandbox_root = %sandbox_root.display(),
        max_steps = config.agent.max_steps,
        max_turns = config.workflow.max_turns,
        "codescout.starting"
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(print_activity(event_rx));

    let deps = WorkflowDeps {
        provider: Arc::new(LocalSandboxProvider::new(sandbox_root)),
        model:    Arc::new(model),
        sink:     Arc::new(events::TracingSink::with_event_sender(Some(event_tx))),
    };
    let host_ref = WorkflowHost::spawn(WorkflowHost::new(config, deps));

    let result = chat(&host_ref, &args).await;
    if let Ok(conversations) = host_ref.ask(ListConversations).await {
        for snapshot in conversations {
            info!(
                conversation_id = %snapshot.conversation_id,
                run_id = %snapshot.workflow_run_id,
                phase = %snapshot.status.phase,
                turns_taken = snapshot.status.turns_taken,
                sandbox_id = snapshot.status.sandbox.as_ref().map(|handle| handle.id.as_str()),
                "conversation.summary"
            );
        }
    }
    host_ref.stop_gracefully().await.ok();
    result
}

async fn chat(host_ref: &ActorRef<WorkflowHost>, args: &ChatArgs) -> Result<()> {
    let ConversationStarted {
        conversation_id,
        workflow_run_id,
        mut updates,
    } = host_ref
        .ask(StartConversation {
            conversation_id: None,
            first_message:   args.first_message(),
            mode:            args.mode,
        })
        .await
        .map_err(|err| anyhow!("failed to start conversation: {err}"))?;
    info!(%conversation_id, run_id = %workflow_run_id, "conversation.ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(WorkflowUpdate::TurnFinished { turn, outcome }) => print_turn(turn, &outcome),
                Some(WorkflowUpdate::AwaitingReply(pending)) => {
                    eprintln!("(reply before {}, /exit to finish)", pending.deadline.format("%H:%M:%S"));
                }
                Some(WorkflowUpdate::Finished(report)) => {
                    return match report.outcome {
                        WorkflowOutcome::Completed { reason } => {
                            eprintln!(
                                "conversation finished after {} turn(s): {reason:?}",
                                report.state.turns_taken
                            );
                            Ok(())
                        }
                        WorkflowOutcome::Failed(failure) => Err(anyhow!(failure)),
                    };
                }
                None => return Err(anyhow!("workflow stopped without reporting an outcome")),
            },
            line = lines.next_line(), if stdin_open => {
                let line = line.context("failed to read stdin")?;
                match line.as_deref().map(str::trim) {
                    None | Some("/exit") => {
                        stdin_open = false;
                        host_ref
                            .ask(EndConversation { conversation_id: conversation_id.clone() })
                            .await
                            .map_err(|err| anyhow!("failed to end conversation: {err}"))?;
                    }
                    Some("") => {}
                    Some(text) => {
                        let sent = host_ref
                            .ask(SendUserMessage {
                                conversation_id: conversation_id.clone(),
                                text:            text.to_string(),
                            })
                            .await;
                        if let Err(err) = sent {
                            eprintln!("message not delivered: {err}");
                        }
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                host_ref
                    .ask(CancelConversation { conversation_id: conversation_id.clone() })
                    .await
                    .map_err(|err| anyhow!("failed to cancel conversation: {err}"))?;
            }
        }
    }
}

fn print_turn(turn: usize, outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed { answer, steps } => {
            println!("\n{answer}\n");
            eprintln!("(turn {turn}, {steps} step(s))");
        }
        TurnOutcome::BudgetExhausted { steps } => {
            eprintln!("(turn {turn} ran out of steps after {steps}; ask to continue or narrow the question)");
        }
        TurnOutcome::Failed(failure) => eprintln!("turn failed: {failure}"),
    }
}

/// Mirror tool activity on stderr while a turn runs.
async fn print_activity(mut events: UnboundedReceiver<WorkflowEvent>) {
    while let Some(event) = events.recv().await {
        let LogContext::Step(step) = event.context else {
            continue;
        };
        let detail = event
            .get("args")
            .or_else(|| event.get("error"))
            .unwrap_or_default();
        let marker = match event.level {
            EventLevel::Info => " ",
            EventLevel::Warn | EventLevel::Error => "!",
        };
        eprintln!("  {marker} [{step}] {} {detail}", event.message);
    }
}
