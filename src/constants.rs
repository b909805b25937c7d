use std::time::Duration;

/// Model identifier used when `OPENAI_MODEL` is not set.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default temperature applied to LLM requests.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Number of times a failed model request is retried before the step fails.
pub const DEFAULT_MODEL_RETRIES: usize = 2;

/// Absolute lifetime of a sandbox, measured from provisioning.
pub const SANDBOX_TIMEOUT: Duration = Duration::from_secs(20 * 60);

pub const SANDBOX_VCPUS: u32 = 2;

pub const SANDBOX_RUNTIME: &str = "node22";

/// Workspace path as seen from inside the sandbox.
pub const SANDBOX_WORKSPACE_PATH: &str = "/vercel/sandbox/workspace";

/// Opening system message of every conversation.
pub const SYSTEM_PROMPT: &str = "You are a code analysis agent working inside an isolated sandbox. \
The workspace directory is your working directory. Clone repositories with git_clone, explore them \
with list_files, read_file and search_files, and use bash for anything else. Answer the user's \
question once you have gathered enough evidence, citing file paths where relevant.";

/// Maximum number of model steps within a single turn.
pub const MAX_STEPS: usize = 50;

/// Maximum number of turns in one workflow run.
pub const MAX_CONVERSATION_TURNS: usize = 100;

/// Finished conversations a host keeps before evicting the oldest.
pub const RETAINED_CONVERSATIONS: usize = 32;

/// How long a workflow waits for the next user message.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Wall-clock limit for a single `bash` tool invocation.
pub const BASH_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Files larger than this are refused by `read_file` rather than truncated.
pub const MAX_FILE_BYTES: u64 = 256 * 1024;

pub const MAX_SEARCH_MATCHES: usize = 200;

/// Per-stream cap on captured `bash` output.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Maximum characters of a shell command shown in log lines.
pub const COMMAND_PREVIEW_LENGTH: usize = 80;

/// Session storage keys.
pub mod storage_keys {
    pub const CONVERSATION_ID: &str = "conversation-id";
    pub const WORKFLOW_RUN_ID: &str = "workflow-run-id";
    pub const AGENT_MODE: &str = "agent-mode";
    pub const SANDBOX_ID: &str = "sandbox-id";
    pub const TURNS_TAKEN: &str = "turns-taken";
}
