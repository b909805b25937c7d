use std::{env, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::constants::{
    BASH_TIMEOUT, DEFAULT_MODEL_RETRIES, HOOK_TIMEOUT, MAX_CONVERSATION_TURNS, MAX_FILE_BYTES,
    MAX_OUTPUT_BYTES, MAX_SEARCH_MATCHES, MAX_STEPS, RETAINED_CONVERSATIONS, SANDBOX_RUNTIME,
    SANDBOX_TIMEOUT, SANDBOX_VCPUS, SANDBOX_WORKSPACE_PATH,
};

const ENV_SANDBOX_TIMEOUT: &str = "CODESCOUT_SANDBOX_TIMEOUT_SECS";
const ENV_MAX_STEPS: &str = "CODESCOUT_MAX_STEPS";
const ENV_MAX_TURNS: &str = "CODESCOUT_MAX_TURNS";
const ENV_HOOK_TIMEOUT: &str = "CODESCOUT_HOOK_TIMEOUT_SECS";
const ENV_BASH_TIMEOUT: &str = "CODESCOUT_BASH_TIMEOUT_SECS";
const ENV_RETAINED_CONVERSATIONS: &str = "CODESCOUT_RETAINED_CONVERSATIONS";

/// Invalid budgets, timeouts or paths. Never retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sandbox must have at least one vCPU")]
    ZeroVcpus,
    #[error("sandbox workspace path must not be empty")]
    EmptyWorkspacePath,
    #[error("sandbox workspace path `{0}` must be absolute")]
    RelativeWorkspacePath(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("bash timeout ({bash:?}) must be shorter than the sandbox lifetime ({sandbox:?})")]
    BashOutlivesSandbox { bash: Duration, sandbox: Duration },
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
}

/// Shape of every sandbox provisioned by a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxConfig {
    pub timeout:        Duration,
    pub vcpus:          u32,
    pub runtime:        String,
    pub workspace_path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout:        SANDBOX_TIMEOUT,
            vcpus:          SANDBOX_VCPUS,
            runtime:        SANDBOX_RUNTIME.to_string(),
            workspace_path: SANDBOX_WORKSPACE_PATH.to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vcpus == 0 {
            return Err(ConfigError::ZeroVcpus);
        }
        if self.workspace_path.trim().is_empty() {
            return Err(ConfigError::EmptyWorkspacePath);
        }
        if !self.workspace_path.starts_with('/') {
            return Err(ConfigError::RelativeWorkspacePath(self.workspace_path.clone()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("sandbox timeout"));
        }
        Ok(())
    }
}

/// Limits applied to the model-driven step loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub max_steps:     usize,
    pub model_retries: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps:     MAX_STEPS,
            model_retries: DEFAULT_MODEL_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub max_turns:              usize,
    pub hook_timeout:           Duration,
    /// Finished conversations the host keeps around for status queries.
    pub retained_conversations: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_turns:              MAX_CONVERSATION_TURNS,
            hook_timeout:           HOOK_TIMEOUT,
            retained_conversations: RETAINED_CONVERSATIONS,
        }
    }
}

/// Bounds enforced by individual tool handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub bash_timeout:       Duration,
    pub max_file_bytes:     u64,
    pub max_search_matches: usize,
    pub max_output_bytes:   usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            bash_timeout:       BASH_TIMEOUT,
            max_file_bytes:     MAX_FILE_BYTES,
            max_search_matches: MAX_SEARCH_MATCHES,
            max_output_bytes:   MAX_OUTPUT_BYTES,
        }
    }
}

/// Immutable configuration injected into the workflow host and every workflow it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    pub sandbox:  SandboxConfig,
    pub agent:    AgentSettings,
    pub workflow: WorkflowSettings,
    pub tools:    ToolSettings,
}

impl AgentConfig {
    /// Defaults overridden by `CODESCOUT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse_u64(&lookup, ENV_SANDBOX_TIMEOUT)? {
            config.sandbox.timeout = Duration::from_secs(secs);
        }
        if let Some(steps) = parse_u64(&lookup, ENV_MAX_STEPS)? {
            config.agent.max_steps = steps as usize;
        }
        if let Some(turns) = parse_u64(&lookup, ENV_MAX_TURNS)? {
            config.workflow.max_turns = turns as usize;
        }
        if let Some(secs) = parse_u64(&lookup, ENV_HOOK_TIMEOUT)? {
            config.workflow.hook_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, ENV_BASH_TIMEOUT)? {
            config.tools.bash_timeout = Duration::from_secs(secs);
        }
        if let Some(retained) = parse_u64(&lookup, ENV_RETAINED_CONVERSATIONS)? {
            config.workflow.retained_conversations = retained as usize;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sandbox.validate()?;
        if self.agent.max_steps == 0 {
            return Err(ConfigError::Zero("max steps"));
        }
        if self.workflow.max_turns == 0 {
            return Err(ConfigError::Zero("max turns"));
        }
        if self.workflow.hook_timeout.is_zero() {
            return Err(ConfigError::Zero("hook timeout"));
        }
        if self.tools.bash_timeout.is_zero() {
            return Err(ConfigError::Zero("bash timeout"));
        }
        if self.tools.bash_timeout >= self.sandbox.timeout {
            return Err(ConfigError::BashOutlivesSandbox {
                bash:    self.tools.bash_timeout,
                sandbox: self.sandbox.timeout,
            });
        }
        if self.tools.max_file_bytes == 0 {
            return Err(ConfigError::Zero("max file bytes"));
        }
        Ok(())
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key:   key.to_string(),
            value: raw,
        })
}
