//! The fixed set of tools the model may call, and their dispatch.

pub mod args;
mod handlers;
pub mod paths;

use std::time::Duration;

use schemars::schema_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::ToolSettings,
    model::ToolCallRequest,
    sandbox::{OperationError, ProviderError, Sandbox, SandboxError},
};
use args::{BashArgs, GitCloneArgs, ListFilesArgs, ReadFileArgs, SearchFilesArgs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolName {
    GitClone,
    ListFiles,
    ReadFile,
    SearchFiles,
    Bash,
}

pub const TOOL_NAMES: [ToolName; 5] = [
    ToolName::GitClone,
    ToolName::ListFiles,
    ToolName::ReadFile,
    ToolName::SearchFiles,
    ToolName::Bash,
];

impl ToolName {
    /// Name exposed to the model.
    pub const fn identifier(self) -> &'static str {
        match self {
            ToolName::GitClone => "git_clone",
            ToolName::ListFiles => "list_files",
            ToolName::ReadFile => "read_file",
            ToolName::SearchFiles => "search_files",
            ToolName::Bash => "bash",
        }
    }

    /// Name used for the `Step:<name>` log context.
    pub const fn step_name(self) -> &'static str {
        match self {
            ToolName::GitClone => "git-clone",
            ToolName::ListFiles => "list-directory",
            ToolName::ReadFile => "read-file",
            ToolName::SearchFiles => "search-files",
            ToolName::Bash => "bash",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::GitClone => {
                "Clone a git repository into the workspace (shallow). Returns the target directory."
            }
            ToolName::ListFiles => {
                "List the entries of a directory relative to the workspace root."
            }
            ToolName::ReadFile => {
                "Read a UTF-8 text file, optionally restricted to an inclusive line range."
            }
            ToolName::SearchFiles => "Run a regex search (ripgrep-style) within the workspace.",
            ToolName::Bash => "Run a shell command from the workspace root and return its output.",
        }
    }

    pub fn json_schema(self) -> Value {
        let schema = match self {
            ToolName::GitClone => schema_for!(GitCloneArgs),
            ToolName::ListFiles => schema_for!(ListFilesArgs),
            ToolName::ReadFile => schema_for!(ReadFileArgs),
            ToolName::SearchFiles => schema_for!(SearchFilesArgs),
            ToolName::Bash => schema_for!(BashArgs),
        };
        serde_json::to_value(&schema).unwrap_or(Value::Null)
    }

    pub fn from_identifier(name: &str) -> Option<Self> {
        TOOL_NAMES.into_iter().find(|tool| tool.identifier() == name)
    }

    /// Tools that change sandbox state never run concurrently with anything else.
    pub const fn is_mutating(self) -> bool {
        matches!(self, ToolName::GitClone | ToolName::Bash)
    }
}

/// Tool-level failures. Everything except `Sandbox` is reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("clone failed: {0}")]
    CloneError(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("file {path} is {size} bytes, over the {limit} byte limit; read a line range instead")]
    FileTooLarge { path: String, size: u64, limit: u64 },
    #[error(
        "lines {start_line}-{end_line} of {path} already exceed the {limit} byte limit; request fewer lines"
    )]
    RangeTooLarge {
        path:       String,
        start_line: usize,
        end_line:   usize,
        limit:      u64,
    },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),
    #[error("command exited with status {code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    NonZeroExit {
        code:   i32,
        stdout: String,
        stderr: String,
    },
    #[error("sandbox provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Sandbox(SandboxError),
}

impl ToolError {
    /// The sandbox failure behind this error, if any. Those abort the step instead of
    /// going back to the model.
    pub fn fatal(&self) -> Option<&SandboxError> {
        match self {
            ToolError::Sandbox(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProviderError> for ToolError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(path) => ToolError::PathNotFound(path),
            ProviderError::Escape(path) => {
                ToolError::PathNotFound(format!("{path} (outside the workspace)"))
            }
            ProviderError::NotAFile(path) => ToolError::NotAFile(path),
            ProviderError::NotADirectory(path) => ToolError::NotADirectory(path),
            ProviderError::TooLarge { path, size, limit } => {
                ToolError::FileTooLarge { path, size, limit }
            }
            ProviderError::RangeTooLarge {
                path,
                start_line,
                end_line,
                limit,
            } => ToolError::RangeTooLarge {
                path,
                start_line,
                end_line,
                limit,
            },
            ProviderError::InvalidPattern(reason) => ToolError::InvalidQuery(reason),
            ProviderError::Timeout(after) => ToolError::CommandTimeout(after),
            other => ToolError::Provider(other.to_string()),
        }
    }
}

impl From<OperationError> for ToolError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Sandbox(err) => ToolError::Sandbox(err),
            OperationError::Provider(err) => err.into(),
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, raw: &str) -> Result<T, ToolError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw)
        .map_err(|err| ToolError::InvalidArguments(format!("{}: {err}", tool.identifier())))
}

/// Closed mapping from [`ToolName`] to its handler.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    settings: ToolSettings,
}

impl ToolRegistry {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    pub fn tools(&self) -> &'static [ToolName] {
        &TOOL_NAMES
    }

    /// Execute one requested call against `sandbox`.
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        call: &ToolCallRequest,
    ) -> Result<Value, ToolError> {
        let tool = ToolName::from_identifier(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        match tool {
            ToolName::GitClone => {
                handlers::git_clone(sandbox, &self.settings, parse_args(tool, &call.arguments)?)
                    .await
            }
            ToolName::ListFiles => {
                handlers::list_files(sandbox, parse_args(tool, &call.arguments)?).await
            }
            ToolName::ReadFile => {
                handlers::read_file(sandbox, &self.settings, parse_args(tool, &call.arguments)?)
                    .await
            }
            ToolName::SearchFiles => {
                handlers::search_files(sandbox, &self.settings, parse_args(tool, &call.arguments)?)
                    .await
            }
            ToolName::Bash => {
                handlers::bash(sandbox, &self.settings, parse_args(tool, &call.arguments)?).await
            }
        }
    }
}
