use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// How a workflow interacts with its human counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    /// Multi-turn: waits for a reply after every turn.
    #[default]
    Workflow,
    /// Runs exactly one turn and completes.
    Stateless,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Workflow => "workflow",
            AgentMode::Stateless => "stateless",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "workflow" => Ok(AgentMode::Workflow),
            "stateless" => Ok(AgentMode::Stateless),
            other => Err(format!("unknown agent mode '{other}'")),
        }
    }
}

/// A tool call as requested by the model, before it is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id:        String,
    pub name:      String,
    /// Raw JSON arguments exactly as the model produced them.
    pub arguments: String,
    /// The call needs every earlier call of the same response to have finished.
    #[serde(default)]
    pub depends_on_previous: bool,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id:                  id.into(),
            name:                name.into(),
            arguments:           arguments.to_string(),
            depends_on_previous: false,
        }
    }
}

/// Decision returned by the model for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub final_answer: Option<String>,
    pub tool_calls:   Vec<ToolCallRequest>,
}

impl ModelResponse {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            final_answer: Some(text.into()),
            tool_calls:   Vec::new(),
        }
    }

    pub fn tools(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            final_answer: None,
            tool_calls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: Value },
    Failure { reason: String },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }
}

/// A resolved tool call. Immutable once recorded in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id:   String,
    pub tool_name: String,
    pub arguments: Value,
    pub result:    ToolOutcome,
}

impl ToolInvocation {
    /// Body of the tool message handed back to the model.
    pub fn render_for_model(&self) -> String {
        match &self.result {
            ToolOutcome::Success { output } => output.to_string(),
            ToolOutcome::Failure { reason } => json!({
                "type": "tool_error",
                "tool": self.tool_name,
                "arguments": self.arguments,
                "message": reason,
            })
            .to_string(),
        }
    }
}

/// One entry of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content:    Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool(ToolInvocation),
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }
}

/// Trim leading/trailing whitespace and collapse interior whitespace.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Shorten `text` to at most `max_chars` characters for log previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    let cleaned = clean_text(text);
    if cleaned.chars().count() <= max_chars {
        return cleaned;
    }
    let mut shortened: String = cleaned.chars().take(max_chars.saturating_sub(3)).collect();
    shortened.push_str("...");
    shortened
}
