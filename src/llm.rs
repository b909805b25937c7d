use std::env;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    constants::{DEFAULT_MODEL, DEFAULT_TEMPERATURE},
    model::{Message, ModelResponse, ToolCallRequest},
    tools::ToolName,
};

/// Errors surfaced when interacting with the LLM backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("missing OPENAI_API_KEY in environment")]
    MissingApiKey,
    #[error("LLM call failed: {0}")]
    RequestFailed(String),
    #[error("failed to parse LLM response: {0}")]
    InvalidResponse(String),
}

/// The model collaborator: given the transcript and the available tools, decide the next
/// action. Implementations treat the transcript as read-only.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn respond(
        &self,
        history: &[Message],
        tools: &[ToolName],
    ) -> Result<ModelResponse, LlmError>;
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client:      Client<OpenAIConfig>,
    model:       String,
    temperature: f32,
}

impl OpenAiModel {
    /// Build from `OPENAI_API_KEY`, `OPENAI_API_BASE` and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| LlmError::MissingApiKey)?;
        let model = env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Ok(url) = env::var("OPENAI_API_BASE") {
            config = config.with_api_base(url);
        }

        Ok(Self {
            client: Client::with_config(config),
            model,
            temperature: DEFAULT_TEMPERATURE,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn tool_specs(tools: &[ToolName]) -> Result<Vec<ChatCompletionTool>, LlmError> {
        tools
            .iter()
            .map(|tool| {
                let function = FunctionObjectArgs::default()
                    .name(tool.identifier())
                    .description(tool.description())
                    .parameters(tool.json_schema())
                    .build()
                    .map_err(|err| LlmError::RequestFailed(err.to_string()))?;
                ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(function)
                    .build()
                    .map_err(|err| LlmError::RequestFailed(err.to_string()))
            })
            .collect()
    }
}

fn build_err(err: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed(err.to_string())
}

/// Translate the transcript into chat-completions request messages.
pub fn to_request_messages(history: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    history
        .iter()
        .map(|message| -> Result<ChatCompletionRequestMessage, LlmError> {
            Ok(match message {
                Message::System { content } => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content.clone())
                    .build()
                    .map_err(build_err)?
                    .into(),
                Message::User { content } => ChatCompletionRequestUserMessageArgs::default()
                    .content(content.clone())
                    .build()
                    .map_err(build_err)?
                    .into(),
                Message::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    if let Some(content) = content {
                        builder.content(content.clone());
                    }
                    if !tool_calls.is_empty() {
                        builder.tool_calls(
                            tool_calls
                                .iter()
                                .map(|call| ChatCompletionMessageToolCall {
                                    id:       call.id.clone(),
                                    r#type:   ChatCompletionToolType::Function,
                                    function: FunctionCall {
                                        name:      call.name.clone(),
                                        arguments: call.arguments.clone(),
                                    },
                                })
                                .collect::<Vec<_>>(),
                        );
                    }
                    builder.build().map_err(build_err)?.into()
                }
                Message::Tool(invocation) => ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(invocation.call_id.clone())
                    .content(invocation.render_for_model())
                    .build()
                    .map_err(build_err)?
                    .into(),
            })
        })
        .collect()
}

#[async_trait]
impl ModelClient for OpenAiModel {
    async fn respond(
        &self,
        history: &[Message],
        tools: &[ToolName],
    ) -> Result<ModelResponse, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(to_request_messages(history)?)
            .temperature(self.temperature)
            .tools(Self::tool_specs(tools)?)
            .build()
            .map_err(build_err)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(build_err)?;

        let message = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("chat completion returned no choices".into()))?
            .message;

        debug!(
            has_content = message.content.as_ref().map(|c| !c.trim().is_empty()),
            tool_call_count = message.tool_calls.as_ref().map(|c| c.len()),
            refusal = ?message.refusal,
            "llm.response_received"
        );

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCallRequest {
                id:                  call.id,
                name:                call.function.name,
                arguments:           call.function.arguments,
                depends_on_previous: false,
            })
            .collect();

        Ok(ModelResponse {
            final_answer: message.content.filter(|c| !c.trim().is_empty()),
            tool_calls,
        })
    }
}
