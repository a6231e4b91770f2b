//! Chat-completion client abstraction.
//!
//! `ChatModel` is the seam every pipeline node talks through. The production
//! implementation, [`OpenAiChat`], speaks the OpenAI-compatible
//! `/chat/completions` wire format and supports a forced function call for
//! the final arbiter. Tests swap in stubs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;

/// Errors talking to the LLM endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("API key not configured")]
    MissingApiKey,
}

/// Who authored a message in the run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A transcript line written by one of the participants.
    Human,
    /// An instruction prompt.
    System,
    /// Output produced by a judge, the distributor or the arbiter.
    Ai,
}

impl Role {
    /// Role name on the chat-completions wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Human => "user",
            Self::System => "system",
            Self::Ai => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::System => write!(f, "system"),
            Self::Ai => write!(f, "ai"),
        }
    }
}

/// A role-tagged line of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: Role::Ai,
            content: content.into(),
        }
    }
}

/// A function the model is forced to call instead of answering in free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument payload.
    pub parameters: Value,
}

/// A function invocation returned by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text of the arguments, exactly as the model produced it.
    pub arguments: String,
}

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// When set, the model must call this function.
    pub function: Option<FunctionSpec>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            function: None,
        }
    }

    pub fn with_function(mut self, function: FunctionSpec) -> Self {
        self.function = Some(function);
        self
    }

    /// The leading system prompt, if any.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// What the model sent back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    /// Free-text content; empty when the model only returned a function call.
    pub content: String,
    pub function_call: Option<FunctionCall>,
    pub tokens_used: Option<u64>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn function_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            }),
            ..Default::default()
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: Option<f64>,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Build the JSON body for a request.
    pub fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.wire_name(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });

        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }

        if let Some(ref function) = request.function {
            body["tools"] = json!([{
                "type": "function",
                "function": {
                    "name": function.name,
                    "description": function.description,
                    "parameters": function.parameters,
                }
            }]);
            body["tool_choice"] = json!({
                "type": "function",
                "function": {"name": function.name}
            });
        }

        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        let start = Instant::now();
        let body = self.request_body(&request);

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let resp_json: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        let reply = parse_reply(&resp_json)?;
        debug!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            tokens = ?reply.tokens_used,
            function_call = reply.function_call.is_some(),
            "chat completion finished"
        );
        Ok(reply)
    }
}

/// Extract content and any function call from a chat-completions response.
pub fn parse_reply(resp_json: &Value) -> Result<ChatReply, LlmError> {
    let message = resp_json["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .filter(|m| m.is_object())
        .ok_or_else(|| LlmError::Decode("response has no choices[0].message".to_string()))?;

    let content = message["content"].as_str().unwrap_or("").to_string();

    // Modern tool_calls first, then the legacy single function_call field.
    let call = message["tool_calls"]
        .get(0)
        .map(|tc| &tc["function"])
        .or_else(|| message.get("function_call"))
        .filter(|f| f.is_object());

    let function_call = match call {
        Some(f) => Some(FunctionCall {
            name: f["name"].as_str().unwrap_or("").to_string(),
            arguments: match &f["arguments"] {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            },
        }),
        None => None,
    };

    Ok(ChatReply {
        content,
        function_call,
        tokens_used: resp_json["usage"]["total_tokens"].as_u64(),
    })
}
