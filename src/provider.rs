//! Model Provider Abstraction
//!
//! A provider-agnostic chat interface with tool calling, one OpenAI-compatible HTTP client, and a
//! registry keyed by provider id. Feature code never calls a client directly; it goes through
//! [`crate::consent::GatedClient`].

use crate::error::{ErrorCode, ErrorInfo, Phase};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Provider configuration (`[providers.<id>]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub model: String,
    /// Endpoint root; defaults to the public OpenAI API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model is required".to_string());
        }
        if let Some(url) = &self.base_url {
            if reqwest::Url::parse(url).is_err() {
                return Err(format!("invalid base_url: {}", url));
            }
        }
        Ok(())
    }

    pub fn effective_base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL)
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Published tool schema handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Model provider client trait
#[async_trait]
pub trait ModelProviderClient: Send + Sync {
    /// Plain completion
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ErrorInfo>;

    /// Completion with tool calling
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ErrorInfo>;

    fn provider_id(&self) -> &str;

    fn model_id(&self) -> &str;

    /// Remote endpoint, checked against the egress allowlist. `None` for in-process clients.
    fn base_url(&self) -> Option<&str> {
        None
    }
}

// OpenAI-compatible wire structures
#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn role_to_string(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(message: &ChatMessage) -> Value {
    let mut wire = json!({
        "role": role_to_string(message.role),
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// Map an HTTP status to the engine taxonomy.
pub fn map_status(status: u16, body: &str, retry_after: Option<Duration>) -> ErrorInfo {
    let detail = format!("provider returned {}: {}", status, truncate(body, 300));
    match status {
        401 | 403 => ErrorInfo::new(ErrorCode::ProviderAuthFailed, Phase::Workshop, detail),
        429 | 500..=599 => {
            let info = ErrorInfo::new(ErrorCode::ProviderUnavailable, Phase::Workshop, detail);
            match retry_after {
                Some(hint) => info.with_retry_after(hint),
                None => info,
            }
        }
        _ => ErrorInfo::validation(Phase::Workshop, detail),
    }
}

fn map_transport_error(error: reqwest::Error) -> ErrorInfo {
    if error.is_timeout() || error.is_connect() {
        ErrorInfo::new(
            ErrorCode::NetworkUnavailable,
            Phase::Workshop,
            format!("network error: {}", error),
        )
    } else {
        ErrorInfo::new(
            ErrorCode::ProviderUnavailable,
            Phase::Workshop,
            format!("HTTP error: {}", error),
        )
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn build_provider_http_client() -> Result<Client, ErrorInfo> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(PROVIDER_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| {
            ErrorInfo::new(
                ErrorCode::ProviderUnavailable,
                Phase::Workshop,
                format!("Failed to create HTTP client: {}", e),
            )
        })
}

/// OpenAI-compatible chat completions client
pub struct OpenAiClient {
    client: Client,
    provider_id: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(
        provider_id: impl Into<String>,
        config: &ProviderConfig,
        api_key: Option<String>,
    ) -> Result<Self, ErrorInfo> {
        Ok(Self {
            client: build_provider_http_client()?,
            provider_id: provider_id.into(),
            model: config.model.clone(),
            api_key,
            base_url: config.effective_base_url().trim_end_matches('/').to_string(),
        })
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ErrorInfo> {
        let request = WireRequest {
            model: &self.model,
            messages: messages.iter().map(message_to_wire).collect(),
            tools: tools.iter().map(tool_to_wire).collect(),
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &body, retry_after)
                .with_provider(&self.provider_id, &self.model));
        }

        let wire: WireResponse = response.json().await.map_err(|e| {
            ErrorInfo::new(
                ErrorCode::ProviderUnavailable,
                Phase::Workshop,
                format!("Failed to parse response: {}", e),
            )
        })?;
        let choice = wire.choices.into_iter().next().ok_or_else(|| {
            ErrorInfo::new(
                ErrorCode::ProviderUnavailable,
                Phase::Workshop,
                "No choices in response",
            )
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = if call.function.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::String(call.function.arguments))
                };
                ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: choice.finish_reason,
        })
    }
}

#[async_trait]
impl ModelProviderClient for OpenAiClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ErrorInfo> {
        Ok(self.send(messages, &[]).await?.content)
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ErrorInfo> {
        self.send(messages, tools).await
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> Option<&str> {
        Some(&self.base_url)
    }
}

/// Provider clients keyed by provider id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an OpenAI-compatible client for every configured provider.
    pub fn from_config(configs: &HashMap<String, ProviderConfig>) -> Self {
        let mut registry = Self::new();
        for (id, config) in configs {
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            if config.api_key_env.is_some() && api_key.is_none() {
                warn!(provider_id = %id, "API key environment variable is not set");
            }
            match OpenAiClient::new(id.clone(), config, api_key) {
                Ok(client) => {
                    debug!(provider_id = %id, model = %config.model, "Provider registered");
                    registry.register(id.clone(), Arc::new(client));
                }
                Err(e) => warn!(provider_id = %id, error = %e, "Provider client unavailable"),
            }
        }
        registry
    }

    pub fn register(&mut self, provider_id: impl Into<String>, client: Arc<dyn ModelProviderClient>) {
        self.providers.insert(provider_id.into(), client);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn ModelProviderClient>, ErrorInfo> {
        self.providers.get(provider_id).cloned().ok_or_else(|| {
            ErrorInfo::new(
                ErrorCode::ProviderNotConfigured,
                Phase::Settings,
                format!("provider {:?} is not configured", provider_id),
            )
        })
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
