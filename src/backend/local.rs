//! Local model runner backend (Ollama `/api/chat` with tools and images)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::BackendError;
use super::prompt::PromptMessage;
use super::tools::ToolSpec;
use super::{ModelReply, ReasoningBackend, ReplyToolCall};

/// A message in the `/api/chat` conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// Base64 images attached to this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
struct Tool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: &'a ToolSpec,
}

/// Response from `/api/chat` (non-streaming)
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Clone)]
pub struct LocalBackend {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl LocalBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the configured model is present in the runner's tag list
    pub async fn ensure_model(&self) -> Result<bool, BackendError> {
        let endpoint = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&endpoint).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let tags: TagsResponse = serde_json::from_str(&text)?;
        let wanted_latest = format!("{}:latest", self.model);
        Ok(tags
            .models
            .iter()
            .any(|tag| tag.name == self.model || tag.name == wanted_latest))
    }

    fn to_wire(messages: &[PromptMessage]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|message| ChatMessage {
                role: message.role.as_str().to_string(),
                content: message.text.clone(),
                images: message
                    .image
                    .as_ref()
                    .map(|shot| vec![shot.image_base64.clone()]),
                tool_calls: None,
            })
            .collect()
    }
}

#[async_trait]
impl ReasoningBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn complete(
        &self,
        messages: &[PromptMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, BackendError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let tools: Vec<Tool<'_>> = tools
            .iter()
            .map(|function| Tool {
                tool_type: "function",
                function,
            })
            .collect();

        let body = json!({
            "model": self.model,
            "messages": Self::to_wire(messages),
            "tools": tools,
            "stream": false,
            "options": {
                "temperature": self.temperature
            }
        });

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Err(BackendError::Malformed("empty response body".to_string()));
        }

        let chat: ChatResponse = serde_json::from_str(&text)?;
        let tool_calls = chat
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ReplyToolCall {
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        Ok(ModelReply {
            content: chat.message.content,
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::prompt::Role;
    use crate::protocol::Screenshot;

    #[test]
    fn test_images_attached_only_to_messages_with_screenshots() {
        let messages = vec![
            PromptMessage {
                role: Role::System,
                text: "sys".to_string(),
                image: None,
            },
            PromptMessage {
                role: Role::User,
                text: "look".to_string(),
                image: Some(Screenshot {
                    image_base64: "QUJD".to_string(),
                    width: 1,
                    height: 1,
                    format: "png".to_string(),
                }),
            },
        ];
        let wire = LocalBackend::to_wire(&messages);
        let encoded = serde_json::to_value(&wire).unwrap();
        assert!(encoded[0].get("images").is_none());
        assert_eq!(encoded[1]["images"][0], "QUJD");
        assert_eq!(encoded[1]["role"], "user");
    }

    #[test]
    fn test_response_with_native_tool_call() {
        let raw = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"click","arguments":{"x":1,"y":2}}}]},"done":true}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        let calls = response.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "click");
        assert_eq!(calls[0].function.arguments["y"], 2);
    }
}
