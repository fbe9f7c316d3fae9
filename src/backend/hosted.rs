//! Hosted completion API backend (OpenAI-compatible `/chat/completions`)

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::BackendError;
use super::prompt::PromptMessage;
use super::tools::ToolSpec;
use super::{ModelReply, ReasoningBackend, ReplyToolCall};

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    arguments: Value,
}

#[derive(Clone)]
pub struct HostedBackend {
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl HostedBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            temperature,
            max_tokens,
            client,
        })
    }

    fn to_wire(messages: &[PromptMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|message| match &message.image {
                None => json!({"role": message.role.as_str(), "content": message.text}),
                Some(shot) => json!({
                    "role": message.role.as_str(),
                    "content": [
                        {"type": "text", "text": message.text},
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:{};base64,{}", shot.media_type(), shot.image_base64)
                            }
                        }
                    ]
                }),
            })
            .collect()
    }
}

/// Arguments arrive as a JSON string; some servers send the object directly
fn decode_arguments(name: &str, raw: Value) -> Result<Value, BackendError> {
    match raw {
        Value::String(text) if text.trim().is_empty() => Ok(json!({})),
        Value::String(text) => serde_json::from_str(&text).map_err(|e| {
            BackendError::Malformed(format!("arguments for '{}' are not valid JSON: {}", name, e))
        }),
        Value::Null => Ok(json!({})),
        other => Ok(other),
    }
}

#[async_trait]
impl ReasoningBackend for HostedBackend {
    fn name(&self) -> &'static str {
        "hosted"
    }

    async fn complete(
        &self,
        messages: &[PromptMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, BackendError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| json!({"type": "function", "function": tool}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": Self::to_wire(messages),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }

        let mut request = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %text, "hosted backend error");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let completion: CompletionResponse = serde_json::from_str(&text)?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Malformed("response has no choices".to_string()))?
            .message;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = decode_arguments(&call.function.name, call.function.arguments)?;
                Ok(ReplyToolCall {
                    name: call.function.name,
                    arguments,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        Ok(ModelReply {
            content: message.content.unwrap_or_default(),
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
    fn test_screenshot_becomes_data_url() {
        let messages = vec![PromptMessage {
            role: Role::User,
            text: "what now".to_string(),
            image: Some(Screenshot {
                image_base64: "QUJD".to_string(),
                width: 2,
                height: 2,
                format: "png".to_string(),
            }),
        }];
        let wire = HostedBackend::to_wire(&messages);
        assert_eq!(wire[0]["content"][0]["text"], "what now");
        assert_eq!(
            wire[0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn test_decode_arguments() {
        assert_eq!(
            decode_arguments("click", json!("{\"x\": 1}")).unwrap(),
            json!({"x": 1})
        );
        assert_eq!(decode_arguments("wait", json!({"seconds": 2})).unwrap(), json!({"seconds": 2}));
        assert_eq!(decode_arguments("x", json!("")).unwrap(), json!({}));
        assert!(matches!(
            decode_arguments("click", json!("{x: 1")),
            Err(BackendError::Malformed(_))
        ));
    }
}
