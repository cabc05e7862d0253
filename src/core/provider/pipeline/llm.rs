//! Text generation leg: OpenAI-compatible chat completions.
//!
//! - Endpoint: `POST {base_url}/chat/completions`
//! - Request/response, one call per AI turn

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{PipelineSettings, error_for_status};
use crate::core::provider::{
    END_CALL_TOOL, END_CALL_TOOL_DESCRIPTION, FunctionCall, ProviderError, ProviderResult,
    end_call_tool_parameters,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// What the model answered for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub text: Option<String>,
    pub function_calls: Vec<FunctionCall>,
    /// Assistant message to append to the history verbatim.
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct LlmLeg {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
}

impl LlmLeg {
    pub fn new(client: reqwest::Client, settings: &PipelineSettings) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", settings.llm_base_url.trim_end_matches('/')),
            api_key: settings.llm_api_key.clone(),
            model: settings.llm_model.clone(),
            temperature: settings.temperature,
        }
    }

    pub fn build_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "tools": [{
                "type": "function",
                "function": {
                    "name": END_CALL_TOOL,
                    "description": END_CALL_TOOL_DESCRIPTION,
                    "parameters": end_call_tool_parameters(),
                }
            }],
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> ProviderResult<AssistantReply> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.build_body(messages))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let response = error_for_status(response).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::SerializationError(e.to_string()))?;
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(ProviderError::ProviderError(
                "completion returned no choices".to_string(),
            ));
        };

        let message = choice.message;
        let text = message
            .content
            .clone()
            .filter(|t| !t.trim().is_empty());
        let function_calls = message
            .tool_calls
            .iter()
            .flatten()
            .map(|call| FunctionCall {
                call_id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            })
            .collect();

        Ok(AssistantReply {
            text,
            function_calls,
            message: Some(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_includes_end_call_tool() {
        let leg = LlmLeg::new(reqwest::Client::new(), &PipelineSettings::default());
        let body = leg.build_body(&[ChatMessage::system("be brief"), ChatMessage::user("hi")]);
        assert_eq!(body["tools"][0]["function"]["name"], END_CALL_TOOL);
        assert_eq!(body["messages"][1]["role"], "user");
        assert!(body["messages"][0].get("tool_calls").is_none());
    }

    #[test]
    fn test_tool_result_message() {
        let json = serde_json::to_value(ChatMessage::tool_result("call_7", "ok")).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_7");
    }

    #[test]
    fn test_parses_tool_call_message() {
        let message: ChatMessage = serde_json::from_str(
            r#"{"role":"assistant","content":null,"tool_calls":[{"id":"call_1","type":"function","function":{"name":"end_call","arguments":"{\"reason\":\"done\"}"}}]}"#,
        )
        .unwrap();
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "end_call");
    }
}
