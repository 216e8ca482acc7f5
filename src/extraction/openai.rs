/// OpenAI-compatible chat model
///
/// Calls `{base_url}/chat/completions` with json_object response format.
/// Works against Groq, OpenAI or any server exposing the same API; requires
/// LLMSERVICE_API_KEY.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatModel, ExtractionError};

const TEMPERATURE: f32 = 0.1;
const SEED: u64 = 1000;

/// Request body for the Chat Completions API
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    seed: u64,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

/// Response from the Chat Completions API
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAIChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAIChatModel {
    /// Create a new OpenAIChatModel.
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. `https://api.groq.com/openai/v1`
    /// * `api_key` - Bearer token (must be non-empty)
    /// * `model` - Model name
    ///
    /// # Errors
    /// Returns `ExtractionError::NotConfigured` if api_key is empty.
    pub fn new(base_url: &str, api_key: String, model: String) -> Result<Self, ExtractionError> {
        if api_key.trim().is_empty() {
            return Err(ExtractionError::NotConfigured(
                "LLMSERVICE_API_KEY is required for the chat model".to_string(),
            ));
        }

        Ok(OpenAIChatModel {
            client: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractionError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: TEMPERATURE,
            seed: SEED,
            response_format: ResponseFormat { format_type: "json_object" },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtractionError::Generation(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ExtractionError::Api { status, message: body });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Generation(format!("Failed to parse chat response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::Generation("Chat service returned no content".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::Role;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_sends_json_mode_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "llama3-8b-8192",
                "seed": 1000,
                "response_format": {"type": "json_object"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\": true}"}}]}"#)
            .create_async()
            .await;

        let model = OpenAIChatModel::new(
            &format!("{}/v1/", server.url()),
            "sk-test".to_string(),
            "llama3-8b-8192".to_string(),
        )
        .unwrap();
        let reply = model.complete(&[ChatMessage::new(Role::User, "hi")]).await.unwrap();

        assert_eq!(reply, r#"{"ok": true}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_api_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("Rate limit reached")
            .create_async()
            .await;

        let model = OpenAIChatModel::new(&server.url(), "k".to_string(), "m".to_string()).unwrap();
        let err = model.complete(&[ChatMessage::new(Role::User, "hi")]).await.unwrap_err();

        assert!(matches!(err, ExtractionError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_empty_choices_is_generation_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let model = OpenAIChatModel::new(&server.url(), "k".to_string(), "m".to_string()).unwrap();
        let err = model.complete(&[]).await.unwrap_err();

        assert!(matches!(err, ExtractionError::Generation(_)));
    }

    #[test]
    fn test_missing_api_key_is_not_configured() {
        let result = OpenAIChatModel::new("https://api.groq.com/openai/v1", "  ".to_string(), "m".to_string());
        assert!(matches!(result, Err(ExtractionError::NotConfigured(_))));
    }
}
