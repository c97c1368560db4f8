//! OpenAI-compatible chat-completions provider.
//!
//! Non-streaming: the agent loop consumes whole turns, and staged sends
//! make token-level streaming pointless here.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use companion_chat::{Content, ContentPart};
use companion_core::{Message, Role, ToolCallRequest, ToolSchema};

use crate::provider::{GenerateRequest, Generation, LlmError, LlmProvider, Result};

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn chat(&self, body: serde_json::Value) -> Result<ChatCompletion> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(LlmError::Api(format!("HTTP {status}: {text}")));
        }

        Ok(response.json::<ChatCompletion>().await?)
    }

    fn wire_messages(system: &str, messages: &[Message]) -> Vec<serde_json::Value> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire.push(json!({ "role": "system", "content": system }));
        }
        wire.extend(messages.iter().map(wire_message));
        wire
    }
}

fn wire_message(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut value = json!({ "role": role, "content": wire_content(&message.content) });
    if let Some(tool_calls) = &message.tool_calls {
        value["tool_calls"] = json!(tool_calls
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
            .collect::<Vec<_>>());
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        value["tool_call_id"] = json!(tool_call_id);
    }
    value
}

fn wire_content(content: &Content) -> serde_json::Value {
    match content {
        Content::Text(text) => json!(text),
        Content::Multipart(parts) => json!(parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::ImageUrl { url } => {
                    json!({ "type": "image_url", "image_url": { "url": url } })
                }
            })
            .collect::<Vec<_>>()),
    }
}

fn wire_tools(tools: &[ToolSchema]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate_with_tools(&self, request: GenerateRequest) -> Result<Generation> {
        let mut body = json!({
            "model": request.model,
            "messages": Self::wire_messages(&request.system, &request.messages),
            "temperature": request.temperature,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(wire_tools(&request.tools));
        }
        if let Some(max_tokens) = request.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let completion = self.chat(body).await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyCompletion)?;

        let text = choice.message.content.clone().unwrap_or_default();
        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                ToolCallRequest {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        let assistant = Message::assistant(
            text.clone(),
            (!tool_calls.is_empty()).then(|| tool_calls.clone()),
        );

        Ok(Generation {
            text,
            tool_calls,
            messages: vec![assistant],
        })
    }

    async fn generate_object(
        &self,
        model: &str,
        schema: &serde_json::Value,
        prompt: &str,
        temperature: f32,
    ) -> Result<serde_json::Value> {
        let body = json!({
            "model": model,
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "Respond with a single JSON object matching this schema, no prose:\n{schema}"
                    ),
                },
                { "role": "user", "content": prompt },
            ],
            "temperature": temperature,
            "response_format": { "type": "json_object" },
        });

        let completion = self.chat(body.clone()).await?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyCompletion)?;

        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(first_error) => {
                // One repair attempt: re-ask with the parse error attached.
                log::debug!("object generation parse failed, retrying: {first_error}");
                let mut repair = body;
                if let Some(messages) = repair["messages"].as_array_mut() {
                    messages.push(json!({
                        "role": "user",
                        "content": format!(
                            "The previous output was not valid JSON ({first_error}). \
                             Emit only the corrected JSON object."
                        ),
                    }));
                }
                let completion = self.chat(repair).await?;
                let text = completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or(LlmError::EmptyCompletion)?;
                serde_json::from_str(&text)
                    .map_err(|e| LlmError::ObjectGeneration(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(messages: Vec<Message>) -> GenerateRequest {
        GenerateRequest {
            model: "test-model".to_string(),
            system: "be brief".to_string(),
            messages,
            tools: Vec::new(),
            temperature: 0.3,
            max_output_tokens: None,
        }
    }

    #[tokio::test]
    async fn parses_text_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "hello there" } }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        let generation = provider
            .generate_with_tools(request(vec![Message::user("hi")]))
            .await
            .unwrap();

        assert_eq!(generation.text, "hello there");
        assert!(!generation.has_tool_calls());
    }

    #[tokio::test]
    async fn parses_tool_calls_with_json_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "type": "function",
                        "function": { "name": "fetch_url", "arguments": "{\"url\":\"https://example.com\"}" }
                    }]
                } }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        let generation = provider
            .generate_with_tools(request(vec![Message::user("fetch it")]))
            .await
            .unwrap();

        assert_eq!(generation.tool_calls.len(), 1);
        assert_eq!(generation.tool_calls[0].name, "fetch_url");
        assert_eq!(
            generation.tool_calls[0].arguments["url"],
            "https://example.com"
        );
    }

    #[tokio::test]
    async fn api_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        let error = provider
            .generate_with_tools(request(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(error, LlmError::Api(_)));
    }
}
