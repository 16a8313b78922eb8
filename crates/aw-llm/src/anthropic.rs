use async_trait::async_trait;
use aw_error::{Error, Result};
use serde_json::{json, Value};

use crate::provider::ProviderClient;
use crate::types::{ChunkCallback, GenerateRequest, LLMResponse, Role, TokenUsage, ToolCallRequest};

/// Speaks Anthropic's Messages API shape: a `system` string separate from
/// the `messages` array, and a `content` array of typed blocks in the
/// response rather than a single string.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://api.anthropic.com/v1".to_string(),
        }
    }
}

fn build_body(request: &GenerateRequest) -> Value {
    let system: String = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n\n");

    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                "content": m.content,
            })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "system": system,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(4096),
    });
    if !request.tools.is_empty() {
        body["tools"] = json!(
            request
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>()
        );
    }
    body
}

fn parse_response(body: &str) -> Result<LLMResponse> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| Error::ProviderError { status: None, message: format!("bad JSON body: {e}") })?;

    if let Some(err) = parsed.get("error") {
        return Err(Error::ProviderError {
            status: None,
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown Anthropic error")
                .to_string(),
        });
    }

    let usage = parsed.get("usage").map(|u| TokenUsage {
        input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
    });

    let blocks = parsed
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let arguments = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(ToolCallRequest { id, name, arguments });
            }
            _ => {}
        }
    }

    if !tool_calls.is_empty() {
        return Ok(LLMResponse::ToolCalls {
            tool_calls,
            content: if text.is_empty() { None } else { Some(text) },
            usage,
        });
    }
    Ok(LLMResponse::Text { content: text, usage })
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    async fn generate(&self, request: GenerateRequest) -> Result<LLMResponse> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .json(&build_body(&request))
            .send()
            .await
            .map_err(|e| Error::ProviderError { status: None, message: e.to_string() })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::ProviderError { status: Some(status.as_u16()), message: e.to_string() })?;
        if !status.is_success() {
            return Err(Error::ProviderError { status: Some(status.as_u16()), message: text });
        }
        parse_response(&text)
    }

    async fn generate_streaming(
        &self,
        request: GenerateRequest,
        on_chunk: ChunkCallback,
    ) -> Result<LLMResponse> {
        let response = self.generate(request).await?;
        if let LLMResponse::Text { content, .. } = &response {
            on_chunk(content);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_blocks() {
        let body = json!({
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 3, "output_tokens": 1}
        })
        .to_string();
        match parse_response(&body).unwrap() {
            LLMResponse::Text { content, .. } => assert_eq!(content, "hello"),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn parses_tool_use_blocks() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "rust"}}]
        })
        .to_string();
        match parse_response(&body).unwrap() {
            LLMResponse::ToolCalls { tool_calls, .. } => assert_eq!(tool_calls[0].name, "search"),
            _ => panic!("expected tool_calls"),
        }
    }
}
