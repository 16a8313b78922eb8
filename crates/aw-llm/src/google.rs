use async_trait::async_trait;
use aw_error::{Error, Result};
use serde_json::{json, Value};

use crate::provider::ProviderClient;
use crate::types::{ChunkCallback, GenerateRequest, LLMResponse, Role, TokenUsage, ToolCallRequest};

/// Speaks Google's `generateContent` shape: `contents` of `{role, parts}`
/// rather than OpenAI's flat `messages`, and `functionCall` parts instead
/// of a `tool_calls` array.
pub struct GoogleClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for GoogleClient {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

fn build_body(request: &GenerateRequest) -> Value {
    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": if m.role == Role::Assistant { "model" } else { "user" },
                "parts": [{"text": m.content}],
            })
        })
        .collect();

    let system_instruction: String = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut body = json!({ "contents": contents });
    if !system_instruction.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{"text": system_instruction}] });
    }
    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request.tools.iter().map(|t| json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })).collect::<Vec<_>>()
        }]);
    }
    body
}

fn parse_response(body: &str) -> Result<LLMResponse> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| Error::ProviderError { status: None, message: format!("bad JSON body: {e}") })?;

    if let Some(err) = parsed.get("error") {
        return Err(Error::ProviderError {
            status: err.get("code").and_then(Value::as_u64).map(|c| c as u16),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown Google error")
                .to_string(),
        });
    }

    let usage = parsed.get("usageMetadata").map(|u| TokenUsage {
        input_tokens: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
        output_tokens: u
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    });

    let parts = parsed
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for (idx, part) in parts.iter().enumerate() {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let arguments = call.get("args").cloned().unwrap_or(json!({}));
            tool_calls.push(ToolCallRequest {
                id: format!("google-call-{idx}"),
                name,
                arguments,
            });
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
impl ProviderClient for GoogleClient {
    async fn generate(&self, request: GenerateRequest) -> Result<LLMResponse> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, request.model
        );
        let response = self
            .http
            .post(url)
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
    fn parses_function_call_parts() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"functionCall": {"name": "search", "args": {"q": "rust"}}}]}}]
        })
        .to_string();
        match parse_response(&body).unwrap() {
            LLMResponse::ToolCalls { tool_calls, .. } => assert_eq!(tool_calls[0].name, "search"),
            _ => panic!("expected tool_calls"),
        }
    }
}
