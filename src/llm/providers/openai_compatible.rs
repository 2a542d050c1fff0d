use async_trait::async_trait;
use futures_util::StreamExt;

use crate::errors::ModelError;
use crate::llm::provider::ModelClient;
use crate::llm::sse_parser;
use crate::llm::types::{CallConfig, ChatMessage, StreamChunkKind};

pub struct OpenAiCompatibleProvider {
    id: String,
    endpoint: String,
    api_key: String,
    call: CallConfig,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    /// `api_base` is the API root (e.g. `https://host/v1`); `/chat/completions` is appended.
    pub fn new(id: String, api_base: &str, api_key: String, call: CallConfig) -> Self {
        Self {
            id,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key,
            call,
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "model": self.call.model,
            "messages": messages,
            "stream": self.call.stream,
            "temperature": self.call.temperature,
            "top_p": self.call.top_p,
            "max_tokens": self.call.max_tokens,
        });

        tracing::debug!(
            provider = %self.id,
            model = %self.call.model,
            stream = self.call.stream,
            messages = messages.len(),
            "sending model request"
        );
        tracing::trace!(body = %sanitized_body(&body), "request body (base64 omitted)");

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let err_body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), err_body));
        }

        let content = if self.call.stream {
            self.handle_stream(response).await?
        } else {
            self.handle_json(response).await?
        };

        if content.trim().is_empty() {
            return Err(ModelError::InvalidResponse("empty completion".into()));
        }
        Ok(content)
    }
}

impl OpenAiCompatibleProvider {
    /// Accumulates `content` deltas until `[DONE]` or end of body.
    async fn handle_stream(&self, response: reqwest::Response) -> Result<String, ModelError> {
        let mut byte_stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut reasoning_len = 0usize;

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result.map_err(transport_error)?;
            pending.extend_from_slice(&bytes);

            // Split on raw newlines so multi-byte characters never straddle a chunk.
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(chunk) = sse_parser::parse_sse_line(line)? {
                    match chunk.kind {
                        StreamChunkKind::Content => content.push_str(&chunk.content),
                        StreamChunkKind::Reasoning => reasoning_len += chunk.content.len(),
                        StreamChunkKind::Done => break 'stream,
                    }
                }
            }
        }

        tracing::info!(
            provider = %self.id,
            content_len = content.len(),
            reasoning_len,
            "model stream complete"
        );
        Ok(content)
    }

    async fn handle_json(&self, response: reqwest::Response) -> Result<String, ModelError> {
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(format!("body is not JSON: {e}")))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelError::InvalidResponse("no choices[0].message.content".into()))?
            .to_string();

        tracing::info!(provider = %self.id, content_len = content.len(), "model JSON response received");
        Ok(content)
    }
}

/// 408, 429 and 5xx are transient; any other non-success status is a rejection.
fn classify_status(status: u16, body: String) -> ModelError {
    match status {
        429 => ModelError::RateLimited(format!("{status}: {body}")),
        408 | 500..=599 => ModelError::Unavailable(format!("{status}: {body}")),
        _ => ModelError::Rejected { status, body },
    }
}

fn transport_error(e: reqwest::Error) -> ModelError {
    ModelError::Unavailable(e.to_string())
}

/// Copy of the request with image payloads replaced, for logging only.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.pointer_mut("/image_url/url") {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}
