use crate::config::GeminiConfig;
use crate::errors::{GenerationError, GenerationResult};
use crate::models::ImagePayload;
use crate::utils::encode_base64;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// One image generation call: reference images first, then the instruction.
#[derive(Debug)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub images: Vec<&'a ImagePayload>,
}

/// The remote image generation API.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Streaming path. Resolves with the first image received and drops the
    /// rest of the stream; `None` when the stream ends without an image.
    async fn generate_streaming(
        &self,
        request: &GenerationRequest<'_>,
    ) -> GenerationResult<Option<ImagePayload>>;

    /// Single-shot path. A response without image data is `EmptyResponse`.
    async fn generate(&self, request: &GenerationRequest<'_>) -> GenerationResult<ImagePayload>;
}

pub struct GeminiClient {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Result<Self> {
        if config.api_key.is_none() {
            warn!("GEMINI_API_KEY is not set; requests will be sent without credentials");
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_http_client(client, config))
    }

    pub fn with_http_client(client: reqwest::Client, config: &GeminiConfig) -> Self {
        GeminiClient {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.image_model.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base, self.model, method)
    }

    fn post(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut request_builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(key) = &self.api_key {
            request_builder = request_builder.header("x-goog-api-key", key);
        }
        request_builder
    }
}

#[async_trait]
impl ImageBackend for GeminiClient {
    async fn generate_streaming(
        &self,
        request: &GenerationRequest<'_>,
    ) -> GenerationResult<Option<ImagePayload>> {
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.post(&url, &request_body(request)).send().await?;
        let response = ensure_success(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut events = 0usize;

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(event) = parse_sse_line(&line)? {
                    events += 1;
                    if let Some(image) = extract_image(&event)? {
                        debug!("Stream yielded an image after {} event(s)", events);
                        return Ok(Some(image));
                    }
                }
            }
        }

        if let Some(event) = parse_sse_line(&buffer)? {
            if let Some(image) = extract_image(&event)? {
                return Ok(Some(image));
            }
        }

        debug!("Stream ended after {} event(s) without image data", events);
        Ok(None)
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> GenerationResult<ImagePayload> {
        let url = self.endpoint("generateContent");
        let response = self.post(&url, &request_body(request)).send().await?;
        let response = ensure_success(response).await?;

        let response_text = response.text().await?;
        let value: Value = serde_json::from_str(&response_text)
            .map_err(|e| GenerationError::InvalidResponse(format!("response is not JSON: {}", e)))?;
        check_error_payload(&value)?;

        extract_image(&value)?.ok_or(GenerationError::EmptyResponse)
    }
}

pub fn request_body(request: &GenerationRequest<'_>) -> Value {
    let mut parts: Vec<Value> = request
        .images
        .iter()
        .map(|image| {
            json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": encode_base64(&image.data),
                }
            })
        })
        .collect();
    parts.push(json!({ "text": request.prompt }));

    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }],
        "generationConfig": {
            "responseModalities": ["IMAGE"],
        }
    })
}

async fn ensure_success(response: reqwest::Response) -> GenerationResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect());

    Err(GenerationError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Parse one server-sent-events line. Non-data lines and empty payloads yield `None`.
fn parse_sse_line(line: &[u8]) -> GenerationResult<Option<Value>> {
    let line = String::from_utf8_lossy(line);
    let payload = match line.trim().strip_prefix("data:") {
        Some(payload) => payload.trim(),
        None => return Ok(None),
    };
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| GenerationError::InvalidResponse(format!("bad stream event: {}", e)))?;
    check_error_payload(&value)?;
    Ok(Some(value))
}

/// Gemini reports some failures as an `error` object inside a 200 body or stream.
fn check_error_payload(value: &Value) -> GenerationResult<()> {
    let error = &value["error"];
    if error.is_null() {
        return Ok(());
    }
    let message = error["message"]
        .as_str()
        .or_else(|| error["status"].as_str())
        .unwrap_or("unknown error")
        .to_string();
    match error["code"].as_u64() {
        Some(code) => Err(GenerationError::Status {
            status: code as u16,
            message,
        }),
        None => Err(GenerationError::InvalidResponse(message)),
    }
}

/// First inline image across all candidates and parts, if any.
pub fn extract_image(response: &Value) -> GenerationResult<Option<ImagePayload>> {
    let candidates = match response["candidates"].as_array() {
        Some(candidates) => candidates,
        None => return Ok(None),
    };

    for candidate in candidates {
        let parts = match candidate["content"]["parts"].as_array() {
            Some(parts) => parts,
            None => continue,
        };
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"));
            let inline = match inline {
                Some(inline) => inline,
                None => continue,
            };
            let data = match inline["data"].as_str() {
                Some(data) if !data.is_empty() => data,
                _ => continue,
            };
            let mime_type = inline["mimeType"]
                .as_str()
                .or_else(|| inline["mime_type"].as_str())
                .unwrap_or("image/png");
            let bytes = general_purpose::STANDARD.decode(data).map_err(|e| {
                GenerationError::InvalidResponse(format!("image data is not base64: {}", e))
            })?;
            return Ok(Some(ImagePayload::new(mime_type, bytes)));
        }
    }
    Ok(None)
}
