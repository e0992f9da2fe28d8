//! Gemini integration module
//!
//! Builds generateContent requests from a channel's history and the current
//! prompt (optionally with the attached image inlined), calls the model and
//! turns the reply into text plus inline images.

mod wire;

pub use wire::{parse_response, ResponsePart};

use crate::config::{BotConfig, GenerationSettings};
use crate::images::{self, ImagePayload};
use crate::logging::ellipse;
use crate::session::Turn;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use wire::{Blob, Content, ErrorEnvelope, GenerateContentRequest, GenerationConfig, Part};

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("Gemini API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("prompt blocked by provider: {0}")]
    Blocked(String),

    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Everything needed for one model call. Built per message, never stored.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image_url: Option<String>,
    pub history: Vec<Turn>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub payload: ImagePayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResult {
    pub text: String,
    pub images: Vec<InlineImage>,
}

impl GenerationResult {
    /// Concatenate text parts in order; keep images in order.
    pub fn from_parts(parts: Vec<ResponsePart>) -> Self {
        let mut result = Self::default();
        for part in parts {
            match part {
                ResponsePart::Text(t) => result.text.push_str(&t),
                ResponsePart::InlineImage { mime_type, data } => result.images.push(InlineImage {
                    mime_type,
                    payload: ImagePayload::Base64(data),
                }),
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.is_empty()
    }
}

/// Anything that can answer a `GenerationRequest`.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, GeminiError>;
}

/// Ordered content list: history turns first, then the current user turn
/// (text plus optional inline image). The system prompt is returned separately
/// for the `systemInstruction` field.
pub(crate) fn build_contents(request: &GenerationRequest, inline: Option<Blob>) -> (Option<Content>, Vec<Content>) {
    let system_instruction = request
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Content {
            role: None,
            parts: vec![Part::text(s)],
        });

    let mut contents: Vec<Content> = request
        .history
        .iter()
        .filter(|t| !t.content.is_empty())
        .map(|t| Content {
            role: Some(t.role.as_str().to_string()),
            parts: vec![Part::text(t.content.clone())],
        })
        .collect();

    let mut parts = vec![Part::text(request.prompt.clone())];
    if let Some(blob) = inline {
        parts.push(Part::InlineData { inline_data: blob });
    }
    contents.push(Content {
        role: Some("user".to_string()),
        parts,
    });

    (system_instruction, contents)
}

fn format_model_name(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// Gemini client
pub struct GeminiClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    generation: GenerationSettings,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(
        api_base: &str,
        api_key: &str,
        model: &str,
        generation: GenerationSettings,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        info!("Gemini: Initializing client for model {} at {}", model, api_base);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("gemini-relay/{}", crate::config::Config::version()))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            generation,
            timeout,
        })
    }

    pub fn from_config(config: &BotConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.gemini_api_base,
            &config.gemini_api_key,
            &config.gemini_model,
            config.generation.clone(),
            config.request_timeout,
        )
    }

    fn generate_url(&self) -> String {
        format!("{}/{}:generateContent", self.api_base, format_model_name(&self.model))
    }

    fn map_reqwest(&self, e: reqwest::Error) -> GeminiError {
        if e.is_timeout() {
            GeminiError::Timeout(self.timeout)
        } else if e.is_decode() {
            GeminiError::Decode(e.to_string())
        } else {
            GeminiError::Network(e.to_string())
        }
    }

    /// Download an attachment and inline it as base64. The MIME type comes from
    /// Content-Type when it names an image, else from the bytes themselves.
    pub(crate) async fn fetch_inline_image(&self, url: &str) -> Result<Blob, GeminiError> {
        let response = self.client.get(url).send().await.map_err(|e| self.map_reqwest(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeminiError::Network(format!("attachment download returned HTTP {}", status)));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());
        let bytes = response.bytes().await.map_err(|e| self.map_reqwest(e))?;

        let mime_type = match content_type {
            Some(ct) if ct.starts_with("image/") => ct,
            _ => images::sniff_mime(&bytes)
                .map(str::to_string)
                .ok_or_else(|| GeminiError::Decode("attachment is not an image".to_string()))?,
        };
        debug!("Gemini: fetched attachment ({} bytes, {})", bytes.len(), mime_type);
        Ok(Blob {
            mime_type,
            data: STANDARD.encode(&bytes),
        })
    }
}

#[async_trait]
impl ContentGenerator for GeminiClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, GeminiError> {
        let inline = match request.image_url.as_deref() {
            Some(url) => match self.fetch_inline_image(url).await {
                Ok(blob) => Some(blob),
                Err(e) => {
                    warn!("Gemini: attachment fetch failed, continuing text-only: {}", e);
                    None
                }
            },
            None => None,
        };

        let (system_instruction, contents) = build_contents(&request, inline);
        let body = GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: self.generation.temperature,
                top_p: self.generation.top_p,
                top_k: self.generation.top_k,
                max_output_tokens: self.generation.max_output_tokens,
                response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            },
        };

        info!(
            "Gemini: sending {} content entries (prompt: {})",
            body.contents.len(),
            ellipse(&request.prompt, 200)
        );
        let start_time = Instant::now();
        let response = self
            .client
            .post(self.generate_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_reqwest(e))?;
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|env| env.error.message)
                .unwrap_or_else(|_| ellipse(&text, 300));
            return Err(GeminiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let result = GenerationResult::from_parts(parse_response(&text)?);
        info!(
            "Gemini: reply in {:?} ({} chars, {} images)",
            start_time.elapsed(),
            result.text.chars().count(),
            result.images.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn test_client(base: &str, timeout: Duration) -> GeminiClient {
        GeminiClient::new(base, "test-key", "gemini-test", GenerationSettings::default(), timeout).unwrap()
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_fn(24, 24, |x, y| image::Rgb([x as u8 * 9, y as u8 * 9, 77]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn contents_order_history_then_current_turn() {
        let request = GenerationRequest {
            prompt: "and now?".into(),
            image_url: None,
            history: vec![Turn::user("hi", None), Turn::model("hello"), Turn::model("")],
            system_prompt: Some("be brief".into()),
        };
        let (system, contents) = build_contents(&request, None);
        assert_eq!(system.unwrap().parts, vec![Part::text("be brief")]);
        let roles: Vec<_> = contents.iter().map(|c| c.role.clone().unwrap()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(contents[2].parts, vec![Part::text("and now?")]);
    }

    #[test]
    fn blank_system_prompt_omitted_and_image_inlined() {
        let request = GenerationRequest {
            prompt: "what is this".into(),
            system_prompt: Some("   ".into()),
            ..Default::default()
        };
        let blob = Blob {
            mime_type: "image/jpeg".into(),
            data: "AAAA".into(),
        };
        let (system, contents) = build_contents(&request, Some(blob.clone()));
        assert!(system.is_none());
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].parts[1], Part::InlineData { inline_data: blob });
    }

    #[test]
    fn model_name_formatting() {
        assert_eq!(format_model_name("gemini-2.0-flash-exp"), "models/gemini-2.0-flash-exp");
        assert_eq!(format_model_name("models/gemini-pro"), "models/gemini-pro");
    }

    #[test]
    fn result_from_parts_concatenates() {
        let r = GenerationResult::from_parts(vec![
            ResponsePart::Text("a".into()),
            ResponsePart::InlineImage {
                mime_type: "image/png".into(),
                data: "xx".into(),
            },
            ResponsePart::Text("b".into()),
        ]);
        assert_eq!(r.text, "ab");
        assert_eq!(r.images.len(), 1);
        assert!(!r.is_empty());
        assert!(GenerationResult::default().is_empty());
    }

    #[tokio::test]
    async fn generate_parses_text_and_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [
                    {"text": "A cat"},
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo"}}
                ]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&format!("{}/v1beta", server.uri()), Duration::from_secs(5));
        let result = client
            .generate(GenerationRequest {
                prompt: "draw a cat".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.text, "A cat");
        assert_eq!(result.images[0].mime_type, "image/png");
    }

    #[tokio::test]
    async fn attachment_is_inlined() {
        let server = MockServer::start().await;
        let png = png_bytes();
        Mock::given(method("GET"))
            .and(path("/attachments/cat.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png.clone()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-test:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "ok"}]}}]
            })))
            .mount(&server)
            .await;

        let client = test_client(&format!("{}/v1beta", server.uri()), Duration::from_secs(5));
        client
            .generate(GenerationRequest {
                prompt: "what is this".into(),
                image_url: Some(format!("{}/attachments/cat.png", server.uri())),
                ..Default::default()
            })
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let post = requests.iter().find(|r| r.method.as_str() == "POST").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
        let inline = &body["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(inline["mimeType"], "image/png");
        assert_eq!(STANDARD.decode(inline["data"].as_str().unwrap()).unwrap(), png);
    }

    #[tokio::test]
    async fn failed_attachment_degrades_to_text_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attachments/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-test:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "text only"}]}}]
            })))
            .mount(&server)
            .await;

        let client = test_client(&format!("{}/v1beta", server.uri()), Duration::from_secs(5));
        let result = client
            .generate(GenerationRequest {
                prompt: "look".into(),
                image_url: Some(format!("{}/attachments/missing.png", server.uri())),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.text, "text only");

        let requests = server.received_requests().await.unwrap();
        let post = requests.iter().find(|r| r.method.as_str() == "POST").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
        assert_eq!(body["contents"][0]["parts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn http_error_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"code": 403, "message": "permission denied", "status": "PERMISSION_DENIED"}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(5));
        let err = client
            .generate(GenerationRequest {
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        match err {
            GeminiError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "permission denied");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"candidates": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_millis(200));
        let err = client
            .generate(GenerationRequest {
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GeminiError::Timeout(_)));
    }
}
