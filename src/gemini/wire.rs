//! generateContent request/response bodies and the strict response parser.

use super::GeminiError;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ══════════════════════════════════════════════════════════════════════════════
// REQUEST
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub(crate) struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub(crate) enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text { text: s.into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<String>,
}

// ══════════════════════════════════════════════════════════════════════════════
// RESPONSE
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    text: Option<String>,
    inline_data: Option<Blob>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ApiError,
}

/// One usable piece of a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

/// Parse a successful generateContent body into ordered parts across all candidates.
///
/// Thought parts and non-image inline data are skipped. A body carrying an
/// `error` object is a provider failure; a prompt block with no candidates is
/// reported as `Blocked`.
pub fn parse_response(body: &str) -> Result<Vec<ResponsePart>, GeminiError> {
    let response: GenerateContentResponse =
        serde_json::from_str(body).map_err(|e| GeminiError::Decode(e.to_string()))?;

    if let Some(err) = response.error {
        return Err(GeminiError::Api {
            status: 200,
            message: err.message,
        });
    }

    if response.candidates.is_empty() {
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(GeminiError::Blocked(reason));
        }
    }

    let mut parts = Vec::new();
    for candidate in response.candidates {
        let Some(content) = candidate.content else {
            debug!("Gemini: candidate without content (finish reason {:?})", candidate.finish_reason);
            continue;
        };
        for part in content.parts {
            if part.thought {
                continue;
            }
            if let Some(text) = part.text {
                parts.push(ResponsePart::Text(text));
            }
            if let Some(blob) = part.inline_data {
                if blob.mime_type.to_ascii_lowercase().starts_with("image/") {
                    parts.push(ResponsePart::InlineImage {
                        mime_type: blob.mime_type,
                        data: blob.data,
                    });
                } else {
                    debug!("Gemini: skipping inline data of type {}", blob.mime_type);
                }
            }
        }
    }
    Ok(parts)
}
