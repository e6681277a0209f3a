//! Region detection through an external vision model.
//!
//! The model is asked for a bare JSON array of regions. Its reply is free-form
//! text, so parsing runs in two stages: the raw text is reduced to an optional
//! JSON array (code fences stripped, anything unparsable yields `None`), and
//! each entry is then validated into a [`DetectedRegion`]. Neither stage is an
//! error: a model failure or a malformed reply degrades to an empty list.

use crate::config::DetectorConfig;
use crate::models::{BoundingBox, DetectedRegion, RegionKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Instruction sent alongside every image.
pub const DETECTION_PROMPT: &str = r#"Analyze this image and detect important regions like faces, text, and objects.
You must respond with ONLY a valid JSON array. Do not include any markdown formatting or explanation.
The response should be a raw JSON array with this exact structure:
[
    {
        "type": "face|text|object",
        "confidence": 0.0-1.0,
        "bbox": {
            "x": number (percentage of image width),
            "y": number (percentage of image height),
            "width": number (percentage of image width),
            "height": number (percentage of image height)
        },
        "description": "brief description of what was detected"
    }
]
Important: Your entire response must be valid JSON. Do not wrap it in code blocks or markdown."#;

/// Finds salient regions in an image.
///
/// Implementations never fail: anything that goes wrong yields an empty list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegionDetector: Send + Sync {
    async fn detect(&self, image: &[u8], mime_type: &str) -> Vec<DetectedRegion>;
}

/// Detector backed by the Gemini `generateContent` endpoint
pub struct GeminiDetector {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GeminiDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build vision model HTTP client")?;

        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        );

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    /// Send the image and return the model's reply text
    async fn request_text(&self, image: &[u8], mime_type: &str) -> Result<String> {
        let request = GenerateContentRequest::for_image(image, mime_type, DETECTION_PROMPT);

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .context("Failed to call vision model")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Vision model returned {}: {}", status, truncate(&body, 500));
        }

        let reply: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to decode vision model response")?;

        reply
            .text()
            .context("Vision model response contained no text")
    }
}

#[async_trait]
impl RegionDetector for GeminiDetector {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn detect(&self, image: &[u8], mime_type: &str) -> Vec<DetectedRegion> {
        match self.request_text(image, mime_type).await {
            Ok(text) => parse_regions(&text),
            Err(e) => {
                let error = format!("{e:#}");
                warn!(error = %error, "Region detection failed, continuing without regions");
                Vec::new()
            }
        }
    }
}

/// Reduce a model reply to its validated regions
pub fn parse_regions(text: &str) -> Vec<DetectedRegion> {
    let Some(entries) = decode_payload(text) else {
        return Vec::new();
    };

    let total = entries.len();
    let regions: Vec<DetectedRegion> = entries.iter().filter_map(validate_region).collect();

    debug!(
        total = total,
        valid = regions.len(),
        "Parsed detected regions"
    );

    regions
}

/// Strip optional markdown code fences around the payload
pub fn strip_code_fences(text: &str) -> &str {
    let fenced = text
        .split_once("```json")
        .or_else(|| text.split_once("```"));

    match fenced {
        Some((_, rest)) => rest.split("```").next().unwrap_or(rest).trim(),
        None => text.trim(),
    }
}

/// First stage: raw text to a JSON array, if there is one
fn decode_payload(text: &str) -> Option<Vec<Value>> {
    let payload = strip_code_fences(text);

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Array(entries)) => Some(entries),
        Ok(other) => {
            warn!(kind = json_kind(&other), "Vision model reply is not a JSON array");
            None
        }
        Err(e) => {
            warn!(
                error = %e,
                reply = %truncate(payload, 200),
                "Vision model reply is not valid JSON"
            );
            None
        }
    }
}

/// Second stage: keep an entry only if it has a non-empty type and all bbox
/// fields are numbers
fn validate_region(entry: &Value) -> Option<DetectedRegion> {
    let object = entry.as_object()?;

    let kind = RegionKind::parse(object.get("type")?.as_str()?)?;

    let bbox = object.get("bbox")?.as_object()?;
    let bbox = BoundingBox {
        x: bbox.get("x")?.as_f64()?,
        y: bbox.get("y")?.as_f64()?,
        width: bbox.get("width")?.as_f64()?,
        height: bbox.get("height")?.as_f64()?,
    };

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    let description = object
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(DetectedRegion {
        kind,
        confidence,
        bbox,
        description,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<RequestContent>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    InlineData { inline_data: InlineData },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

impl GenerateContentRequest {
    fn for_image(image: &[u8], mime_type: &str, prompt: &str) -> Self {
        Self {
            contents: vec![RequestContent {
                parts: vec![
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: mime_type.to_string(),
                            data: STANDARD.encode(image),
                        },
                    },
                    RequestPart::Text {
                        text: prompt.to_string(),
                    },
                ],
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect();

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
