//! Categorization of a message into the closed label set.
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{SyncError, SyncResult};
use crate::types::Category;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Upper bound on body characters sent to the model.
const MAX_BODY_CHARS: usize = 8_000;

const SYSTEM_INSTRUCTION: &str = "You are an email classification assistant. Classify the email \
(subject and body) into exactly one of these categories:\n\
- Interested: the sender shows clear interest in a product, service, or job application, asks \
positive questions, or wants to move forward.\n\
- Meeting Booked: the email confirms a scheduled meeting, interview, or call (calendar links, \
specific times, \"meeting confirmed\").\n\
- Not Interested: the sender declines, states they are not interested, or unsubscribes.\n\
- Spam: unsolicited promotion, phishing, or irrelevant junk.\n\
- Out of Office: an automated reply saying the person is away.\n\
Answer with a JSON object whose \"category\" field holds the label.";

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("code fence regex compiles")
});

/// External labelling capability. Implementations return an error for any
/// failure or output outside the closed set; callers decide the fallback.
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize(&self, subject: &str, body: &str) -> SyncResult<Category>;
}

/// Gemini `generateContent` with a JSON response schema.
pub struct GeminiCategorizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
struct CategoryAnswer {
    category: String,
}

impl GeminiCategorizer {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("building classifier HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    fn request_body(subject: &str, body: &str) -> Value {
        let body: String = body.chars().take(MAX_BODY_CHARS).collect();
        let labels: Vec<&str> = Category::CLASSIFIABLE.iter().map(|c| c.label()).collect();
        let safety: Vec<Value> = [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .iter()
        .map(|c| json!({ "category": c, "threshold": "BLOCK_NONE" }))
        .collect();

        json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
            "contents": [{
                "role": "user",
                "parts": [{ "text": format!("Subject: {subject}\n\nBody: {body}") }]
            }],
            "safetySettings": safety,
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "category": { "type": "STRING", "format": "enum", "enum": labels }
                    },
                    "required": ["category"]
                }
            }
        })
    }
}

#[async_trait]
impl Categorizer for GeminiCategorizer {
    async fn categorize(&self, subject: &str, body: &str) -> SyncResult<Category> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SyncError::Classification("no API key configured".into()))?;

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let res = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&Self::request_body(subject, body))
            .send()
            .await
            .map_err(|e| SyncError::Classification(format!("request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(SyncError::Classification(format!(
                "model returned status {}",
                res.status()
            )));
        }

        let parsed: GenerateResponse = res
            .json()
            .await
            .map_err(|e| SyncError::Classification(format!("decoding response: {e}")))?;

        let text = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| SyncError::Classification("response carried no text".into()))?;

        let category = parse_category(&text)?;
        debug!(category = %category, "Model categorized message");
        Ok(category)
    }
}

/// Decode `{"category": "..."}`, optionally wrapped in a markdown code fence.
pub fn parse_category(text: &str) -> SyncResult<Category> {
    let payload = CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);

    let answer: CategoryAnswer = serde_json::from_str(payload)
        .map_err(|e| SyncError::Classification(format!("malformed answer {text:?}: {e}")))?;

    Category::from_label(&answer.category).ok_or_else(|| {
        SyncError::Classification(format!("unknown category {:?}", answer.category))
    })
}
