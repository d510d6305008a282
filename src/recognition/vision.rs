//! Vision-model backend: OpenRouter chat completions with the certificate image inlined.

use super::{RecognitionError, RecognitionService, ScanImage};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter client asking a vision model to read a registration certificate.
#[derive(Clone)]
pub struct VisionClient {
    client: Client,
    api_key: String,
    model: String,
    prompt: String,
}

impl VisionClient {
    /// Create a new client, reading the API key from OPENROUTER_API_KEY.
    pub fn from_env(
        client: Client,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENROUTER_API_KEY environment variable not set"))?;

        Ok(Self {
            client,
            api_key,
            model: model.into(),
            prompt: prompt.into(),
        })
    }

    async fn send_request(&self, request: ChatCompletionRequest) -> Result<String, RecognitionError> {
        debug!("Sending request to OpenRouter: model={}", request.model);

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(status.as_u16(), &body));
        }

        let response: ChatCompletionResponse = response.json().await?;

        if let Some(usage) = &response.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl RecognitionService for VisionClient {
    fn name(&self) -> &str {
        "vision"
    }

    async fn recognize(&self, image: &ScanImage) -> Result<Value, RecognitionError> {
        info!(
            "VisionClient: reading {} ({} bytes) with {}",
            image.filename,
            image.data.len(),
            self.model
        );

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user_with_image(&self.prompt, image)],
            max_tokens: Some(1024),
        };

        let reply = self.send_request(request).await?;
        debug!("Raw model reply length: {} chars", reply.len());
        Ok(reply_to_value(&reply))
    }
}

/// OpenRouter error bodies can echo request details; they go to the log only.
fn provider_error(status: u16, body: &str) -> RecognitionError {
    warn!("OpenRouter returned {}: {}", status, body);
    RecognitionError::Provider { status }
}

/// Pull the JSON object out of a model reply.
///
/// Takes the outermost `{...}` span, which also strips markdown fences. A reply
/// without a parseable object is kept as free text so the regex fallbacks can
/// still read it.
fn reply_to_value(reply: &str) -> Value {
    let span = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&reply[start..=end]),
        _ => None,
    };

    if let Some(json) = span {
        match serde_json::from_str::<Value>(json) {
            Ok(value) => return value,
            Err(e) => warn!("Model reply is not valid JSON: {}", e),
        }
    }

    if reply.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::json!({ "text": reply })
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
}

impl Message {
    /// User message with the prompt and one base64-encoded image.
    fn user_with_image(text: &str, image: &ScanImage) -> Self {
        let data_url = format!("data:{};base64,{}", image.mime_type, BASE64.encode(&image.data));
        Self {
            role: "user",
            content: vec![
                ContentPart::Text {
                    text: text.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
            ],
        }
    }
}
