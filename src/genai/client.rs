use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::error::{classify, FailureCategory, GenAiError};
use super::types::{GenerationRequest, GenerationResponse, WireErrorBody, WireRequest, WireResponse};

const API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Anything that can turn a [`GenerationRequest`] into a response.
///
/// The engine only talks to this trait; tests script it per model.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, GenAiError>;
}

pub struct GeminiClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self, GenAiError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, GenAiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(180))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }
}

#[async_trait]
impl ContentGenerator for GeminiClient {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, GenAiError> {
        let body = WireRequest::from_request(req);
        let response = self
            .client
            .post(self.endpoint(&req.model))
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let raw = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            let message = serde_json::from_str::<WireErrorBody>(&raw)
                .map(|b| {
                    if b.error.status.is_empty() {
                        b.error.message
                    } else {
                        format!("{}: {}", b.error.status, b.error.message)
                    }
                })
                .unwrap_or(raw);
            return Err(error_for_status(status, message));
        }

        let raw = response.text().await?;
        let wire: WireResponse =
            serde_json::from_str(&raw).map_err(|e| GenAiError::Parse(e.to_string()))?;
        Ok(wire.into_response(&req.model))
    }
}

fn error_for_status(status: StatusCode, message: String) -> GenAiError {
    match classify(Some(status.as_u16()), &message) {
        FailureCategory::RateLimited => GenAiError::RateLimited { message },
        FailureCategory::Overloaded => GenAiError::Overloaded { message },
        _ => GenAiError::ApiError {
            status: status.as_u16(),
            message,
        },
    }
}
