pub mod client;
pub mod error;
pub mod types;

pub use client::{ContentGenerator, GeminiClient};
pub use error::{FailureCategory, GenAiError};
pub use types::{Citation, GenerationRequest, GenerationResponse};
