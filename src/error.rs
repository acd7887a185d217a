use thiserror::Error;

use crate::genai::GenAiError;
use crate::state_machine::TransitionError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LecternError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No course plan found for artifact {0}")]
    MissingPlan(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No job found for artifact {0}")]
    ArtifactNotFound(String),

    #[error("Result not found: {0}")]
    ResultNotFound(String),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Generative service error: {0}")]
    GenAi(#[from] GenAiError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LecternError {
    /// Setup failures are the caller's fault only when a referenced row is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LecternError::MissingPlan(_)
                | LecternError::JobNotFound(_)
                | LecternError::ArtifactNotFound(_)
                | LecternError::ResultNotFound(_)
        )
    }
}
