//! Tipos de erro para o cliente do serviço generativo.
//!
//! Define [`GenAiError`] com variantes para rate limiting, sobrecarga,
//! erros da API, erros de rede e respostas ilegíveis, e a classificação
//! [`FailureCategory`] usada pelo controlador de retentativas.

use thiserror::Error;

/// Erros que podem ocorrer ao chamar o serviço generativo.
#[derive(Debug, Error)]
pub enum GenAiError {
    /// O servidor retornou HTTP 429 ou uma mensagem de cota esgotada.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// O servidor retornou HTTP 503 ou informou sobrecarga do modelo.
    #[error("model overloaded: {message}")]
    Overloaded { message: String },

    /// Qualquer outro erro HTTP (ex.: 400 requisição inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// O corpo da resposta não pôde ser decodificado.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Categoria de falha que decide o próximo passo do controlador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Mesmo modelo, depois do backoff; o recurso limitado é a conta.
    RateLimited,
    /// Próximo modelo, após uma pausa curta.
    Overloaded,
    /// Saída sem resultado estruturado; próximo modelo.
    Malformed,
    /// Demais falhas transitórias; tratadas como sobrecarga.
    Other,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCategory::RateLimited => write!(f, "rate-limited"),
            FailureCategory::Overloaded => write!(f, "overloaded"),
            FailureCategory::Malformed => write!(f, "malformed-output"),
            FailureCategory::Other => write!(f, "transient"),
        }
    }
}

impl GenAiError {
    /// Classifica o erro; rate limit é verificado antes de sobrecarga.
    pub fn category(&self) -> FailureCategory {
        match self {
            GenAiError::RateLimited { .. } => FailureCategory::RateLimited,
            GenAiError::Overloaded { .. } => FailureCategory::Overloaded,
            GenAiError::ApiError { status, message } => classify(Some(*status), message),
            GenAiError::NetworkError(err) => classify(None, &err.to_string()),
            GenAiError::Parse(_) => FailureCategory::Malformed,
        }
    }
}

/// Classificação por status HTTP e pelo texto da mensagem.
pub fn classify(status: Option<u16>, message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    if status == Some(429)
        || lower.contains("rate limit")
        || lower.contains("quota")
        || lower.contains("resource_exhausted")
    {
        FailureCategory::RateLimited
    } else if status == Some(503) || lower.contains("overloaded") || lower.contains("unavailable")
    {
        FailureCategory::Overloaded
    } else {
        FailureCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = GenAiError::RateLimited {
            message: "quota exceeded".into(),
        };
        assert_eq!(err.to_string(), "rate limited: quota exceeded");
    }

    #[test]
    fn api_error_display() {
        let err = GenAiError::ApiError {
            status: 401,
            message: "API key not valid".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): API key not valid");
    }

    #[test]
    fn classification_by_status() {
        assert_eq!(classify(Some(429), "too many"), FailureCategory::RateLimited);
        assert_eq!(classify(Some(503), "try later"), FailureCategory::Overloaded);
        assert_eq!(classify(Some(400), "bad request"), FailureCategory::Other);
    }

    #[test]
    fn classification_by_message() {
        let err = GenAiError::ApiError {
            status: 500,
            message: "You exceeded your current quota".into(),
        };
        assert_eq!(err.category(), FailureCategory::RateLimited);

        let err = GenAiError::ApiError {
            status: 500,
            message: "The model is overloaded. Please try again later.".into(),
        };
        assert_eq!(err.category(), FailureCategory::Overloaded);
    }

    #[test]
    fn rate_limit_wins_when_both_match() {
        assert_eq!(
            classify(Some(503), "overloaded: rate limit reached"),
            FailureCategory::RateLimited
        );
    }

    #[test]
    fn parse_error_is_malformed() {
        assert_eq!(
            GenAiError::Parse("eof".into()).category(),
            FailureCategory::Malformed
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GenAiError>();
    }
}
