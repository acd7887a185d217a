//! Configuração do LECTERN carregada a partir de `lectern.toml`.
//!
//! A struct [`LecternConfig`] contém todos os parâmetros do motor de lotes.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `GEMINI_API_KEY`, `LECTERN_STORE` e `LECTERN_BIND`
//! têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::backoff::BackoffPolicy;
use crate::error::LecternError;

/// Configuração de nível superior carregada de `lectern.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LecternConfig {
    /// Chave da API do serviço generativo.
    pub api_key: String,
    /// URL base da API generativa (sobrescrita nos testes).
    pub api_base_url: String,
    /// Modelo primário de cada job.
    pub active_model: String,
    /// Modelo de fallback tentado após o primário.
    pub fallback_model: String,
    /// Modelo "estável" tentado por último. Vazio para omitir.
    pub stable_model: String,

    /// Quantidade de lições por lote.
    pub batch_size: usize,
    /// Atraso entre lições do mesmo lote.
    pub inter_item_delay_ms: u64,
    /// Atraso entre lotes (também o ponto de checagem de cancelamento).
    pub inter_batch_delay_ms: u64,
    /// Pausa curta antes de trocar para o próximo modelo.
    pub model_switch_delay_ms: u64,
    /// Passadas externas do controlador de retentativas por lição.
    pub max_retry_passes: u32,
    /// Passadas extras que re-agrupam apenas as lições que falharam.
    pub extra_failed_passes: u32,
    /// Limite de iterações por lição antes de `BLOCKED`.
    pub iteration_cap: u32,
    /// Máximo de resultados aceitos por lição.
    pub max_results_per_item: usize,

    pub backoff: BackoffConfig,
    pub validator: ValidatorConfig,

    /// Arquivo JSON usado pelo store persistente.
    pub store_path: PathBuf,
    /// Endereço de escuta do servidor HTTP.
    pub bind_addr: String,
    /// Formato de log: "text" ou "json".
    pub log_format: String,
}

/// Parâmetros do backoff exponencial com jitter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Atraso base. Zero deriva a base de `inter_batch_delay_ms`.
    pub base_ms: u64,
    pub jitter_ms: u64,
    pub cap_ms: u64,
}

/// Parâmetros do validador de recursos externos.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub redirect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Mínimo de caracteres de texto (sem markup) para aceitar uma página.
    pub min_content_chars: usize,
    /// Indicadores de paywall só contam abaixo deste tamanho de texto.
    pub paywall_max_body_chars: usize,
    /// Hosts tratados como redirecionadores (resolvidos antes do GET).
    pub redirector_hosts: Vec<String>,
}

impl Default for LecternConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            active_model: "gemini-2.5-pro".to_string(),
            fallback_model: "gemini-2.5-flash".to_string(),
            stable_model: "gemini-2.0-flash".to_string(),
            batch_size: 3,
            inter_item_delay_ms: 2_000,
            inter_batch_delay_ms: 10_000,
            model_switch_delay_ms: 2_000,
            max_retry_passes: 3,
            extra_failed_passes: 2,
            iteration_cap: 3,
            max_results_per_item: 5,
            backoff: BackoffConfig::default(),
            validator: ValidatorConfig::default(),
            store_path: PathBuf::from("lectern-store.json"),
            bind_addr: "0.0.0.0:8080".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 30_000,
            jitter_ms: 5_000,
            cap_ms: 300_000,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            redirect_timeout_secs: 8,
            fetch_timeout_secs: 10,
            min_content_chars: 500,
            paywall_max_body_chars: 5_000,
            redirector_hosts: vec![
                "vertexaisearch.cloud.google.com".to_string(),
                "bit.ly".to_string(),
                "t.co".to_string(),
                "goo.gl".to_string(),
                "tinyurl.com".to_string(),
                "lnkd.in".to_string(),
            ],
        }
    }
}

impl LecternConfig {
    /// Carrega a configuração de `lectern.toml` no diretório atual.
    pub fn load() -> Result<Self, LecternError> {
        Self::load_from(Path::new("lectern.toml"))
    }

    /// Carrega a configuração do caminho fornecido.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self, LecternError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<LecternConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("GEMINI_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }
        if let Ok(store) = std::env::var("LECTERN_STORE")
            && !store.is_empty()
        {
            config.store_path = PathBuf::from(store);
        }
        if let Ok(bind) = std::env::var("LECTERN_BIND")
            && !bind.is_empty()
        {
            config.bind_addr = bind;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que o motor não consegue executar.
    pub fn validate(&self) -> Result<(), LecternError> {
        if self.batch_size == 0 {
            return Err(LecternError::Config("batch_size must be at least 1".into()));
        }
        if self.active_model.trim().is_empty() {
            return Err(LecternError::Config("active_model must not be empty".into()));
        }
        if self.max_retry_passes == 0 {
            return Err(LecternError::Config(
                "max_retry_passes must be at least 1".into(),
            ));
        }
        if self.iteration_cap == 0 {
            return Err(LecternError::Config("iteration_cap must be at least 1".into()));
        }
        Ok(())
    }

    /// Falha de configuração quando não há credencial para o serviço generativo.
    pub fn require_api_key(&self) -> Result<&str, LecternError> {
        if self.api_key.trim().is_empty() {
            return Err(LecternError::Config(
                "GEMINI_API_KEY is not set and api_key is empty".into(),
            ));
        }
        Ok(&self.api_key)
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn model_switch_delay(&self) -> Duration {
        Duration::from_millis(self.model_switch_delay_ms)
    }

    /// Política de backoff; com `base_ms = 0` a base vem do atraso entre lotes.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let jitter = Duration::from_millis(self.backoff.jitter_ms);
        let cap = Duration::from_millis(self.backoff.cap_ms);
        if self.backoff.base_ms == 0 {
            BackoffPolicy::from_batch_delay(self.inter_batch_delay(), jitter, cap)
        } else {
            BackoffPolicy::new(Duration::from_millis(self.backoff.base_ms), jitter, cap)
        }
    }

    /// Modelo estável, se configurado.
    pub fn stable_model(&self) -> Option<&str> {
        let stable = self.stable_model.trim();
        (!stable.is_empty()).then_some(stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = LecternConfig::default();
        assert_eq!(config.active_model, "gemini-2.5-pro");
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.max_retry_passes, 3);
        assert_eq!(config.iteration_cap, 3);
        assert_eq!(config.backoff.base_ms, 30_000);
        assert_eq!(config.validator.min_content_chars, 500);
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "key-123"
            batch_size = 5

            [backoff]
            cap_ms = 60000

            [validator]
            min_content_chars = 800
        "#;
        let config: LecternConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "key-123");
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.backoff.cap_ms, 60_000);
        assert_eq!(config.backoff.base_ms, 30_000);
        assert_eq!(config.validator.min_content_chars, 800);
        assert_eq!(config.validator.fetch_timeout_secs, 10);
        assert_eq!(config.fallback_model, "gemini-2.5-flash");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lectern.toml");
        std::fs::write(&path, "batch_size = 7\nstable_model = \"\"\n").unwrap();
        let config = LecternConfig::load_from(&path).unwrap();
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.stable_model(), None);
    }

    #[test]
    fn load_rejects_zero_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lectern.toml");
        std::fs::write(&path, "batch_size = 0\n").unwrap();
        assert!(LecternConfig::load_from(&path).is_err());
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let config = LecternConfig::default();
        let err = config.require_api_key().unwrap_err();
        assert!(matches!(err, LecternError::Config(_)));
    }

    #[test]
    fn zero_base_derives_backoff_from_batch_delay() {
        let config = LecternConfig {
            inter_batch_delay_ms: 4_000,
            backoff: BackoffConfig {
                base_ms: 0,
                jitter_ms: 0,
                cap_ms: 60_000,
            },
            ..Default::default()
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.delay_with_jitter(0, Duration::ZERO), Duration::from_secs(4));
    }
}
