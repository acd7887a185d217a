//! External resource validation for curated sources.
//!
//! [`ResourceValidator`] resolves redirector links, fetches the page and
//! decides whether it is usable. Page-level judgement (soft 404s, paywalls)
//! goes through the [`PageClassifier`] trait. The default
//! [`PatternClassifier`] is a phrase list: it misses phrasings and languages
//! it does not know, so a rejection is reliable but an acceptance is not
//! proof the page is good. Swap in a better classifier where that matters.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Serialize;

use crate::config::ValidatorConfig;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

static NON_CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)>")
        .expect("static pattern")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("static pattern"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));

static SOFT_NOT_FOUND: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<title[^>]*>[^<]*\b404\b[^<]*</title>",
        r"(?i)page not found",
        r"(?i)p[aá]gina no encontrada",
        r"(?i)p[aá]gina n[aã]o encontrada",
        r"(?i)page introuvable",
        r"(?i)seite nicht gefunden",
        r"(?i)no se (ha )?encontr[oó] la p[aá]gina",
        r"(?i)(this|the) page (does not|doesn't|could not|can't|cannot) (exist|be found)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static PAYWALL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)sign in to (continue|read)",
        r"(?i)log in to (continue|read)",
        r"(?i)subscribe to (read|continue)",
        r"(?i)already a subscriber",
        r"(?i)inicia sesi[oó]n para (continuar|leer)",
        r"(?i)suscr[ií]bete para (leer|continuar|seguir)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Outcome of validating one URL. Never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub accepted: bool,
    pub reason: String,
    pub content_length: usize,
    /// URL after redirector resolution.
    pub final_url: String,
}

impl Validation {
    pub fn accept(final_url: &str, content_length: usize) -> Self {
        Self {
            accepted: true,
            reason: "ok".to_string(),
            content_length,
            final_url: final_url.to_string(),
        }
    }

    pub fn reject(final_url: &str, reason: impl Into<String>, content_length: usize) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            content_length,
            final_url: final_url.to_string(),
        }
    }
}

/// Seam used by the source pipeline.
#[async_trait]
pub trait ResourceCheck: Send + Sync {
    async fn check(&self, url: &str) -> Validation;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    Usable,
    SoftNotFound(String),
    Paywalled(String),
}

pub trait PageClassifier: Send + Sync {
    /// `markup` is the raw body, `text` the body with markup stripped.
    fn classify(&self, markup: &str, text: &str) -> PageVerdict;
}

/// Phrase-list classifier for soft 404s and paywalls.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    paywall_max_body_chars: usize,
}

impl PatternClassifier {
    pub fn new(paywall_max_body_chars: usize) -> Self {
        Self {
            paywall_max_body_chars,
        }
    }
}

impl PageClassifier for PatternClassifier {
    fn classify(&self, markup: &str, text: &str) -> PageVerdict {
        if let Some(hit) = SOFT_NOT_FOUND.iter().find_map(|re| re.find(markup)) {
            return PageVerdict::SoftNotFound(hit.as_str().trim().to_string());
        }
        if text.chars().count() < self.paywall_max_body_chars
            && let Some(hit) = PAYWALL.iter().find_map(|re| re.find(text))
        {
            return PageVerdict::Paywalled(hit.as_str().to_string());
        }
        PageVerdict::Usable
    }
}

/// Plain text of an HTML document.
pub fn strip_markup(markup: &str) -> String {
    let without_code = NON_CONTENT.replace_all(markup, " ");
    let without_tags = TAG.replace_all(&without_code, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

pub struct ResourceValidator {
    client: Client,
    config: ValidatorConfig,
    classifier: Box<dyn PageClassifier>,
}

impl ResourceValidator {
    pub fn new(config: ValidatorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(config.redirect_timeout_secs.max(1)))
            .build()?;
        let classifier = Box::new(PatternClassifier::new(config.paywall_max_body_chars));
        Ok(Self {
            client,
            config,
            classifier,
        })
    }

    pub fn with_classifier(mut self, classifier: Box<dyn PageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    fn is_redirector(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.config
            .redirector_hosts
            .iter()
            .any(|h| host == h || host.ends_with(&format!(".{h}")))
    }

    /// Final URL behind a redirector. Keeps the original on any failure.
    async fn resolve(&self, url: &str) -> String {
        let result = self
            .client
            .head(url)
            .timeout(Duration::from_secs(self.config.redirect_timeout_secs))
            .send()
            .await;
        match result {
            Ok(response) => {
                let resolved = response.url().to_string();
                tracing::debug!(%url, %resolved, "resolved redirector");
                resolved
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "redirect resolution failed; keeping original");
                url.to_string()
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Validation, reqwest::Error> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.fetch_timeout_secs))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Ok(Validation::reject(url, format!("HTTP {}", status.as_u16()), 0));
        }

        let markup = response.text().await?;
        let text = strip_markup(&markup);
        let length = text.chars().count();

        match self.classifier.classify(&markup, &text) {
            PageVerdict::SoftNotFound(hit) => {
                return Ok(Validation::reject(url, format!("soft 404: {hit}"), length));
            }
            PageVerdict::Paywalled(hit) => {
                return Ok(Validation::reject(url, format!("paywall: {hit}"), length));
            }
            PageVerdict::Usable => {}
        }

        if length < self.config.min_content_chars {
            return Ok(Validation::reject(
                url,
                format!(
                    "content too short: {length} < {} chars",
                    self.config.min_content_chars
                ),
                length,
            ));
        }

        Ok(Validation::accept(url, length))
    }
}

#[async_trait]
impl ResourceCheck for ResourceValidator {
    async fn check(&self, url: &str) -> Validation {
        let target = if self.is_redirector(url) {
            self.resolve(url).await
        } else {
            url.to_string()
        };
        match self.fetch(&target).await {
            Ok(validation) => validation,
            Err(e) => Validation::reject(&target, e.to_string(), 0),
        }
    }
}
