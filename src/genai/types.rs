//! Tipos de dados para requisições e respostas do serviço generativo.
//!
//! [`GenerationRequest`] e [`GenerationResponse`] são o contrato interno usado
//! pelo motor. Os tipos `Wire*` espelham o formato JSON do endpoint
//! `models/{model}:generateContent` e só são usados pelo cliente HTTP.

use serde::{Deserialize, Serialize};

/// Uma requisição estruturada para um lote de lições.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Identificador do modelo a ser usado (ex.: "gemini-2.5-pro").
    pub model: String,
    /// Instrução de sistema com o formato de resposta esperado.
    pub system_instruction: String,
    /// Lições do lote serializadas como array JSON.
    pub items: serde_json::Value,
    /// Liga a ferramenta de busca ("search grounding").
    pub grounding: bool,
}

/// Resposta do serviço generativo: texto livre mais citações de grounding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Texto gerado, possivelmente com JSON cercado por ```.
    pub text: String,
    /// Fontes suplementares devolvidas pela busca.
    pub citations: Vec<Citation>,
    /// Modelo que gerou a resposta.
    pub model: String,
}

/// Uma citação de grounding (URL + título).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
}

/// Corpo da requisição `generateContent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub system_instruction: WireContent,
    pub contents: Vec<WireContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

/// Um conteúdo (papel + partes de texto).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WirePart {
    #[serde(default)]
    pub text: Option<String>,
}

/// Corpo da resposta `generateContent`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub candidates: Vec<WireCandidate>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCandidate {
    #[serde(default)]
    pub content: WireContent,
    #[serde(default)]
    pub grounding_metadata: Option<WireGrounding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGrounding {
    #[serde(default)]
    pub grounding_chunks: Vec<WireChunk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireChunk {
    #[serde(default)]
    pub web: Option<WireWeb>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireWeb {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub title: String,
}

/// Envelope de erro retornado pela API (`{"error": {...}}`).
#[derive(Debug, Clone, Deserialize)]
pub struct WireErrorBody {
    pub error: WireError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

impl WireRequest {
    /// Monta o corpo da API a partir da requisição interna.
    pub fn from_request(req: &GenerationRequest) -> Self {
        let tools = if req.grounding {
            vec![serde_json::json!({ "google_search": {} })]
        } else {
            Vec::new()
        };
        Self {
            system_instruction: WireContent {
                role: None,
                parts: vec![WirePart {
                    text: Some(req.system_instruction.clone()),
                }],
            },
            contents: vec![WireContent {
                role: Some("user".to_string()),
                parts: vec![WirePart {
                    text: Some(req.items.to_string()),
                }],
            }],
            tools,
        }
    }
}

impl WireResponse {
    /// Converte para o contrato interno: texto concatenado do primeiro
    /// candidato e citações web sem URL vazia.
    pub fn into_response(self, requested_model: &str) -> GenerationResponse {
        let model = self
            .model_version
            .unwrap_or_else(|| requested_model.to_string());
        let Some(candidate) = self.candidates.into_iter().next() else {
            return GenerationResponse {
                model,
                ..Default::default()
            };
        };

        let text = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        let citations = candidate
            .grounding_metadata
            .map(|g| g.grounding_chunks)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|chunk| chunk.web)
            .filter(|web| !web.uri.is_empty())
            .map(|web| Citation {
                url: web.uri,
                title: web.title,
            })
            .collect();

        GenerationResponse {
            text,
            citations,
            model,
        }
    }
}
