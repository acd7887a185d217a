//! The per-lesson stages driven by the engine.
//!
//! Source curation and materials generation share the whole retry, batching
//! and persistence path; a [`Pipeline`] only says what to ask for, how to
//! read the answer, how to judge a candidate and which controls make up the
//! definition of done.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::course::{Deliverable, DeliverableContent, Provenance};
use crate::genai::Citation;
use crate::state_machine::{ControlState, DefinitionOfDone, WorkItem};
use crate::validator::ResourceCheck;

/// A deliverable proposed by the model, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub content: DeliverableContent,
    pub notes: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// `content` is what gets stored; it may differ from the candidate's
    /// (a resolved URL, for instance).
    Accept {
        content: DeliverableContent,
        notes: String,
    },
    Reject {
        reason: String,
    },
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    fn system_instruction(&self, custom_prompt: Option<&str>) -> String;

    /// Whether requests enable search grounding.
    fn grounding(&self) -> bool {
        false
    }

    /// JSON describing one lesson in the request.
    fn request_item(&self, item: &WorkItem) -> Value {
        json!({
            "id": item.id,
            "title": item.title,
            "module": item.module_id,
            "deliverables": item.deliverables,
        })
    }

    /// Candidates inside one lesson's structured sub-result.
    fn candidates(&self, payload: &Value) -> Vec<Candidate>;

    /// Lower-confidence candidates from grounding citations.
    fn grounding_candidates(&self, _citations: &[Citation]) -> Vec<Candidate> {
        Vec::new()
    }

    async fn validate(&self, item: &WorkItem, candidate: &Candidate) -> Verdict;

    fn definition_of_done(&self, item: &WorkItem, accepted: &[Deliverable]) -> DefinitionOfDone;
}

fn with_custom_prompt(base: String, custom_prompt: Option<&str>) -> String {
    match custom_prompt.map(str::trim) {
        Some(extra) if !extra.is_empty() => format!("{base}\n\nAdditional instructions:\n{extra}"),
        _ => base,
    }
}

fn text_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Curates external reading sources per lesson.
pub struct SourceCuration {
    checker: Arc<dyn ResourceCheck>,
    per_item: usize,
}

impl SourceCuration {
    pub fn new(checker: Arc<dyn ResourceCheck>, per_item: usize) -> Self {
        Self { checker, per_item }
    }
}

#[async_trait]
impl Pipeline for SourceCuration {
    fn system_instruction(&self, custom_prompt: Option<&str>) -> String {
        let base = format!(
            "You curate reading material for course lessons. For every lesson in the \
             input, find up to {} publicly accessible, substantial web pages that teach \
             the lesson topic. Do not invent URLs. Respond with JSON only, in the form \
             {{\"items\": [{{\"id\": \"<lesson id>\", \"sources\": [{{\"url\": \"...\", \
             \"title\": \"...\", \"rationale\": \"...\"}}]}}]}}",
            self.per_item
        );
        with_custom_prompt(base, custom_prompt)
    }

    fn grounding(&self) -> bool {
        true
    }

    fn candidates(&self, payload: &Value) -> Vec<Candidate> {
        let Some(sources) = payload
            .get("sources")
            .or_else(|| payload.get("resources"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };
        sources
            .iter()
            .filter_map(|entry| {
                let (url, title, notes) = match entry {
                    Value::String(url) => (url.trim().to_string(), String::new(), String::new()),
                    _ => (
                        text_field(entry, &["url", "link", "uri"]),
                        text_field(entry, &["title", "name"]),
                        text_field(entry, &["rationale", "notes", "reason"]),
                    ),
                };
                url.starts_with("http").then(|| Candidate {
                    content: DeliverableContent::Source { url, title },
                    notes,
                    provenance: Provenance::Primary,
                })
            })
            .collect()
    }

    fn grounding_candidates(&self, citations: &[Citation]) -> Vec<Candidate> {
        citations
            .iter()
            .filter(|c| c.url.starts_with("http"))
            .map(|c| Candidate {
                content: DeliverableContent::Source {
                    url: c.url.clone(),
                    title: c.title.clone(),
                },
                notes: "grounding citation".to_string(),
                provenance: Provenance::Fallback,
            })
            .collect()
    }

    async fn validate(&self, _item: &WorkItem, candidate: &Candidate) -> Verdict {
        let DeliverableContent::Source { url, title } = &candidate.content else {
            return Verdict::Reject {
                reason: "not a source".to_string(),
            };
        };
        let validation = self.checker.check(url).await;
        tracing::debug!(
            url = %url,
            accepted = validation.accepted,
            reason = %validation.reason,
            "source validated"
        );
        if !validation.accepted {
            return Verdict::Reject {
                reason: format!("{url}: {}", validation.reason),
            };
        }
        let notes = if candidate.notes.is_empty() {
            format!("{} chars", validation.content_length)
        } else {
            format!("{} ({} chars)", candidate.notes, validation.content_length)
        };
        Verdict::Accept {
            content: DeliverableContent::Source {
                url: validation.final_url,
                title: title.clone(),
            },
            notes,
        }
    }

    fn definition_of_done(&self, _item: &WorkItem, accepted: &[Deliverable]) -> DefinitionOfDone {
        let mut dod = DefinitionOfDone::default();
        dod.set(
            "sources",
            if accepted.is_empty() {
                ControlState::Fail
            } else {
                ControlState::Pass
            },
        );
        dod.set(
            "primary_extraction",
            if accepted.iter().any(|d| d.provenance == Provenance::Primary) {
                ControlState::Pass
            } else {
                ControlState::Pending
            },
        );
        dod
    }
}

/// Generates lesson components (readings, quizzes, exercises...).
#[derive(Debug, Clone, Copy, Default)]
pub struct MaterialsGeneration;

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl Pipeline for MaterialsGeneration {
    fn system_instruction(&self, custom_prompt: Option<&str>) -> String {
        let base = "You write course materials. For every lesson in the input, produce one \
                    component for each entry of its \"deliverables\" list, using that entry \
                    as the component type. Respond with JSON only, in the form \
                    {\"items\": [{\"id\": \"<lesson id>\", \"components\": [{\"type\": \"...\", \
                    \"content\": ..., \"notes\": \"...\"}]}]}"
            .to_string();
        with_custom_prompt(base, custom_prompt)
    }

    fn candidates(&self, payload: &Value) -> Vec<Candidate> {
        let Some(components) = payload.get("components").and_then(Value::as_array) else {
            return Vec::new();
        };
        components
            .iter()
            .filter_map(|entry| {
                let kind = text_field(entry, &["type", "kind"]);
                let body = entry.get("content").cloned().unwrap_or(Value::Null);
                (!kind.is_empty()).then(|| Candidate {
                    content: DeliverableContent::Component { kind, body },
                    notes: text_field(entry, &["notes"]),
                    provenance: Provenance::Primary,
                })
            })
            .collect()
    }

    async fn validate(&self, item: &WorkItem, candidate: &Candidate) -> Verdict {
        let DeliverableContent::Component { kind, body } = &candidate.content else {
            return Verdict::Reject {
                reason: "not a component".to_string(),
            };
        };
        let expected = item.deliverables.is_empty()
            || item.deliverables.iter().any(|d| d.eq_ignore_ascii_case(kind));
        if !expected {
            return Verdict::Reject {
                reason: format!("unexpected component type {kind}"),
            };
        }
        if is_blank(body) {
            return Verdict::Reject {
                reason: format!("{kind}: empty content"),
            };
        }
        Verdict::Accept {
            content: candidate.content.clone(),
            notes: candidate.notes.clone(),
        }
    }

    fn definition_of_done(&self, item: &WorkItem, accepted: &[Deliverable]) -> DefinitionOfDone {
        let produced = |wanted: &str| {
            accepted.iter().any(|d| {
                matches!(&d.content, DeliverableContent::Component { kind, .. } if kind.eq_ignore_ascii_case(wanted))
            })
        };
        let mut dod = DefinitionOfDone::default();
        if item.deliverables.is_empty() {
            dod.set(
                "components",
                if accepted.is_empty() {
                    ControlState::Fail
                } else {
                    ControlState::Pass
                },
            );
        }
        for wanted in &item.deliverables {
            let state = if produced(wanted) {
                ControlState::Pass
            } else {
                ControlState::Fail
            };
            dod.set(wanted.as_str(), state);
        }
        dod
    }
}
