//! Course plans and the deliverables the engine attaches to lessons.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of the two generation stages a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// Curate external reading sources per lesson.
    Sources,
    /// Generate lesson materials (one component per expected content type).
    Materials,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Sources => write!(f, "sources"),
            PipelineKind::Materials => write!(f, "materials"),
        }
    }
}

impl FromStr for PipelineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sources" | "curation" => Ok(PipelineKind::Sources),
            "materials" | "components" => Ok(PipelineKind::Materials),
            other => Err(format!("unknown pipeline: {other}")),
        }
    }
}

/// The plan a job iterates: modules, each with ordered lessons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoursePlan {
    pub artifact_id: String,
    pub title: String,
    #[serde(default)]
    pub modules: Vec<ModulePlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulePlan {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub lessons: Vec<LessonPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonPlan {
    pub id: String,
    pub title: String,
    /// Content types this lesson must end up with (e.g. "reading", "quiz").
    #[serde(default)]
    pub deliverables: Vec<String>,
}

impl CoursePlan {
    pub fn lesson_count(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }

    /// Lessons in plan order, paired with their module id.
    pub fn lessons(&self) -> impl Iterator<Item = (&ModulePlan, &LessonPlan)> {
        self.modules
            .iter()
            .flat_map(|m| m.lessons.iter().map(move |l| (m, l)))
    }
}

/// Whether a deliverable is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Accepted,
    Rejected,
    Unknown,
}

impl FromStr for Validity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accepted" => Ok(Validity::Accepted),
            "rejected" => Ok(Validity::Rejected),
            "unknown" => Ok(Validity::Unknown),
            other => Err(format!("unknown validity: {other}")),
        }
    }
}

/// Where a deliverable came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// The structured answer of the model.
    Primary,
    /// A grounding citation used because the structured answer was missing
    /// or unusable. Lower confidence.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeliverableContent {
    /// An external reading source.
    Source { url: String, title: String },
    /// A generated lesson component.
    Component {
        kind: String,
        body: serde_json::Value,
    },
}

impl DeliverableContent {
    /// Identity used to drop duplicates within one lesson.
    pub fn dedup_key(&self) -> String {
        match self {
            DeliverableContent::Source { url, .. } => {
                format!("source:{}", url.trim_end_matches('/').to_lowercase())
            }
            DeliverableContent::Component { kind, body } => {
                format!("component:{}:{body}", kind.to_lowercase())
            }
        }
    }
}

/// An accepted output attached to a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: String,
    pub job_id: String,
    pub work_item_id: String,
    pub validity: Validity,
    pub provenance: Provenance,
    pub notes: String,
    pub content: DeliverableContent,
    pub created_at: DateTime<Utc>,
}

impl Deliverable {
    pub fn new(
        job_id: &str,
        work_item_id: &str,
        content: DeliverableContent,
        provenance: Provenance,
        notes: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            work_item_id: work_item_id.to_string(),
            validity: Validity::Accepted,
            provenance,
            notes,
            content,
            created_at: Utc::now(),
        }
    }
}
