use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::JobStatus;
use crate::course::LessonPlan;

/// Lifecycle of a single lesson within a job.
///
/// PENDING → GENERATING → GENERATED → VALIDATING → APPROVABLE | NEEDS_FIX.
/// NEEDS_FIX loops back to GENERATING until the iteration cap, then BLOCKED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LessonStatus {
    Pending,
    Generating,
    Generated,
    Validating,
    Approvable,
    NeedsFix,
    Blocked,
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LessonStatus::Pending => write!(f, "PENDING"),
            LessonStatus::Generating => write!(f, "GENERATING"),
            LessonStatus::Generated => write!(f, "GENERATED"),
            LessonStatus::Validating => write!(f, "VALIDATING"),
            LessonStatus::Approvable => write!(f, "APPROVABLE"),
            LessonStatus::NeedsFix => write!(f, "NEEDS_FIX"),
            LessonStatus::Blocked => write!(f, "BLOCKED"),
        }
    }
}

impl LessonStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            LessonStatus::Generating | LessonStatus::Generated | LessonStatus::Validating
        )
    }

    pub fn can_transition_to(self, next: LessonStatus) -> bool {
        use LessonStatus::*;
        matches!(
            (self, next),
            (Pending, Generating)
                | (NeedsFix, Generating)
                | (Generating, Generated)
                | (Generating, NeedsFix)
                | (Generating, Blocked)
                | (Generated, Validating)
                | (Generated, NeedsFix)
                | (Generated, Blocked)
                | (Validating, Approvable)
                | (Validating, NeedsFix)
                | (Validating, Blocked)
                | (NeedsFix, Blocked)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Pass,
    Fail,
    Pending,
}

/// Definition of done: one state per quality control plus the error list
/// the UI renders for NEEDS_FIX / BLOCKED lessons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionOfDone {
    pub controls: BTreeMap<String, ControlState>,
    pub errors: Vec<String>,
}

impl DefinitionOfDone {
    pub fn set(&mut self, control: impl Into<String>, state: ControlState) {
        self.controls.insert(control.into(), state);
    }

    pub fn has_failures(&self) -> bool {
        self.controls.values().any(|s| *s == ControlState::Fail)
    }

    pub fn failing(&self) -> Vec<&str> {
        self.controls
            .iter()
            .filter(|(_, s)| **s == ControlState::Fail)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// One lesson processed within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub job_id: String,
    pub module_id: String,
    pub title: String,
    pub deliverables: Vec<String>,
    pub iteration: u32,
    pub iteration_cap: u32,
    pub status: LessonStatus,
    pub dod: DefinitionOfDone,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(job_id: &str, module_id: &str, lesson: &LessonPlan, iteration_cap: u32) -> Self {
        Self {
            id: lesson.id.clone(),
            job_id: job_id.to_string(),
            module_id: module_id.to_string(),
            title: lesson.title.clone(),
            deliverables: lesson.deliverables.clone(),
            iteration: 0,
            iteration_cap,
            status: LessonStatus::Pending,
            dod: DefinitionOfDone::default(),
            updated_at: Utc::now(),
        }
    }

    pub fn at_cap(&self) -> bool {
        self.iteration >= self.iteration_cap
    }

    /// Eligible for the automated path: untouched, or failed with iterations left.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            LessonStatus::Pending => !self.at_cap(),
            LessonStatus::NeedsFix => !self.at_cap(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("lesson {id}: cannot move from {from} to {to}")]
    Lesson {
        id: String,
        from: LessonStatus,
        to: LessonStatus,
    },

    #[error("lesson {id}: iteration cap {cap} reached")]
    IterationCap { id: String, cap: u32 },

    #[error("job {id}: cannot move from {from} to {to}")]
    Job {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Applies lesson transitions; the only code that mutates `WorkItem::status`.
pub struct LessonMachine;

impl LessonMachine {
    /// Start an iteration. Refuses once the cap is reached so the counter
    /// never exceeds it.
    pub fn begin_attempt(item: &mut WorkItem) -> Result<(), TransitionError> {
        if item.at_cap() {
            return Err(TransitionError::IterationCap {
                id: item.id.clone(),
                cap: item.iteration_cap,
            });
        }
        Self::advance(item, LessonStatus::Generating)?;
        item.iteration += 1;
        Ok(())
    }

    pub fn advance(item: &mut WorkItem, to: LessonStatus) -> Result<(), TransitionError> {
        if !item.status.can_transition_to(to) {
            return Err(TransitionError::Lesson {
                id: item.id.clone(),
                from: item.status,
                to,
            });
        }
        item.status = to;
        item.updated_at = Utc::now();
        Ok(())
    }

    /// Close a validated lesson with its DoD. Any failing control sends it
    /// to NEEDS_FIX (or BLOCKED at the cap) instead of APPROVABLE.
    pub fn conclude(
        item: &mut WorkItem,
        dod: DefinitionOfDone,
    ) -> Result<LessonStatus, TransitionError> {
        let failing: Vec<String> = dod.failing().into_iter().map(String::from).collect();
        item.dod = dod;
        if failing.is_empty() {
            Self::advance(item, LessonStatus::Approvable)?;
            Ok(item.status)
        } else {
            Self::fail(item, format!("failing controls: {}", failing.join(", ")))
        }
    }

    /// Record an item-level failure. The error string is kept on the DoD.
    pub fn fail(item: &mut WorkItem, error: String) -> Result<LessonStatus, TransitionError> {
        let target = if item.at_cap() {
            LessonStatus::Blocked
        } else {
            LessonStatus::NeedsFix
        };
        Self::advance(item, target)?;
        item.dod.errors.push(error);
        Ok(item.status)
    }
}
