use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lesson::{LessonStatus, WorkItem};
use crate::course::PipelineKind;

/// Persisted status of a job.
///
/// Main line: DRAFT → GENERATING → VALIDATING → NEEDS_FIX | READY_FOR_QA →
/// APPROVED | REJECTED. Cooperative cancellation runs on the side channel
/// PAUSED_REQUESTED → PAUSED and STOPPED_REQUESTED → STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Draft,
    Generating,
    Validating,
    NeedsFix,
    ReadyForQa,
    Approved,
    Rejected,
    PausedRequested,
    Paused,
    StoppedRequested,
    Stopped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Draft => "DRAFT",
            JobStatus::Generating => "GENERATING",
            JobStatus::Validating => "VALIDATING",
            JobStatus::NeedsFix => "NEEDS_FIX",
            JobStatus::ReadyForQa => "READY_FOR_QA",
            JobStatus::Approved => "APPROVED",
            JobStatus::Rejected => "REJECTED",
            JobStatus::PausedRequested => "PAUSED_REQUESTED",
            JobStatus::Paused => "PAUSED",
            JobStatus::StoppedRequested => "STOPPED_REQUESTED",
            JobStatus::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// What the scheduler does at a batch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Continue,
    Pause,
    Stop,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Approved | JobStatus::Rejected | JobStatus::Stopped)
    }

    /// A run owns the job while it is in one of these.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            JobStatus::Generating
                | JobStatus::Validating
                | JobStatus::PausedRequested
                | JobStatus::StoppedRequested
        )
    }

    pub fn boundary(self) -> Boundary {
        match self {
            JobStatus::PausedRequested | JobStatus::Paused => Boundary::Pause,
            JobStatus::StoppedRequested | JobStatus::Stopped => Boundary::Stop,
            _ => Boundary::Continue,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if next == Stopped {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Draft, Generating)
                | (Generating, Validating)
                | (Generating, PausedRequested)
                | (Generating, StoppedRequested)
                | (Generating, Paused)
                | (PausedRequested, Paused)
                | (PausedRequested, StoppedRequested)
                | (PausedRequested, Validating)
                | (StoppedRequested, Validating)
                | (Validating, NeedsFix)
                | (Validating, ReadyForQa)
                | (NeedsFix, Generating)
                | (NeedsFix, Rejected)
                | (ReadyForQa, Approved)
                | (ReadyForQa, Rejected)
                | (ReadyForQa, Generating)
                | (Paused, Generating)
        )
    }
}

/// One generation run for one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub artifact_id: String,
    pub pipeline: PipelineKind,
    pub status: JobStatus,
    /// Model the next attempt starts from. Switched on overload.
    pub active_model: String,
    pub fallback_model: String,
    pub custom_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: String,
        artifact_id: String,
        pipeline: PipelineKind,
        active_model: String,
        fallback_model: String,
        custom_prompt: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            artifact_id,
            pipeline,
            status: JobStatus::Draft,
            active_model,
            fallback_model,
            custom_prompt,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct JobMachine;

impl JobMachine {
    /// Job status implied by its lessons once a run is over. Never reports a
    /// finished status while a lesson is pending or in progress.
    pub fn project(items: &[WorkItem]) -> JobStatus {
        if items
            .iter()
            .any(|i| i.status.is_in_progress() || i.status == LessonStatus::Pending)
        {
            JobStatus::Generating
        } else if items
            .iter()
            .any(|i| matches!(i.status, LessonStatus::NeedsFix | LessonStatus::Blocked))
        {
            JobStatus::NeedsFix
        } else {
            JobStatus::ReadyForQa
        }
    }
}
