//! The batch orchestration engine.

pub mod backoff;
pub mod controller;
pub mod extract;
pub mod gateway;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod sleeper;

pub use backoff::BackoffPolicy;
pub use controller::{Controller, ControllerSettings, ItemOutcome, JobContext};
pub use gateway::{Gateway, JobWrite};
pub use models::ModelSequence;
pub use pipeline::{Candidate, MaterialsGeneration, Pipeline, SourceCuration, Verdict};
pub use scheduler::{BatchSettings, RunEnd, RunReport, Scheduler, partition};
pub use sleeper::{Sleeper, TokioSleeper, Wait};
