//! Batch orchestration of generated course content.
//!
//! A job walks every lesson of a course plan in fixed-size batches, asks a
//! generative model for output with retries and model fallback, validates
//! what comes back, and persists lesson state so the run can be paused,
//! stopped, resumed or re-triggered.

pub mod cli;
pub mod config;
pub mod course;
pub mod engine;
pub mod error;
pub mod genai;
pub mod logging;
pub mod orchestrator;
pub mod server;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod validator;

pub use config::LecternConfig;
pub use error::LecternError;
pub use orchestrator::{AuditRecord, JobSnapshot, Orchestrator, TriggerRequest};
