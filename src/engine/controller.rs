//! Per-lesson retry and model fallback.
//!
//! Each pass walks the model sequence from the job's active model. A success
//! ends the attempt. A rate limit ends the pass at once (the limit is on the
//! account, so the next pass starts again from the first model). Overload,
//! malformed output and other request failures move on to the next model
//! after a short fixed pause. A pass that ends without success costs one
//! retry and a backoff sleep. Failures never leave this module as errors:
//! they become lesson state plus an error string.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::backoff::BackoffPolicy;
use super::extract::extract_items;
use super::gateway::Gateway;
use super::models::ModelSequence;
use super::pipeline::{Candidate, Pipeline, Verdict};
use super::sleeper::{Sleeper, Wait};
use crate::course::Deliverable;
use crate::genai::{ContentGenerator, FailureCategory, GenerationRequest, GenerationResponse};
use crate::state_machine::{Job, LessonMachine, LessonStatus, WorkItem};

const RAW_LOG_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Outer retry passes per lesson attempt.
    pub max_passes: u32,
    pub model_switch_delay: Duration,
    pub backoff: BackoffPolicy,
}

/// Mutable run state shared by every lesson of one job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    pub custom_prompt: Option<String>,
    /// Where each model walk starts. Persisted on change.
    pub active_model: String,
    pub model_switches: u32,
}

impl JobContext {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            custom_prompt: job.custom_prompt.clone(),
            active_model: job.active_model.clone(),
            model_switches: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Approved { results: usize },
    NeedsFix { error: String },
    Blocked { error: String },
    /// Not attempted: iteration cap already reached.
    Skipped,
}

struct Generated {
    primary: Vec<Candidate>,
    fallback: Vec<Candidate>,
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub struct Controller {
    generator: Arc<dyn ContentGenerator>,
    pipeline: Arc<dyn Pipeline>,
    gateway: Arc<Gateway>,
    sleeper: Arc<dyn Sleeper>,
    models: ModelSequence,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        pipeline: Arc<dyn Pipeline>,
        gateway: Arc<Gateway>,
        sleeper: Arc<dyn Sleeper>,
        models: ModelSequence,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            generator,
            pipeline,
            gateway,
            sleeper,
            models,
            settings,
        }
    }

    /// One attempt at one lesson. Always leaves the lesson in a settled
    /// status (APPROVABLE, NEEDS_FIX or BLOCKED) unless it was skipped.
    pub async fn process(&self, ctx: &mut JobContext, item: &mut WorkItem) -> ItemOutcome {
        if let Err(e) = LessonMachine::begin_attempt(item) {
            tracing::debug!(job_id = %ctx.job_id, item_id = %item.id, error = %e, "lesson skipped");
            return ItemOutcome::Skipped;
        }
        self.gateway.record_item(item).await;
        tracing::info!(
            job_id = %ctx.job_id,
            item_id = %item.id,
            iteration = item.iteration,
            cap = item.iteration_cap,
            "lesson attempt"
        );

        let outcome = match self.attempt(ctx, item).await {
            Ok(results) if item.status == LessonStatus::Approvable => {
                ItemOutcome::Approved { results }
            }
            Ok(_) => settled(item),
            Err(error) => match LessonMachine::fail(item, error.clone()) {
                Ok(_) => settled(item),
                Err(e) => {
                    tracing::error!(item_id = %item.id, error = %e, "could not record lesson failure");
                    ItemOutcome::NeedsFix { error }
                }
            },
        };
        self.gateway.record_item(item).await;

        match &outcome {
            ItemOutcome::Approved { results } => {
                tracing::info!(item_id = %item.id, results, "lesson approvable")
            }
            ItemOutcome::NeedsFix { error } | ItemOutcome::Blocked { error } => {
                tracing::warn!(item_id = %item.id, status = %item.status, %error, "lesson failed")
            }
            ItemOutcome::Skipped => {}
        }
        outcome
    }

    async fn attempt(&self, ctx: &mut JobContext, item: &mut WorkItem) -> Result<usize, String> {
        let generated = self.generate(ctx, item).await?;
        LessonMachine::advance(item, LessonStatus::Generated).map_err(|e| e.to_string())?;
        self.gateway.record_item(item).await;
        LessonMachine::advance(item, LessonStatus::Validating).map_err(|e| e.to_string())?;
        self.gateway.record_item(item).await;

        let mut seen = HashSet::new();
        let mut rejections = Vec::new();
        let mut accepted = self
            .select(item, &generated.primary, &mut seen, &mut rejections)
            .await;
        if accepted.is_empty() && !generated.fallback.is_empty() {
            tracing::info!(
                item_id = %item.id,
                candidates = generated.fallback.len(),
                "using grounding candidates"
            );
            accepted = self
                .select(item, &generated.fallback, &mut seen, &mut rejections)
                .await;
        }
        if accepted.is_empty() {
            return Err(format!(
                "no candidate passed validation: {}",
                rejections.join("; ")
            ));
        }

        let dod = self.pipeline.definition_of_done(item, &accepted);
        let stored = self.gateway.replace_item_results(item, accepted).await;
        LessonMachine::conclude(item, dod).map_err(|e| e.to_string())?;
        Ok(stored)
    }

    async fn generate(&self, ctx: &mut JobContext, item: &WorkItem) -> Result<Generated, String> {
        let max_passes = self.settings.max_passes.max(1);
        let instruction = self.pipeline.system_instruction(ctx.custom_prompt.as_deref());
        let items = json!([self.pipeline.request_item(item)]);
        let mut passes = 0u32;
        let mut last_error = String::from("no model available");

        while passes < max_passes {
            let sequence = self.models.starting_at(&ctx.active_model).to_vec();
            let mut overloaded = false;

            for (index, model) in sequence.iter().enumerate() {
                tracing::info!(
                    job_id = %ctx.job_id,
                    item_id = %item.id,
                    model = %model,
                    pass = passes + 1,
                    "calling model"
                );
                let request = GenerationRequest {
                    model: model.clone(),
                    system_instruction: instruction.clone(),
                    items: items.clone(),
                    grounding: self.pipeline.grounding(),
                };

                let (category, message) = match self.generator.generate(&request).await {
                    Ok(response) => match self.interpret(&item.id, &response) {
                        Some(generated) => {
                            if overloaded && *model != ctx.active_model {
                                self.switch_model(ctx, model).await;
                            }
                            return Ok(generated);
                        }
                        None => {
                            tracing::warn!(
                                item_id = %item.id,
                                model = %model,
                                raw = %truncate(&response.text, RAW_LOG_CHARS),
                                "malformed model output"
                            );
                            (FailureCategory::Malformed, "malformed output".to_string())
                        }
                    },
                    Err(e) => (e.category(), e.to_string()),
                };
                last_error = format!("{model}: {message}");

                if category == FailureCategory::RateLimited {
                    tracing::warn!(item_id = %item.id, model = %model, "rate limited");
                    break;
                }
                if category == FailureCategory::Overloaded {
                    overloaded = true;
                }
                tracing::warn!(item_id = %item.id, model = %model, %category, error = %message, "model failed");
                if index + 1 < sequence.len() {
                    self.sleeper
                        .sleep(Wait::ModelSwitch, self.settings.model_switch_delay)
                        .await;
                }
            }

            passes += 1;
            if passes < max_passes {
                let delay = self.settings.backoff.next_delay(passes);
                tracing::info!(
                    item_id = %item.id,
                    pass = passes,
                    delay_ms = delay.as_millis() as u64,
                    "backing off"
                );
                self.sleeper.sleep(Wait::Backoff, delay).await;
            }
        }

        Err(format!(
            "all models exhausted after {passes} passes: {last_error}"
        ))
    }

    /// Candidates from one response, or `None` when it holds nothing usable.
    fn interpret(&self, item_id: &str, response: &GenerationResponse) -> Option<Generated> {
        let primary = extract_items(&response.text, &[item_id])
            .and_then(|matches| matches.into_iter().next())
            .and_then(|m| m.payload)
            .map(|payload| self.pipeline.candidates(&payload))
            .unwrap_or_default();
        let fallback = self.pipeline.grounding_candidates(&response.citations);
        if primary.is_empty() && fallback.is_empty() {
            None
        } else {
            Some(Generated { primary, fallback })
        }
    }

    async fn switch_model(&self, ctx: &mut JobContext, model: &str) {
        let fallback = self.models.after(model).unwrap_or_default();
        tracing::info!(from = %ctx.active_model, to = model, "switching active model after overload");
        ctx.active_model = model.to_string();
        ctx.model_switches += 1;
        self.gateway
            .record_model_switch(&ctx.job_id, model, fallback)
            .await;
    }

    async fn select(
        &self,
        item: &WorkItem,
        candidates: &[Candidate],
        seen: &mut HashSet<String>,
        rejections: &mut Vec<String>,
    ) -> Vec<Deliverable> {
        let limit = self.gateway.fan_out_limit();
        let mut accepted = Vec::new();
        for candidate in candidates {
            if accepted.len() >= limit {
                break;
            }
            if !seen.insert(candidate.content.dedup_key()) {
                continue;
            }
            match self.pipeline.validate(item, candidate).await {
                Verdict::Accept { content, notes } => accepted.push(Deliverable::new(
                    &item.job_id,
                    &item.id,
                    content,
                    candidate.provenance,
                    notes,
                )),
                Verdict::Reject { reason } => {
                    tracing::debug!(item_id = %item.id, %reason, "candidate rejected");
                    rejections.push(reason);
                }
            }
        }
        accepted
    }
}

fn settled(item: &WorkItem) -> ItemOutcome {
    let error = item.dod.errors.last().cloned().unwrap_or_default();
    match item.status {
        LessonStatus::Blocked => ItemOutcome::Blocked { error },
        _ => ItemOutcome::NeedsFix { error },
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedGenerator, settings};
    use super::*;
    use crate::course::{LessonPlan, PipelineKind, Provenance};
    use crate::engine::pipeline::testing::StubCheck;
    use crate::engine::pipeline::{MaterialsGeneration, SourceCuration};
    use crate::engine::sleeper::testing::RecordingSleeper;
    use crate::store::{JobStore, MemoryStore};

    struct Harness {
        store: Arc<MemoryStore>,
        generator: Arc<ScriptedGenerator>,
        sleeper: Arc<RecordingSleeper>,
        checker: Arc<StubCheck>,
        controller: Controller,
        ctx: JobContext,
    }

    fn lesson(id: &str, deliverables: &[&str]) -> WorkItem {
        let plan = LessonPlan {
            id: id.into(),
            title: format!("Lesson {id}"),
            deliverables: deliverables.iter().map(|d| d.to_string()).collect(),
        };
        WorkItem::new("job-1", "m1", &plan, 3)
    }

    async fn harness_with(
        generator: ScriptedGenerator,
        checker: StubCheck,
        materials: bool,
        fan_out: usize,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(Gateway::new(store.clone(), fan_out));
        let job = Job::new(
            "job-1".into(),
            "course-1".into(),
            PipelineKind::Sources,
            "pro".into(),
            "flash".into(),
            None,
        );
        gateway
            .reset_job(&job, &[lesson("l1", &["reading", "quiz"])])
            .await
            .unwrap();

        let generator = Arc::new(generator);
        let sleeper = Arc::new(RecordingSleeper::default());
        let checker = Arc::new(checker);
        let pipeline: Arc<dyn Pipeline> = if materials {
            Arc::new(MaterialsGeneration)
        } else {
            Arc::new(SourceCuration::new(checker.clone(), fan_out))
        };
        let controller = Controller::new(
            generator.clone(),
            pipeline,
            gateway,
            sleeper.clone(),
            ModelSequence::new("pro", "flash", Some("stable")),
            settings(3),
        );
        Harness {
            store,
            generator,
            sleeper,
            checker,
            controller,
            ctx: JobContext::from_job(&job),
        }
    }

    async fn harness(generator: ScriptedGenerator) -> Harness {
        harness_with(generator, StubCheck::default(), false, 5).await
    }

    #[tokio::test]
    async fn first_model_success_approves_lesson() {
        let mut h = harness(ScriptedGenerator::answering(Reply::Sources(2))).await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Approved { results: 2 });
        assert_eq!(item.status, LessonStatus::Approvable);
        assert_eq!(item.iteration, 1);
        assert_eq!(h.generator.calls(), vec!["pro"]);
        assert!(h.sleeper.waits().is_empty());

        let stored = h.store.work_items("job-1").await.unwrap();
        assert_eq!(stored[0].status, LessonStatus::Approvable);
        assert_eq!(h.store.results("job-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_restarts_from_first_model_without_switching() {
        let generator = ScriptedGenerator::answering(Reply::Sources(1))
            .script("pro", vec![Reply::RateLimited, Reply::RateLimited]);
        let mut h = harness(generator).await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Approved { results: 1 });
        assert_eq!(h.generator.calls(), vec!["pro", "pro", "pro"]);
        assert_eq!(h.sleeper.count(Wait::Backoff), 2);
        assert_eq!(h.sleeper.count(Wait::ModelSwitch), 0);
        assert_eq!(
            h.sleeper.waits(),
            vec![
                (Wait::Backoff, Duration::from_secs(60)),
                (Wait::Backoff, Duration::from_secs(120)),
            ]
        );
        assert_eq!(h.ctx.active_model, "pro");
        assert_eq!(h.ctx.model_switches, 0);
    }

    #[tokio::test]
    async fn first_backoff_uses_incremented_pass_counter() {
        let generator = ScriptedGenerator::answering(Reply::Sources(1))
            .script("pro", vec![Reply::RateLimited]);
        let mut h = harness(generator).await;
        let mut item = lesson("l1", &[]);

        h.controller.process(&mut h.ctx, &mut item).await;

        // base 30s, counter already 1 when the delay is computed
        assert_eq!(
            h.sleeper.waits(),
            vec![(Wait::Backoff, Duration::from_secs(60))]
        );
    }

    #[tokio::test]
    async fn overload_moves_to_next_model_and_persists_switch() {
        let generator =
            ScriptedGenerator::answering(Reply::Sources(1)).always("pro", Reply::Overloaded);
        let mut h = harness(generator).await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Approved { results: 1 });
        assert_eq!(h.generator.calls(), vec!["pro", "flash"]);
        assert_eq!(h.sleeper.waits(), vec![(Wait::ModelSwitch, Duration::from_secs(2))]);
        assert_eq!(h.ctx.active_model, "flash");
        assert_eq!(h.ctx.model_switches, 1);

        let job = h.store.job("job-1").await.unwrap().unwrap();
        assert_eq!(job.active_model, "flash");
        assert_eq!(job.fallback_model, "stable");

        // The next lesson starts from the switched model.
        let mut next = lesson("l2", &[]);
        h.controller.process(&mut h.ctx, &mut next).await;
        assert_eq!(h.generator.calls(), vec!["pro", "flash", "flash"]);
    }

    #[tokio::test]
    async fn malformed_output_tries_next_model_without_switch() {
        let generator = ScriptedGenerator::answering(Reply::Sources(1))
            .script("pro", vec![Reply::Text("Sorry, I can't help with that.".into())]);
        let mut h = harness(generator).await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Approved { results: 1 });
        assert_eq!(h.generator.calls(), vec!["pro", "flash"]);
        assert_eq!(h.ctx.active_model, "pro");
    }

    #[tokio::test]
    async fn request_failure_advances_like_overload() {
        let generator =
            ScriptedGenerator::answering(Reply::Sources(1)).script("pro", vec![Reply::Failure(400)]);
        let mut h = harness(generator).await;
        let mut item = lesson("l1", &[]);

        h.controller.process(&mut h.ctx, &mut item).await;
        assert_eq!(h.generator.calls(), vec!["pro", "flash"]);
        assert_eq!(h.ctx.model_switches, 0);
    }

    #[tokio::test]
    async fn every_model_overloaded_exhausts_passes() {
        let mut h = harness(ScriptedGenerator::answering(Reply::Overloaded)).await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(h.generator.calls().len(), 9);
        assert_eq!(h.sleeper.count(Wait::ModelSwitch), 6);
        assert_eq!(h.sleeper.count(Wait::Backoff), 2);
        match outcome {
            ItemOutcome::NeedsFix { error } => assert!(error.contains("all models"), "{error}"),
            other => panic!("expected NeedsFix, got {other:?}"),
        }
        assert_eq!(item.status, LessonStatus::NeedsFix);
        assert!(item.dod.errors[0].contains("all models"));
        assert!(h.store.results("job-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_primary_falls_back_to_grounding_candidates() {
        let generator = ScriptedGenerator::answering(Reply::Grounded(vec![
            "https://grounded.org/page".into(),
        ]));
        let mut h = harness(generator).await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Approved { results: 1 });
        let results = h.store.results("job-1").await.unwrap();
        assert_eq!(results[0].provenance, Provenance::Fallback);
    }

    #[tokio::test]
    async fn all_candidates_rejected_fails_without_more_models() {
        let checker = StubCheck::rejecting(&[("https://example.org/l1/1", "HTTP 404")]);
        let mut h = harness_with(
            ScriptedGenerator::answering(Reply::Sources(1)),
            checker,
            false,
            5,
        )
        .await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        match outcome {
            ItemOutcome::NeedsFix { error } => {
                assert!(error.starts_with("no candidate passed validation"));
                assert!(error.contains("HTTP 404"));
            }
            other => panic!("expected NeedsFix, got {other:?}"),
        }
        assert_eq!(h.generator.calls(), vec!["pro"]);
    }

    #[tokio::test]
    async fn fan_out_limit_bounds_validation_and_storage() {
        let mut h = harness_with(
            ScriptedGenerator::answering(Reply::Sources(8)),
            StubCheck::default(),
            false,
            3,
        )
        .await;
        let mut item = lesson("l1", &[]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Approved { results: 3 });
        assert_eq!(h.checker.checked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn lesson_at_cap_is_skipped() {
        let mut h = harness(ScriptedGenerator::answering(Reply::Sources(1))).await;
        let mut item = lesson("l1", &[]);
        item.iteration = item.iteration_cap;
        item.status = LessonStatus::NeedsFix;

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert_eq!(outcome, ItemOutcome::Skipped);
        assert!(h.generator.calls().is_empty());
        assert_eq!(item.iteration, item.iteration_cap);
    }

    #[tokio::test]
    async fn failure_on_last_iteration_blocks() {
        let mut h = harness(ScriptedGenerator::answering(Reply::Overloaded)).await;
        let mut item = lesson("l1", &[]);
        item.iteration = item.iteration_cap - 1;
        item.status = LessonStatus::NeedsFix;

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        assert!(matches!(outcome, ItemOutcome::Blocked { .. }));
        assert_eq!(item.iteration, item.iteration_cap);
        assert_eq!(item.status, LessonStatus::Blocked);
    }

    #[tokio::test]
    async fn missing_component_leaves_lesson_needing_fix() {
        let generator = ScriptedGenerator::answering(Reply::Components(vec!["reading".into()]));
        let mut h = harness_with(generator, StubCheck::default(), true, 5).await;
        let mut item = lesson("l1", &["reading", "quiz"]);

        let outcome = h.controller.process(&mut h.ctx, &mut item).await;

        match outcome {
            ItemOutcome::NeedsFix { error } => assert!(error.contains("quiz")),
            other => panic!("expected NeedsFix, got {other:?}"),
        }
        // The partial result is kept for review.
        assert_eq!(h.store.results("job-1").await.unwrap().len(), 1);
    }
}
