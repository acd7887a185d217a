use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

use lectern::cli::{Cli, Command, Decision};
use lectern::course::{CoursePlan, PipelineKind};
use lectern::genai::GeminiClient;
use lectern::state_machine::JobStatus;
use lectern::store::FileStore;
use lectern::validator::ResourceValidator;
use lectern::{LecternConfig, Orchestrator, TriggerRequest, logging, server, ui};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn load_config(cli: &Cli) -> Result<LecternConfig> {
    let mut config = match &cli.config {
        Some(path) => LecternConfig::load_from(path)?,
        None => LecternConfig::load()?,
    };
    if let Some(model) = &cli.model {
        config.active_model = model.clone();
    }
    if let Some(passes) = cli.max_retries {
        config.max_retry_passes = passes;
    }
    config.validate()?;
    Ok(config)
}

async fn build(config: LecternConfig) -> Result<Arc<Orchestrator>> {
    let store = FileStore::open(&config.store_path)
        .await
        .with_context(|| format!("opening store {}", config.store_path.display()))?;
    let generator = GeminiClient::with_base_url(config.api_key.clone(), config.api_base_url.clone())?;
    let checker = ResourceValidator::new(config.validator.clone())?;
    Ok(Arc::new(Orchestrator::new(
        Arc::new(store),
        Arc::new(generator),
        Arc::new(checker),
        config,
    )))
}

/// Runs a prepared job in the foreground, following it with a progress bar.
/// Ctrl-C asks the job to stop at its next batch boundary.
async fn follow(orchestrator: &Arc<Orchestrator>, job_id: &str, verbose: bool) -> Result<()> {
    let lessons = orchestrator.store().work_items(job_id).await?.len();
    let progress = ui::JobProgress::start(job_id, lessons);

    let runner = Arc::clone(orchestrator);
    let id = job_id.to_string();
    let mut handle = tokio::spawn(async move { runner.run(&id).await });

    let outcome = loop {
        tokio::select! {
            joined = &mut handle => break joined?,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                match orchestrator.request_stop(job_id).await {
                    Ok(status) => tracing::warn!(job_id, %status, "stop requested from terminal"),
                    Err(e) => tracing::warn!(job_id, error = %e, "stop request refused"),
                }
            }
        }
        if let Ok(snapshot) = orchestrator.snapshot(job_id).await {
            progress.observe(&snapshot);
        }
    };

    match outcome {
        Ok(record) => {
            progress.complete(&record);
            if verbose {
                ui::print_audit(&record);
            }
            Ok(())
        }
        Err(e) => {
            progress.fail(&e.to_string());
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(cli.verbose, &config.log_format);

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            let orchestrator = build(config).await?;
            server::serve(orchestrator, &bind).await?;
        }
        Command::Import { file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let plan: CoursePlan = serde_json::from_str(&contents)?;
            let orchestrator = build(config).await?;
            orchestrator.import_plan(&plan).await?;
            println!(
                "Imported {} ({} lessons)",
                plan.artifact_id,
                plan.lesson_count()
            );
        }
        Command::Run {
            artifact_id,
            job_id,
            pipeline,
            prompt,
        } => {
            config.require_api_key()?;
            let orchestrator = build(config).await?;
            let job = orchestrator
                .prepare(
                    PipelineKind::from(pipeline),
                    TriggerRequest {
                        artifact_id,
                        job_id: job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                        custom_prompt: prompt,
                    },
                )
                .await?;
            follow(&orchestrator, &job.id, cli.verbose).await?;
        }
        Command::Retrigger {
            artifact_id,
            pipeline,
        } => {
            config.require_api_key()?;
            let orchestrator = build(config).await?;
            let job = orchestrator
                .prepare_retrigger(&artifact_id, PipelineKind::from(pipeline))
                .await?;
            follow(&orchestrator, &job.id, cli.verbose).await?;
        }
        Command::Resume { job_id } => {
            config.require_api_key()?;
            let orchestrator = build(config).await?;
            let job = orchestrator.snapshot(&job_id).await?.job;
            if job.status != JobStatus::Paused {
                anyhow::bail!("job {job_id} is {}, only PAUSED jobs can be resumed", job.status);
            }
            follow(&orchestrator, &job_id, cli.verbose).await?;
        }
        Command::Status { job_id, json } => {
            let orchestrator = build(config).await?;
            let snapshot = orchestrator.snapshot(&job_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                ui::print_snapshot(&snapshot);
            }
        }
        Command::Pause { job_id } => {
            let orchestrator = build(config).await?;
            let status = orchestrator.request_pause(&job_id).await?;
            println!("{job_id}: {status}");
        }
        Command::Stop { job_id, force } => {
            let orchestrator = build(config).await?;
            let status = if force {
                orchestrator.force_stop(&job_id).await?
            } else {
                orchestrator.request_stop(&job_id).await?
            };
            println!("{job_id}: {status}");
        }
        Command::Review { job_id, decision } => {
            let orchestrator = build(config).await?;
            let status = orchestrator
                .review(&job_id, decision == Decision::Approve)
                .await?;
            println!("{job_id}: {status}");
        }
    }

    Ok(())
}
