//! HTTP endpoints for triggering and steering jobs.
//!
//! Triggers acknowledge with 202 and run the job in the background; callers
//! poll `GET /api/jobs/:id` for progress.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::course::{PipelineKind, Validity};
use crate::error::LecternError;
use crate::orchestrator::{Orchestrator, TriggerRequest};
use crate::state_machine::Job;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerBody {
    artifact_id: Option<String>,
    job_id: Option<String>,
    custom_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetriggerBody {
    artifact_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    approve: bool,
}

#[derive(Debug, Deserialize)]
struct ValidityBody {
    validity: String,
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn error_response(err: LecternError) -> Response {
    let status = match &err {
        LecternError::Config(_) | LecternError::MissingPlan(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        LecternError::JobNotFound(_)
        | LecternError::ArtifactNotFound(_)
        | LecternError::ResultNotFound(_) => StatusCode::NOT_FOUND,
        LecternError::Transition(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    json_error(status, err.to_string())
}

fn accepted(job: &Job) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job.id, "status": job.status })),
    )
        .into_response()
}

fn required(field: Option<String>, name: &str) -> Result<String, Response> {
    match field.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(json_error(
            StatusCode::BAD_REQUEST,
            format!("missing required field: {name}"),
        )),
    }
}

/// Unreadable bodies get the same `{error}` shape as every other failure.
fn read_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        json_error(
            StatusCode::BAD_REQUEST,
            format!("invalid request body: {}", rejection.body_text()),
        )
    })
}

fn parse_pipeline(raw: &str) -> Result<PipelineKind, Response> {
    raw.parse()
        .map_err(|e: String| json_error(StatusCode::BAD_REQUEST, e))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/pipelines/:pipeline/jobs", post(trigger))
        .route("/api/pipelines/:pipeline/retrigger", post(retrigger))
        .route("/api/jobs/:id", get(snapshot))
        .route("/api/jobs/:id/pause", post(pause))
        .route("/api/jobs/:id/stop", post(stop))
        .route("/api/jobs/:id/force-stop", post(force_stop))
        .route("/api/jobs/:id/resume", post(resume))
        .route("/api/jobs/:id/review", post(review))
        .route("/api/results/:id", patch(set_validity))
        .with_state(state)
}

async fn trigger(
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
    payload: Result<Json<TriggerBody>, JsonRejection>,
) -> Response {
    let body = match read_body(payload) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let pipeline = match parse_pipeline(&pipeline) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let request = match (
        required(body.artifact_id, "artifactId"),
        required(body.job_id, "jobId"),
    ) {
        (Ok(artifact_id), Ok(job_id)) => TriggerRequest {
            artifact_id,
            job_id,
            custom_prompt: body.custom_prompt,
        },
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.orchestrator.trigger(pipeline, request).await {
        Ok(job) => accepted(&job),
        Err(e) => error_response(e),
    }
}

async fn retrigger(
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
    payload: Result<Json<RetriggerBody>, JsonRejection>,
) -> Response {
    let body = match read_body(payload) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let pipeline = match parse_pipeline(&pipeline) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let artifact_id = match required(body.artifact_id, "artifactId") {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state.orchestrator.retrigger(&artifact_id, pipeline).await {
        Ok(job) => accepted(&job),
        Err(e) => error_response(e),
    }
}

async fn snapshot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.snapshot(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

fn status_reply(result: Result<crate::state_machine::JobStatus, LecternError>, id: &str) -> Response {
    match result {
        Ok(status) => Json(json!({ "jobId": id, "status": status })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    status_reply(state.orchestrator.request_pause(&id).await, &id)
}

async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    status_reply(state.orchestrator.request_stop(&id).await, &id)
}

async fn force_stop(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    status_reply(state.orchestrator.force_stop(&id).await, &id)
}

async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.resume(&id).await {
        Ok(job) => accepted(&job),
        Err(e) => error_response(e),
    }
}

async fn review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ReviewBody>, JsonRejection>,
) -> Response {
    let body = match read_body(payload) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    status_reply(state.orchestrator.review(&id, body.approve).await, &id)
}

async fn set_validity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ValidityBody>, JsonRejection>,
) -> Response {
    let body = match read_body(payload) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let validity: Validity = match body.validity.parse() {
        Ok(v) => v,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e),
    };
    match state.orchestrator.override_validity(&id, validity).await {
        Ok(()) => Json(json!({ "resultId": id, "validity": validity })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Binds and serves until Ctrl-C.
pub async fn serve(orchestrator: Arc<Orchestrator>, bind_addr: &str) -> Result<(), LecternError> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, router(AppState { orchestrator }))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::LecternConfig;
    use crate::engine::controller::testing::{Reply, ScriptedGenerator};
    use crate::engine::pipeline::testing::StubCheck;
    use crate::engine::sleeper::testing::RecordingSleeper;
    use crate::orchestrator::testing::{config, plan, request};
    use crate::state_machine::JobStatus;
    use crate::store::{JobStore, MemoryStore};

    async fn app_with(config: LecternConfig) -> (Arc<Orchestrator>, Router) {
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(MemoryStore::new()),
                Arc::new(ScriptedGenerator::answering(Reply::Sources(1))),
                Arc::new(StubCheck::default()),
                config,
            )
            .with_sleeper(Arc::new(RecordingSleeper::default())),
        );
        orchestrator.import_plan(&plan("course-1", 2)).await.unwrap();
        let app = router(AppState {
            orchestrator: orchestrator.clone(),
        });
        (orchestrator, app)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn trigger_acknowledges_with_202() {
        let (orchestrator, app) = app_with(config()).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/pipelines/sources/jobs",
            Some(json!({"artifactId": "course-1", "jobId": "job-1", "customPrompt": "Be brief"})),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["jobId"], "job-1");
        assert_eq!(body["status"], "DRAFT");
        let job = orchestrator.store().job("job-1").await.unwrap().unwrap();
        assert_eq!(job.custom_prompt.as_deref(), Some("Be brief"));
    }

    #[tokio::test]
    async fn trigger_rejects_missing_fields() {
        let (_, app) = app_with(config()).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/pipelines/sources/jobs",
            Some(json!({"artifactId": "course-1"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing required field: jobId");
    }

    #[tokio::test]
    async fn unreadable_bodies_use_the_error_shape() {
        let (_, app) = app_with(config()).await;
        let (status, body) = call(app.clone(), "POST", "/api/pipelines/sources/jobs", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid request body"));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs/job-1/review")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn trigger_without_api_key_is_server_error() {
        let config = LecternConfig {
            api_key: String::new(),
            ..config()
        };
        let (_, app) = app_with(config).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/pipelines/materials/jobs",
            Some(json!({"artifactId": "course-1", "jobId": "job-1"})),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("GEMINI_API_KEY"));
    }

    #[tokio::test]
    async fn unknown_pipeline_is_bad_request() {
        let (_, app) = app_with(config()).await;
        let (status, _) = call(
            app,
            "POST",
            "/api/pipelines/videos/jobs",
            Some(json!({"artifactId": "course-1", "jobId": "job-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retrigger_unknown_artifact_is_not_found() {
        let (_, app) = app_with(config()).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/pipelines/sources/retrigger",
            Some(json!({"artifactId": "course-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("course-1"));
    }

    #[tokio::test]
    async fn snapshot_exposes_polled_fields() {
        let (orchestrator, app) = app_with(config()).await;
        orchestrator
            .prepare(PipelineKind::Sources, request("course-1", "job-1"))
            .await
            .unwrap();
        orchestrator.run("job-1").await.unwrap();

        let (status, body) = call(app, "GET", "/api/jobs/job-1", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["status"], "READY_FOR_QA");
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["items"][0]["status"], "APPROVABLE");
        assert!(body["items"][0]["dod"]["errors"].is_array());
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn control_endpoints_map_errors() {
        let (orchestrator, app) = app_with(config()).await;
        orchestrator
            .prepare(PipelineKind::Sources, request("course-1", "job-1"))
            .await
            .unwrap();

        let (status, _) = call(app.clone(), "POST", "/api/jobs/job-1/pause", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(app.clone(), "POST", "/api/jobs/job-1/force-stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "STOPPED");
        assert_eq!(
            orchestrator.store().job("job-1").await.unwrap().unwrap().status,
            JobStatus::Stopped
        );

        let (status, _) = call(app, "POST", "/api/jobs/missing/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn validity_override_endpoint() {
        let (orchestrator, app) = app_with(config()).await;
        orchestrator
            .prepare(PipelineKind::Sources, request("course-1", "job-1"))
            .await
            .unwrap();
        orchestrator.run("job-1").await.unwrap();
        let result_id = orchestrator.store().results("job-1").await.unwrap()[0]
            .id
            .clone();

        let (status, body) = call(
            app.clone(),
            "PATCH",
            &format!("/api/results/{result_id}"),
            Some(json!({"validity": "rejected"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["validity"], "rejected");

        let (status, _) = call(
            app,
            "PATCH",
            &format!("/api/results/{result_id}"),
            Some(json!({"validity": "maybe"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
