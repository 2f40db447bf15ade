// Job HTTP routes: listing with filters, status documents, inputs/outputs/
// results/exceptions/logs/statistics, provenance, on-trigger updates and
// dismissal.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use weft_contracts::{
    BatchDismissRequest, JobList, JobStatus, Link, LogEntry, StatusProfile, UpdateJobRequest,
};
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::prov::{ProvDocument, ProvFormat};
use weft_storage::{Database, JobQuery, JobRow, Queue, UpdateJob};

use crate::common::ApiError;
use crate::submission::{status_response, terminal_response};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: Queue,
    pub settings: Arc<Settings>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).delete(batch_dismiss))
        .route(
            "/jobs/:job_id",
            get(get_job).patch(patch_job).delete(dismiss_job),
        )
        .route("/jobs/:job_id/results", get(get_results).post(trigger_job))
        .route("/jobs/:job_id/inputs", get(get_inputs))
        .route("/jobs/:job_id/outputs", get(get_outputs))
        .route("/jobs/:job_id/exceptions", get(get_exceptions))
        .route("/jobs/:job_id/logs", get(get_logs))
        .route("/jobs/:job_id/statistics", get(get_statistics))
        .route("/jobs/:job_id/prov", get(get_prov))
        .route("/jobs/:job_id/prov/:section", get(get_prov_section))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub process: Option<String>,
    pub provider: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub tags: Option<String>,
    #[serde(rename = "minDuration")]
    pub min_duration: Option<i64>,
    #[serde(rename = "maxDuration")]
    pub max_duration: Option<i64>,
    pub datetime: Option<String>,
    pub sort: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub page: i64,
}

fn default_limit() -> i64 {
    50
}

/// Parse an OGC `datetime` parameter: instant, `start/end`, open ranges
/// with `..`.
fn parse_datetime(
    raw: &str,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ApiError> {
    let parse_one = |s: &str| -> Result<Option<DateTime<Utc>>, ApiError> {
        if s.is_empty() || s == ".." {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| ApiError::schema(format!("invalid datetime '{}': {}", s, e)))
    };
    match raw.split_once('/') {
        Some((start, end)) => Ok((parse_one(start)?, parse_one(end)?)),
        None => {
            let instant = parse_one(raw)?;
            Ok((instant, instant))
        }
    }
}

fn load_job(db: &Database, id: Uuid) -> impl std::future::Future<Output = Result<JobRow, ApiError>> + '_ {
    async move {
        db.get_job(id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found(format!("job {}", id)))
    }
}

/// GET /jobs - listing with filters
#[utoipa::path(
    get,
    path = "/jobs",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("process" = Option<String>, Query, description = "Filter by process id"),
        ("provider" = Option<String>, Query, description = "Filter by provider id"),
        ("type" = Option<String>, Query, description = "process|provider|workflow"),
        ("tags" = Option<String>, Query, description = "Comma-separated tag filter"),
        ("datetime" = Option<String>, Query, description = "Creation instant or interval"),
        ("minDuration" = Option<i64>, Query, description = "Minimum duration in seconds"),
        ("maxDuration" = Option<i64>, Query, description = "Maximum duration in seconds"),
        ("sort" = Option<String>, Query, description = "Sort key"),
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("page" = Option<i64>, Query, description = "Page number")
    ),
    responses((status = 200, description = "Job listing", body = JobList)),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<JobList>, ApiError> {
    let (created_after, created_before) = match &params.datetime {
        Some(raw) => parse_datetime(raw)?,
        None => (None, None),
    };
    let status = params
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<JobStatus>()
                .map(|s| s.to_string())
                .map_err(|e| ApiError::schema(e))
        })
        .transpose()?;
    let query = JobQuery {
        status,
        process_id: params.process.clone(),
        provider_id: params.provider.clone(),
        kind: params.kind.clone(),
        tags: params
            .tags
            .as_deref()
            .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        min_duration_secs: params.min_duration,
        max_duration_secs: params.max_duration,
        created_after,
        created_before,
        sort: params.sort.clone(),
        limit: params.limit.clamp(1, 500),
        page: params.page.max(0),
    };
    let (rows, total) = state.db.list_jobs(&query).await.map_err(ApiError::from)?;
    let base = state.settings.url.trim_end_matches('/').to_string();
    let jobs = rows
        .into_iter()
        .map(|row| {
            let mut info = row.to_status_info(StatusProfile::Ogc);
            info.links = vec![Link::new(format!("{}/jobs/{}", base, row.id), "self")
                .with_type("application/json")];
            info
        })
        .collect();
    Ok(Json(JobList {
        jobs,
        links: vec![Link::new(format!("{}/jobs", base), "self").with_type("application/json")],
        total: Some(total as u64),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    pub profile: Option<String>,
    pub f: Option<String>,
    pub schema: Option<String>,
}

fn profile_of(params: &ProfileParams) -> StatusProfile {
    match params.profile.as_deref() {
        Some("wps") => StatusProfile::Wps,
        Some("openeo") => StatusProfile::OpenEo,
        _ => StatusProfile::Ogc,
    }
}

/// GET /jobs/{id} - status document
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Status document", body = weft_contracts::StatusInfo),
        (status = 404, description = "Unknown job")
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<ProfileParams>,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let mut info = job.to_status_info(profile_of(&params));
    let base = state.settings.url.trim_end_matches('/');
    info.links = vec![
        Link::new(format!("{}/jobs/{}", base, job.id), "self").with_type("application/json"),
        Link::new(format!("{}/jobs/{}/results", base, job.id), "results")
            .with_type("application/json"),
        Link::new(format!("{}/jobs/{}/logs", base, job.id), "logs").with_type("application/json"),
    ];
    Ok(Json(info).into_response())
}

/// PATCH /jobs/{id} - update a pending (on-trigger) job
#[utoipa::path(
    patch,
    path = "/jobs/{id}",
    request_body = UpdateJobRequest,
    responses(
        (status = 200, description = "Job updated"),
        (status = 404, description = "Unknown job"),
        (status = 422, description = "Job is not editable")
    ),
    tag = "jobs"
)]
pub async fn patch_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<UpdateJobRequest>,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    // only on-trigger jobs are editable, and only these four fields
    if job.status() != JobStatus::Created {
        return Err(ApiError(Error::unprocessable(
            "only jobs awaiting their trigger can be updated",
        )));
    }
    let inputs = match request.inputs {
        Some(new_inputs) => {
            let mut stored: Value = job.inputs.clone();
            if let Some(object) = stored.as_object_mut() {
                object.insert("inputs".into(), new_inputs);
            }
            Some(stored)
        }
        None => None,
    };
    let update = UpdateJob {
        inputs,
        outputs_request: request.outputs,
        tags: request.tags,
        ..Default::default()
    };
    let updated = state
        .db
        .update_job(job_id, job.updated_at, update)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError(Error::unprocessable("job was modified concurrently")))?;
    Ok(Json(updated.to_status_info(StatusProfile::Ogc)).into_response())
}

/// POST /jobs/{id}/results - trigger an on-trigger job
#[utoipa::path(
    post,
    path = "/jobs/{id}/results",
    responses(
        (status = 202, description = "Job accepted"),
        (status = 404, description = "Unknown job"),
        (status = 422, description = "Job is not awaiting a trigger")
    ),
    tag = "jobs"
)]
pub async fn trigger_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    if job.status() != JobStatus::Created {
        return Err(ApiError(Error::unprocessable(
            "job is not awaiting a trigger",
        )));
    }
    let updated = state
        .db
        .transition_job(job_id, JobStatus::Accepted, UpdateJob::default())
        .await
        .map_err(ApiError::from)?;
    state.queue.enqueue(job_id).await.map_err(ApiError::from)?;
    state
        .db
        .append_job_log(job_id, "INFO", "job triggered")
        .await
        .map_err(ApiError::from)?;
    Ok(status_response(
        &state.settings,
        &updated,
        StatusCode::ACCEPTED,
    ))
}

/// GET /jobs/{id}/inputs - submitted inputs and resolution
#[utoipa::path(
    get,
    path = "/jobs/{id}/inputs",
    responses((status = 200, description = "Submitted inputs")),
    tag = "jobs"
)]
pub async fn get_inputs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let mut document = json!({
        "inputs": job.inputs.get("inputs").cloned().unwrap_or(Value::Null),
        "outputs": job.outputs_request,
        "mode": job.execution_mode,
        "response": job.response_form,
    });
    if let Some(object) = document.as_object_mut() {
        if let Some(context) = &job.output_context {
            object.insert("outputContext".into(), json!(context));
        }
    }
    Ok(Json(document))
}

/// GET /jobs/{id}/outputs?schema=OGC|OLD[+strict]
#[utoipa::path(
    get,
    path = "/jobs/{id}/outputs",
    params(("schema" = Option<String>, Query, description = "OGC | OLD, with optional +strict")),
    responses(
        (status = 200, description = "Result map"),
        (status = 410, description = "Job dismissed")
    ),
    tag = "jobs"
)]
pub async fn get_outputs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<ProfileParams>,
) -> Result<Json<Value>, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    ensure_results_available(&job)?;
    let results = job.results.clone().unwrap_or(json!({}));
    let schema = params.schema.as_deref().unwrap_or("OGC");
    let strict = schema.ends_with("+strict");
    let schema = schema.trim_end_matches("+strict");

    if schema.eq_ignore_ascii_case("old") {
        // legacy list form with data/href entries
        let mut outputs = Vec::new();
        if let Some(map) = results.as_object() {
            for (id, entry) in map {
                let mut item = json!({ "id": id });
                if let Some(href) = entry.get("href") {
                    item["href"] = href.clone();
                    if !strict {
                        if let Some(media_type) = entry.get("type") {
                            item["mimeType"] = media_type.clone();
                        }
                    }
                } else if let Some(value) = entry.get("value") {
                    item["data"] = value.clone();
                }
                outputs.push(item);
            }
        }
        return Ok(Json(json!({ "outputs": outputs })));
    }

    let mut rendered = results;
    if !strict {
        if let Some(map) = rendered.as_object_mut() {
            for entry in map.values_mut() {
                if let Some(object) = entry.as_object_mut() {
                    if let Some(media_type) = object.get("type").cloned() {
                        object
                            .entry("format")
                            .or_insert(json!({ "mediaType": media_type }));
                    }
                }
            }
        }
    }
    Ok(Json(rendered))
}

/// GET /jobs/{id}/results - final results per the OGC schema
#[utoipa::path(
    get,
    path = "/jobs/{id}/results",
    responses(
        (status = 200, description = "Results document"),
        (status = 404, description = "Unknown job"),
        (status = 410, description = "Job dismissed")
    ),
    tag = "jobs"
)]
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    ensure_results_available(&job)?;
    match job.status() {
        JobStatus::Successful => {
            let form = if job.response_form == "raw" {
                weft_contracts::ResponseForm::Raw
            } else {
                weft_contracts::ResponseForm::Document
            };
            Ok(terminal_response(&state.settings, &job, form))
        }
        JobStatus::Failed => Err(ApiError(Error::RunnerFailed {
            detail: job.message.clone().unwrap_or_else(|| "job failed".into()),
            stderr_tail: String::new(),
        })),
        _ => Err(ApiError(Error::unprocessable(format!(
            "job is {}, results are not available",
            job.status()
        )))),
    }
}

fn ensure_results_available(job: &JobRow) -> Result<(), ApiError> {
    if job.status() == JobStatus::Dismissed {
        return Err(ApiError::gone(format!("job {} was dismissed", job.id)));
    }
    Ok(())
}

/// GET /jobs/{id}/exceptions
#[utoipa::path(
    get,
    path = "/jobs/{id}/exceptions",
    responses((status = 200, description = "Recorded exceptions")),
    tag = "jobs"
)]
pub async fn get_exceptions(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    Ok(Json(job.exceptions.clone()))
}

/// GET /jobs/{id}/logs?f=text|json|yaml|xml
#[utoipa::path(
    get,
    path = "/jobs/{id}/logs",
    params(("f" = Option<String>, Query, description = "text|json|yaml|xml")),
    responses((status = 200, description = "Job logs")),
    tag = "jobs"
)]
pub async fn get_logs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<ProfileParams>,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let entries = job.log_entries();
    match params.f.as_deref().unwrap_or("json") {
        "text" => {
            let text: String = entries
                .iter()
                .map(|e| format!("{} [{}] {}\n", e.timestamp.to_rfc3339(), e.level, e.message))
                .collect();
            Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], text).into_response())
        }
        "yaml" => {
            let yaml = serde_yaml::to_string(&entries).map_err(|e| ApiError::internal(e))?;
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/x-yaml")],
                yaml,
            )
                .into_response())
        }
        "xml" => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            logs_xml(&entries)?,
        )
            .into_response()),
        _ => Ok(Json(entries).into_response()),
    }
}

fn logs_xml(entries: &[LogEntry]) -> Result<String, ApiError> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
    use quick_xml::Writer;
    let mut writer = Writer::new(Vec::new());
    let render = |writer: &mut Writer<Vec<u8>>| -> Result<(), quick_xml::Error> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("logs")))?;
        for entry in entries {
            let mut start = BytesStart::new("entry");
            start.push_attribute(("timestamp", entry.timestamp.to_rfc3339().as_str()));
            start.push_attribute(("level", entry.level.as_str()));
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Text(BytesText::new(&entry.message)))?;
            writer.write_event(Event::End(BytesEnd::new("entry")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("logs")))?;
        Ok(())
    };
    render(&mut writer).map_err(|e| ApiError::internal(e))?;
    String::from_utf8(writer.into_inner()).map_err(|e| ApiError::internal(e))
}

/// GET /jobs/{id}/statistics
#[utoipa::path(
    get,
    path = "/jobs/{id}/statistics",
    responses((status = 200, description = "Execution statistics")),
    tag = "jobs"
)]
pub async fn get_statistics(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let statistics = job
        .statistics
        .clone()
        .ok_or_else(|| ApiError::not_found("statistics are recorded at job termination"))?;
    Ok(Json(statistics))
}

async fn load_prov(state: &AppState, job: &JobRow) -> Result<ProvDocument, ApiError> {
    if !state.settings.cwl_prov {
        return Err(ApiError::not_found("provenance capture is disabled"));
    }
    let path = state
        .settings
        .job_output_dir(job.output_context.as_deref(), job.id)
        .join("prov")
        .join("model.json");
    let raw = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("no provenance recorded for this job"))?;
    serde_json::from_slice(&raw).map_err(|e| ApiError::internal(e))
}

/// GET /jobs/{id}/prov - provenance in a negotiated encoding
#[utoipa::path(
    get,
    path = "/jobs/{id}/prov",
    params(("f" = Option<String>, Query, description = "provn|nt|json|jsonld|xml|turtle")),
    responses(
        (status = 200, description = "PROV document"),
        (status = 404, description = "No provenance recorded")
    ),
    tag = "jobs"
)]
pub async fn get_prov(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<ProfileParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let document = load_prov(&state, &job).await?;
    let format = match params.f.as_deref() {
        Some("provn") => ProvFormat::Provn,
        Some("nt") => ProvFormat::Nt,
        Some("json") => ProvFormat::Json,
        Some("jsonld") => ProvFormat::JsonLd,
        Some("xml") => ProvFormat::Xml,
        Some("turtle") | Some("ttl") => ProvFormat::Turtle,
        Some(other) => {
            return Err(ApiError::schema(format!("unknown provenance format '{}'", other)))
        }
        None => headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .and_then(|accept| {
                accept
                    .split(',')
                    .filter_map(|m| ProvFormat::from_media_type(m.split(';').next().unwrap_or(m)))
                    .next()
            })
            .unwrap_or(ProvFormat::Json),
    };
    let body = document.emit(format)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, format.media_type())],
        body,
    )
        .into_response())
}

/// GET /jobs/{id}/prov/{section} - info|who|run|inputs|outputs|{runId}
#[utoipa::path(
    get,
    path = "/jobs/{id}/prov/{section}",
    responses((status = 200, description = "PROV section")),
    tag = "jobs"
)]
pub async fn get_prov_section(
    State(state): State<AppState>,
    Path((job_id, section)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let document = load_prov(&state, &job).await?;
    let body = match section.as_str() {
        "info" => json!({
            "jobID": document.job_id,
            "process": document.process_id,
            "version": document.process_version,
            "started": document.job.started,
            "finished": document.job.ended,
        }),
        "who" => json!({ "agent": "engine", "type": "prov:SoftwareAgent" }),
        "run" => serde_json::to_value(&document.job).map_err(|e| ApiError::internal(e))?,
        "inputs" => serde_json::to_value(
            document
                .entities
                .iter()
                .filter(|e| e.role == weft_core::prov::EntityRole::Input)
                .collect::<Vec<_>>(),
        )
        .map_err(|e| ApiError::internal(e))?,
        "outputs" => serde_json::to_value(
            document
                .entities
                .iter()
                .filter(|e| e.role == weft_core::prov::EntityRole::Output)
                .collect::<Vec<_>>(),
        )
        .map_err(|e| ApiError::internal(e))?,
        run_id => {
            let step = document
                .steps
                .iter()
                .find(|s| s.id.ends_with(run_id) || s.label == run_id)
                .ok_or_else(|| ApiError::not_found(format!("no step run '{}'", run_id)))?;
            serde_json::to_value(step).map_err(|e| ApiError::internal(e))?
        }
    };
    Ok(Json(body))
}

/// DELETE /jobs/{id} - dismiss
#[utoipa::path(
    delete,
    path = "/jobs/{id}",
    responses(
        (status = 200, description = "Job already terminal, state unchanged"),
        (status = 202, description = "Dismissal accepted"),
        (status = 404, description = "Unknown job")
    ),
    tag = "jobs"
)]
pub async fn dismiss_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = load_job(&state.db, job_id).await?;
    let response = dismiss(&state, job).await?;
    Ok(response)
}

/// Dismissal: idempotent on terminal jobs; synchronous queue removal from
/// accepted; marker plus immediate dismissed state from running.
pub async fn dismiss(state: &AppState, job: JobRow) -> Result<Response, ApiError> {
    if job.is_terminal() {
        // idempotent: report the current state unchanged
        return Ok(status_response(&state.settings, &job, StatusCode::OK));
    }

    let transition = state
        .db
        .transition_job(
            job.id,
            JobStatus::Dismissed,
            UpdateJob {
                cancel_requested: Some(true),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    let updated = match transition {
        Ok(row) => row,
        Err(err) => {
            // the worker may have finished the job between our read and
            // the transition; dismissal of a terminal job stays idempotent
            let current = state
                .db
                .get_job(job.id)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::not_found(format!("job {}", job.id)))?;
            if current.is_terminal() {
                return Ok(status_response(&state.settings, &current, StatusCode::OK));
            }
            return Err(ApiError::from(err));
        }
    };
    state.queue.remove(job.id).await.map_err(ApiError::from)?;
    state
        .db
        .append_job_log(job.id, "INFO", "job dismissed")
        .await
        .map_err(ApiError::from)?;

    // outputs of a dismissed job are purged
    let out_dir = state
        .settings
        .job_output_dir(job.output_context.as_deref(), job.id);
    if let Err(e) = tokio::fs::remove_dir_all(&out_dir).await {
        tracing::debug!(job_id = %job.id, error = %e, "no outputs to purge");
    }

    tracing::info!(job_id = %job.id, "job dismissed");
    Ok(status_response(
        &state.settings,
        &updated,
        StatusCode::ACCEPTED,
    ))
}

/// DELETE /jobs - batch dismissal
#[utoipa::path(
    delete,
    path = "/jobs",
    request_body = BatchDismissRequest,
    responses((status = 200, description = "Per-job dismissal outcome")),
    tag = "jobs"
)]
pub async fn batch_dismiss(
    State(state): State<AppState>,
    Json(request): Json<BatchDismissRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut dismissed = Vec::new();
    let mut missing = Vec::new();
    for job_id in request.jobs {
        match state.db.get_job(job_id).await.map_err(ApiError::from)? {
            Some(job) => {
                dismiss(&state, job).await?;
                dismissed.push(job_id);
            }
            None => missing.push(job_id),
        }
    }
    Ok(Json(json!({ "dismissed": dismissed, "missing": missing })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_parsing() {
        let (start, end) = parse_datetime("2026-08-01T00:00:00Z/2026-08-02T00:00:00Z").unwrap();
        assert!(start.is_some() && end.is_some());

        let (start, end) = parse_datetime("../2026-08-02T00:00:00Z").unwrap();
        assert!(start.is_none() && end.is_some());

        let (start, end) = parse_datetime("2026-08-01T00:00:00Z").unwrap();
        assert_eq!(start, end);
        assert!(start.is_some());

        assert!(parse_datetime("yesterday").is_err());
    }
}
