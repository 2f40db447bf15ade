// Process HTTP routes: listing, deploy/replace/patch/undeploy, description
// renderings, package retrieval, and execution submission.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use weft_contracts::{
    DeploymentResult, JobKind, Link, ProcessList, UpdateProcessRequest,
};
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::fetch::Fetcher;
use weft_core::model::render;
use weft_core::vault::VaultCrypto;
use weft_storage::{CreateProcess, Database, ProcessQuery, Queue, ReviseProcess};

use crate::common::{split_process_ref, ApiError};
use crate::deploy;
use crate::submission::{self, SubmissionContext};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: Queue,
    pub settings: Arc<Settings>,
    pub fetcher: Arc<Fetcher>,
    pub crypto: Option<VaultCrypto>,
    pub client: reqwest::Client,
}

impl AppState {
    fn submission(&self) -> SubmissionContext {
        SubmissionContext {
            db: self.db.clone(),
            queue: self.queue.clone(),
            settings: self.settings.clone(),
            crypto: self.crypto.clone(),
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/processes", get(list_processes).post(deploy_process))
        .route(
            "/processes/:id",
            get(describe_process)
                .patch(patch_process)
                .put(put_process)
                .delete(undeploy_process),
        )
        .route("/processes/:id/package", get(get_package))
        .route(
            "/processes/:id/execution",
            post(execute_process),
        )
        .route("/processes/:id/jobs", post(execute_process))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListProcessesParams {
    #[serde(default)]
    pub detail: Option<bool>,
    #[serde(default)]
    pub links: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub page: i64,
    pub sort: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub revisions: bool,
    /// Include processes materialised from registered providers.
    #[serde(default)]
    pub providers: bool,
    /// Skip unreachable providers instead of failing the listing.
    #[serde(default = "default_true")]
    pub ignore: bool,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> i64 {
    50
}

/// GET /processes
#[utoipa::path(
    get,
    path = "/processes",
    params(
        ("detail" = Option<bool>, Query, description = "Return summaries instead of ids"),
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("page" = Option<i64>, Query, description = "Page number"),
        ("sort" = Option<String>, Query, description = "Sort key"),
        ("version" = Option<String>, Query, description = "Filter by version"),
        ("revisions" = Option<bool>, Query, description = "Include historical revisions")
    ),
    responses((status = 200, description = "Process listing", body = ProcessList)),
    tag = "processes"
)]
pub async fn list_processes(
    State(state): State<AppState>,
    Query(params): Query<ListProcessesParams>,
) -> Result<Response, ApiError> {
    let query = ProcessQuery {
        limit: params.limit.clamp(1, 500),
        page: params.page.max(0),
        revisions: params.revisions,
        version: params.version.clone(),
        sort: params.sort.clone(),
        public_only: false,
    };
    let (rows, total) = state.db.list_processes(&query).await.map_err(ApiError::from)?;

    if params.detail == Some(false) {
        let ids: Vec<String> = rows.into_iter().map(|r| r.process_id).collect();
        return Ok(Json(serde_json::json!({ "processes": ids, "total": total })).into_response());
    }

    let base = state.settings.url.trim_end_matches('/').to_string();
    let mut processes = Vec::with_capacity(rows.len());
    for row in rows {
        let model = row.to_model().map_err(ApiError::from)?;
        let mut summary = render::process_summary(&model);
        if params.links.unwrap_or(true) {
            summary.links = vec![Link::new(
                format!("{}/processes/{}", base, model.id),
                "self",
            )
            .with_type("application/json")];
        }
        processes.push(summary);
    }
    if params.providers {
        match provider_processes(&state, params.ignore).await {
            Ok(remote) => processes.extend(remote),
            Err(err) if !params.ignore => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err.0, "skipping unreachable providers in listing")
            }
        }
    }

    Ok(Json(ProcessList {
        processes,
        links: vec![Link::new(format!("{}/processes", base), "self").with_type("application/json")],
        total: Some(total as u64),
    })
    .into_response())
}

/// Materialise processes from every registered provider for the merged
/// listing. WPS providers answer GetCapabilities; OGC API providers answer
/// their own /processes.
async fn provider_processes(
    state: &AppState,
    ignore: bool,
) -> Result<Vec<weft_contracts::ProcessSummary>, ApiError> {
    use weft_core::model::wps_io;

    let providers = state.db.list_providers().await.map_err(ApiError::from)?;
    let mut summaries = Vec::new();
    for provider in providers {
        let result: Result<Vec<weft_contracts::ProcessSummary>, ApiError> = async {
            match provider.kind.as_str() {
                "ogc-api" => {
                    let url = format!("{}/processes", provider.url.trim_end_matches('/'));
                    let document: serde_json::Value = state
                        .client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| ApiError(Error::ref_unreachable(&provider.url, e.to_string())))?
                        .json()
                        .await
                        .map_err(|e| ApiError(Error::ref_unreachable(&provider.url, e.to_string())))?;
                    Ok(document
                        .get("processes")
                        .and_then(serde_json::Value::as_array)
                        .map(|list| {
                            list.iter()
                                .filter_map(|p| serde_json::from_value(p.clone()).ok())
                                .collect()
                        })
                        .unwrap_or_default())
                }
                _ => {
                    let url = format!(
                        "{}?service=WPS&version=1.0.0&request=GetCapabilities",
                        provider.url.split('?').next().unwrap_or(&provider.url)
                    );
                    let xml = state
                        .client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| ApiError(Error::ref_unreachable(&provider.url, e.to_string())))?
                        .text()
                        .await
                        .map_err(|e| ApiError(Error::ref_unreachable(&provider.url, e.to_string())))?;
                    Ok(wps_io::parse_capabilities(&xml)?
                        .into_iter()
                        .map(|process| weft_contracts::ProcessSummary {
                            id: format!("{}:{}", provider.id, process.id),
                            version: None,
                            title: process.title,
                            description: process.abstract_,
                            keywords: Vec::new(),
                            job_control_options: vec![
                                weft_contracts::JobControlOption::AsyncExecute,
                                weft_contracts::JobControlOption::Dismiss,
                            ],
                            output_transmission: vec![weft_contracts::TransmissionMode::Reference],
                            kind: Some(weft_contracts::ProcessKind::Wps1),
                            links: Vec::new(),
                        })
                        .collect())
                }
            }
        }
        .await;
        match result {
            Ok(mut remote) => summaries.append(&mut remote),
            Err(err) if ignore => {
                tracing::warn!(provider = %provider.id, error = %err.0, "provider listing failed");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(summaries)
}

/// POST /processes - deploy
#[utoipa::path(
    post,
    path = "/processes",
    request_body = Value,
    responses(
        (status = 201, description = "Process deployed", body = DeploymentResult),
        (status = 400, description = "Invalid payload"),
        (status = 409, description = "Process already deployed")
    ),
    tag = "processes"
)]
pub async fn deploy_process(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.len() as u64 > state.settings.wps_max_request_size {
        return Err(ApiError(Error::unprocessable("request body too large")));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let payload = deploy::parse_payload(&body, content_type)?;
    let docker_token = headers
        .get("x-auth-docker")
        .and_then(|v| v.to_str().ok())
        .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).to_string());

    let outcome = deploy::build_process(
        &state.settings,
        &state.fetcher,
        payload,
        None,
        docker_token.as_deref(),
    )
    .await?;

    if state
        .db
        .get_process(&outcome.create.model.id, None)
        .await
        .map_err(ApiError::from)?
        .is_some()
    {
        return Err(ApiError(Error::ConflictInUse(format!(
            "process '{}' is already deployed; use PUT to replace it",
            outcome.create.model.id
        ))));
    }

    let row = state
        .db
        .create_process(outcome.create)
        .await
        .map_err(ApiError::from)?;
    let model = row.to_model().map_err(ApiError::from)?;
    tracing::info!(process_id = %model.id, version = %model.version, "process deployed");

    Ok((
        StatusCode::CREATED,
        Json(DeploymentResult {
            id: model.id.clone(),
            version: model.version.to_string(),
            revision_id: model.revision_id,
            summary: render::process_summary(&model),
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct DescribeParams {
    pub f: Option<String>,
}

/// GET /processes/{id} - description (JSON, or WPS XML via f=xml/Accept)
#[utoipa::path(
    get,
    path = "/processes/{id}",
    params(
        ("id" = String, Path, description = "Process id, optionally id:version"),
        ("f" = Option<String>, Query, description = "Force format: json|xml")
    ),
    responses(
        (status = 200, description = "Process description"),
        (status = 404, description = "Unknown process")
    ),
    tag = "processes"
)]
pub async fn describe_process(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Query(params): Query<DescribeParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (id, version) = split_process_ref(&reference);
    let row = state
        .db
        .get_process(&id, version.as_deref())
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", reference)))?;
    let model = row.to_model().map_err(ApiError::from)?;

    let wants_xml = params.f.as_deref() == Some("xml")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|accept| accept.contains("application/xml") || accept.contains("text/xml"))
            .unwrap_or(false);
    if wants_xml {
        let xml = render::wps_description_xml(&model)?;
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            xml,
        )
            .into_response());
    }

    let mut document = render::ogc_description(&model);
    if let Some(object) = document.as_object_mut() {
        let base = state.settings.url.trim_end_matches('/');
        object.insert(
            "links".into(),
            serde_json::json!([
                { "href": format!("{}/processes/{}", base, model.id), "rel": "self" },
                { "href": format!("{}/processes/{}/package", base, model.id), "rel": "http://www.opengis.net/def/rel/ogc/1.0/application-package" },
                { "href": format!("{}/processes/{}/execution", base, model.id), "rel": "http://www.opengis.net/def/rel/ogc/1.0/execute" }
            ]),
        );
    }
    Ok(Json(document).into_response())
}

/// PATCH /processes/{id} - minor/patch revision
#[utoipa::path(
    patch,
    path = "/processes/{id}",
    request_body = UpdateProcessRequest,
    responses(
        (status = 200, description = "Revision created", body = DeploymentResult),
        (status = 404, description = "Unknown process")
    ),
    tag = "processes"
)]
pub async fn patch_process(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(request): Json<UpdateProcessRequest>,
) -> Result<Response, ApiError> {
    let (id, _) = split_process_ref(&reference);
    let row = state
        .db
        .get_process(&id, None)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", id)))?;
    let mut model = row.to_model().map_err(ApiError::from)?;

    // jobControlOptions or visibility changes are minor, documentation-only
    // changes are patch-level
    let minor = request.job_control_options.is_some() || request.visibility.is_some();
    let revision = ReviseProcess {
        title: request.title,
        description: request.description,
        keywords: request.keywords,
        metadata: request
            .metadata
            .map(|m| serde_json::to_value(m))
            .transpose()
            .map_err(|e| ApiError::internal(e))?,
        job_control_options: None,
        visibility: None,
    };

    if let Some(title) = revision.title {
        model.title = Some(title);
    }
    if let Some(description) = revision.description {
        model.description = Some(description);
    }
    if let Some(keywords) = revision.keywords {
        model.keywords = keywords;
    }
    if let Some(metadata) = revision.metadata {
        model.metadata =
            serde_json::from_value(metadata).map_err(|e| ApiError::schema(e.to_string()))?;
    }
    if let Some(options) = request.job_control_options {
        if options.is_empty() {
            return Err(ApiError::schema("jobControlOptions must not be empty"));
        }
        model.job_control_options = options;
    }
    if let Some(visibility) = request.visibility {
        model.visibility = visibility;
    }

    model.version = if minor {
        Version::new(model.version.major, model.version.minor + 1, 0)
    } else {
        Version::new(
            model.version.major,
            model.version.minor,
            model.version.patch + 1,
        )
    };
    model.revision_id = uuid::Uuid::now_v7();
    model.validate()?;

    let create = CreateProcess {
        model,
        execution_unit: row.execution_unit().map_err(ApiError::from)?,
        package: row.package.clone(),
    };
    let new_row = state.db.create_process(create).await.map_err(ApiError::from)?;
    let model = new_row.to_model().map_err(ApiError::from)?;
    tracing::info!(process_id = %model.id, version = %model.version, "process revised");

    Ok(Json(DeploymentResult {
        id: model.id.clone(),
        version: model.version.to_string(),
        revision_id: model.revision_id,
        summary: render::process_summary(&model),
    })
    .into_response())
}

/// PUT /processes/{id} - major revision (redeploy under the same id)
#[utoipa::path(
    put,
    path = "/processes/{id}",
    request_body = Value,
    responses(
        (status = 200, description = "Major revision created", body = DeploymentResult),
        (status = 404, description = "Unknown process")
    ),
    tag = "processes"
)]
pub async fn put_process(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (id, _) = split_process_ref(&reference);
    let existing = state
        .db
        .get_process(&id, None)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", id)))?;
    let previous: Version = existing
        .version
        .parse()
        .map_err(|e| ApiError::internal(e))?;
    let next = Version::new(previous.major + 1, 0, 0);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let payload = deploy::parse_payload(&body, content_type)?;
    let docker_token = headers
        .get("x-auth-docker")
        .and_then(|v| v.to_str().ok())
        .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).to_string());

    let outcome = deploy::build_process(
        &state.settings,
        &state.fetcher,
        payload,
        Some(next),
        docker_token.as_deref(),
    )
    .await?;
    if outcome.create.model.id != id {
        return Err(ApiError::schema(format!(
            "payload process id '{}' does not match path '{}'",
            outcome.create.model.id, id
        )));
    }

    let row = state
        .db
        .create_process(outcome.create)
        .await
        .map_err(ApiError::from)?;
    let model = row.to_model().map_err(ApiError::from)?;
    tracing::info!(process_id = %model.id, version = %model.version, "process replaced");

    Ok(Json(DeploymentResult {
        id: model.id.clone(),
        version: model.version.to_string(),
        revision_id: model.revision_id,
        summary: render::process_summary(&model),
    })
    .into_response())
}

/// DELETE /processes/{id} - undeploy
#[utoipa::path(
    delete,
    path = "/processes/{id}",
    responses(
        (status = 204, description = "Process undeployed"),
        (status = 404, description = "Unknown process"),
        (status = 409, description = "Running jobs reference the process")
    ),
    tag = "processes"
)]
pub async fn undeploy_process(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<StatusCode, ApiError> {
    let (id, _) = split_process_ref(&reference);
    let row = state
        .db
        .get_process(&id, None)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", id)))?;
    if row.kind == "builtin" {
        return Err(ApiError(Error::Forbidden(
            "builtin processes cannot be undeployed".into(),
        )));
    }

    let active = state
        .db
        .count_active_jobs_for_process(&id)
        .await
        .map_err(ApiError::from)?;
    if active > 0 {
        return Err(ApiError(Error::ConflictInUse(id)));
    }

    state.db.tombstone_process(&id).await.map_err(ApiError::from)?;
    tracing::info!(process_id = %id, "process undeployed");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /processes/{id}/package - the CWL application package
#[utoipa::path(
    get,
    path = "/processes/{id}/package",
    responses(
        (status = 200, description = "CWL document"),
        (status = 404, description = "Unknown process or non-CWL process")
    ),
    tag = "processes"
)]
pub async fn get_package(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Response, ApiError> {
    let (id, version) = split_process_ref(&reference);
    let row = state
        .db
        .get_process(&id, version.as_deref())
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", reference)))?;
    let package = row
        .package
        .clone()
        .ok_or_else(|| ApiError::not_found(format!("process '{}' has no CWL package", id)))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/cwl+json")],
        Json(package),
    )
        .into_response())
}

/// POST /processes/{id}/execution - submit a job
#[utoipa::path(
    post,
    path = "/processes/{id}/execution",
    request_body = weft_contracts::ExecuteRequest,
    responses(
        (status = 200, description = "Synchronous results"),
        (status = 201, description = "Job created"),
        (status = 404, description = "Unknown process"),
        (status = 409, description = "Process not executable by this client")
    ),
    tag = "jobs"
)]
pub async fn execute_process(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
    Json(request): Json<weft_contracts::ExecuteRequest>,
) -> Result<Response, ApiError> {
    let (id, version) = split_process_ref(&reference);
    let row = state
        .db
        .get_process(&id, version.as_deref())
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", reference)))?;
    let model = row.to_model().map_err(ApiError::from)?;

    if model.visibility == weft_contracts::Visibility::Private && row.kind != "builtin" {
        // visibility gating hook: without an authorization layer the
        // private flag refuses outside submission outright
        return Err(ApiError(Error::ConflictInUse(format!(
            "process '{}' is private",
            id
        ))));
    }

    let kind = if row.kind == "workflow" {
        JobKind::Workflow
    } else {
        JobKind::Process
    };
    submission::submit(
        &state.submission(),
        id,
        version,
        None,
        kind,
        Some(model.job_control_options.clone()),
        &headers,
        request,
    )
    .await
}
