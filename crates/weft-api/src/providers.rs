// Provider HTTP routes: registration with reachability probe, lazy process
// materialisation with a TTL cache, provider-scoped execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use weft_contracts::{
    JobKind, Link, ProcessSummary, ProviderKind, ProviderList, ProviderProcessList,
    ProviderSummary, RegisterProviderRequest,
};
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::model::wps_io;
use weft_core::vault::VaultCrypto;
use weft_storage::{CreateProvider, Database, ProviderRow, Queue};

use crate::common::ApiError;
use crate::submission::{self, SubmissionContext};

const CAPABILITIES_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: Queue,
    pub settings: Arc<Settings>,
    pub crypto: Option<VaultCrypto>,
    pub client: reqwest::Client,
    /// Capabilities cache: provider id -> (summaries, fetched-at).
    pub capabilities: Arc<Mutex<HashMap<String, (Vec<ProcessSummary>, Instant)>>>,
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
        .route("/providers", get(list_providers).post(register_provider))
        .route(
            "/providers/:id",
            get(get_provider).delete(unregister_provider),
        )
        .route("/providers/:id/processes", get(list_provider_processes))
        .route(
            "/providers/:id/processes/:process_id",
            get(describe_provider_process),
        )
        .route(
            "/providers/:id/processes/:process_id/execution",
            post(execute_provider_process),
        )
        .route(
            "/providers/:id/processes/:process_id/jobs",
            post(execute_provider_process),
        )
        .with_state(state)
}

fn summary_of(row: &ProviderRow) -> ProviderSummary {
    ProviderSummary {
        id: row.id.clone(),
        url: row.url.clone(),
        title: row.title.clone(),
        description: row.description.clone(),
        public: row.public,
        kind: row
            .kind
            .parse()
            .unwrap_or(ProviderKind::Wps),
        diagnostic: row.diagnostic.clone(),
        links: Vec::new(),
    }
}

/// GET /providers
#[utoipa::path(
    get,
    path = "/providers",
    responses((status = 200, description = "Registered providers", body = ProviderList)),
    tag = "providers"
)]
pub async fn list_providers(
    State(state): State<AppState>,
) -> Result<Json<ProviderList>, ApiError> {
    let rows = state.db.list_providers().await.map_err(ApiError::from)?;
    Ok(Json(ProviderList {
        providers: rows.iter().map(summary_of).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    #[serde(default)]
    pub ignore_errors: bool,
}

/// Probe the provider for reachability; the diagnostic is stored when
/// registration proceeds despite a failure.
async fn probe(client: &reqwest::Client, url: &str, kind: ProviderKind) -> Option<String> {
    let probe_url = match kind {
        ProviderKind::Wps => format!(
            "{}?service=WPS&version=1.0.0&request=GetCapabilities",
            url.split('?').next().unwrap_or(url)
        ),
        ProviderKind::OgcApi => format!("{}/processes", url.trim_end_matches('/')),
    };
    match client
        .get(&probe_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => None,
        Ok(response) => Some(format!("capabilities probe returned {}", response.status())),
        Err(e) => Some(format!("capabilities probe failed: {}", e)),
    }
}

/// POST /providers
#[utoipa::path(
    post,
    path = "/providers",
    request_body = RegisterProviderRequest,
    responses(
        (status = 201, description = "Provider registered", body = ProviderSummary),
        (status = 422, description = "Provider unreachable under strict validation")
    ),
    tag = "providers"
)]
pub async fn register_provider(
    State(state): State<AppState>,
    Query(params): Query<RegisterParams>,
    Json(request): Json<RegisterProviderRequest>,
) -> Result<Response, ApiError> {
    if state
        .db
        .get_provider(&request.id)
        .await
        .map_err(ApiError::from)?
        .is_some()
    {
        return Err(ApiError(Error::ConflictInUse(format!(
            "provider '{}' is already registered",
            request.id
        ))));
    }

    let kind = request.kind.unwrap_or(ProviderKind::Wps);
    let diagnostic = probe(&state.client, &request.url, kind).await;
    if let Some(diagnostic) = &diagnostic {
        if !params.ignore_errors {
            return Err(ApiError(Error::ref_unreachable(&request.url, diagnostic)));
        }
        tracing::warn!(provider = %request.id, diagnostic, "registering unreachable provider");
    }

    let row = state
        .db
        .create_provider(CreateProvider {
            id: request.id.clone(),
            url: request.url.clone(),
            title: request.title.clone(),
            public: request.public,
            kind: kind.to_string(),
            credentials: request.credentials.clone(),
            diagnostic,
        })
        .await
        .map_err(ApiError::from)?;
    tracing::info!(provider = %row.id, url = %row.url, "provider registered");
    Ok((StatusCode::CREATED, Json(summary_of(&row))).into_response())
}

/// GET /providers/{id}
#[utoipa::path(
    get,
    path = "/providers/{id}",
    responses(
        (status = 200, description = "Provider", body = ProviderSummary),
        (status = 404, description = "Unknown provider")
    ),
    tag = "providers"
)]
pub async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProviderSummary>, ApiError> {
    let row = state
        .db
        .get_provider(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("provider '{}'", id)))?;
    let mut summary = summary_of(&row);
    let base = state.settings.url.trim_end_matches('/');
    summary.links = vec![
        Link::new(format!("{}/providers/{}", base, id), "self").with_type("application/json"),
        Link::new(format!("{}/providers/{}/processes", base, id), "processes")
            .with_type("application/json"),
    ];
    Ok(Json(summary))
}

/// DELETE /providers/{id}
#[utoipa::path(
    delete,
    path = "/providers/{id}",
    responses(
        (status = 204, description = "Provider removed"),
        (status = 404, description = "Unknown provider")
    ),
    tag = "providers"
)]
pub async fn unregister_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state.db.delete_provider(&id).await.map_err(ApiError::from)?;
    if !removed {
        return Err(ApiError::not_found(format!("provider '{}'", id)));
    }
    state.capabilities.lock().expect("cache poisoned").remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

/// Materialise the provider's process list, from cache when fresh.
async fn materialise(
    state: &AppState,
    row: &ProviderRow,
    headers: &HeaderMap,
) -> Result<Vec<ProcessSummary>, ApiError> {
    let no_cache = headers
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("no-cache"))
        .unwrap_or(false);
    if !no_cache {
        let cache = state.capabilities.lock().expect("cache poisoned");
        if let Some((summaries, at)) = cache.get(&row.id) {
            if at.elapsed() < CAPABILITIES_TTL {
                return Ok(summaries.clone());
            }
        }
    }

    let kind: ProviderKind = row.kind.parse().unwrap_or(ProviderKind::Wps);
    let summaries: Vec<ProcessSummary> = match kind {
        ProviderKind::Wps => {
            let url = format!(
                "{}?service=WPS&version=1.0.0&request=GetCapabilities",
                row.url.split('?').next().unwrap_or(&row.url)
            );
            let xml = state
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?
                .text()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?;
            wps_io::parse_capabilities(&xml)?
                .into_iter()
                .map(|process| ProcessSummary {
                    id: process.id,
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
                .collect()
        }
        ProviderKind::OgcApi => {
            let url = format!("{}/processes", row.url.trim_end_matches('/'));
            let document: Value = state
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?
                .json()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?;
            document
                .get("processes")
                .and_then(Value::as_array)
                .map(|processes| {
                    processes
                        .iter()
                        .filter_map(|p| serde_json::from_value(p.clone()).ok())
                        .collect()
                })
                .unwrap_or_default()
        }
    };

    state
        .capabilities
        .lock()
        .expect("cache poisoned")
        .insert(row.id.clone(), (summaries.clone(), Instant::now()));
    Ok(summaries)
}

/// GET /providers/{id}/processes
#[utoipa::path(
    get,
    path = "/providers/{id}/processes",
    responses(
        (status = 200, description = "Materialised processes", body = ProviderProcessList),
        (status = 422, description = "Provider unreachable")
    ),
    tag = "providers"
)]
pub async fn list_provider_processes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ProviderProcessList>, ApiError> {
    let row = state
        .db
        .get_provider(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("provider '{}'", id)))?;
    let processes = materialise(&state, &row, &headers).await?;
    Ok(Json(ProviderProcessList {
        provider: id,
        processes,
    }))
}

/// GET /providers/{id}/processes/{process_id} - lazy DescribeProcess
#[utoipa::path(
    get,
    path = "/providers/{id}/processes/{process_id}",
    responses(
        (status = 200, description = "Remote process description"),
        (status = 404, description = "Unknown provider or process")
    ),
    tag = "providers"
)]
pub async fn describe_provider_process(
    State(state): State<AppState>,
    Path((id, process_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let row = state
        .db
        .get_provider(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("provider '{}'", id)))?;
    let kind: ProviderKind = row.kind.parse().unwrap_or(ProviderKind::Wps);

    match kind {
        ProviderKind::Wps => {
            let url = format!(
                "{}?service=WPS&version=1.0.0&request=DescribeProcess&identifier={}",
                row.url.split('?').next().unwrap_or(&row.url),
                process_id
            );
            let xml = state
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?
                .text()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?;
            let info = wps_io::parse_describe_process(&xml)?;
            let mut model = weft_core::model::ProcessModel::new(
                &info.id,
                weft_contracts::ProcessKind::Wps1,
            );
            model.title = info.title;
            model.description = info.abstract_;
            model.inputs = info.inputs;
            model.outputs = info.outputs;
            Ok(Json(weft_core::model::render::ogc_description(&model)))
        }
        ProviderKind::OgcApi => {
            let url = format!(
                "{}/processes/{}",
                row.url.trim_end_matches('/'),
                process_id
            );
            let document: Value = state
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?
                .json()
                .await
                .map_err(|e| ApiError(Error::ref_unreachable(&row.url, e.to_string())))?;
            Ok(Json(document))
        }
    }
}

/// POST /providers/{id}/processes/{process_id}/execution
#[utoipa::path(
    post,
    path = "/providers/{id}/processes/{process_id}/execution",
    request_body = weft_contracts::ExecuteRequest,
    responses(
        (status = 201, description = "Job created"),
        (status = 404, description = "Unknown provider")
    ),
    tag = "providers"
)]
pub async fn execute_provider_process(
    State(state): State<AppState>,
    Path((id, process_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<weft_contracts::ExecuteRequest>,
) -> Result<Response, ApiError> {
    let _row = state
        .db
        .get_provider(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("provider '{}'", id)))?;
    submission::submit(
        &state.submission(),
        process_id,
        None,
        Some(id),
        JobKind::Provider,
        None,
        &headers,
        request,
    )
    .await
}
