// Job submission shared by process- and provider-scoped execution
// endpoints: mode resolution, job creation, queueing, and the synchronous
// wait bridge.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use uuid::Uuid;

use weft_contracts::{
    ExecuteRequest, ExecutionMode, JobControlOption, JobKind, JobStatus, ResponseForm,
    StatusProfile, Subscribers,
};
use weft_core::auth::AuthContext;
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::vault::VaultCrypto;
use weft_storage::{CreateJob, Database, JobRow, Queue};

use crate::common::{output_context, parse_prefer, ApiError, Preferences};

pub struct SubmissionContext {
    pub db: Database,
    pub queue: Queue,
    pub settings: Arc<Settings>,
    pub crypto: Option<VaultCrypto>,
}

/// Resolved execution mode for one submission.
fn resolve_mode(
    request: &ExecuteRequest,
    prefs: &Preferences,
    job_control: Option<&[JobControlOption]>,
) -> Result<bool, ApiError> {
    let supports = |option: JobControlOption| {
        job_control
            .map(|options| options.contains(&option))
            .unwrap_or(true)
    };
    let sync = match request.mode {
        ExecutionMode::Sync => {
            if !supports(JobControlOption::SyncExecute) {
                return Err(ApiError(Error::unprocessable(
                    "process does not support synchronous execution",
                )));
            }
            true
        }
        ExecutionMode::Async => false,
        ExecutionMode::Auto => {
            !prefs.respond_async
                && prefs.wait.is_some()
                && supports(JobControlOption::SyncExecute)
        }
    };
    Ok(sync)
}

/// Extract forwarded credentials from the request headers.
pub fn auth_from_headers(headers: &HeaderMap) -> AuthContext {
    let mut auth = AuthContext::default();
    if let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = authorization.strip_prefix("Bearer ") {
            auth.bearer = Some(token.to_string());
        }
    }
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                auth.cookies.insert(name.to_string(), value.to_string());
            }
        }
    }
    if let Some(token) = headers.get("x-auth-docker").and_then(|v| v.to_str().ok()) {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        auth.docker_token = Some(token.to_string());
    }
    auth
}

#[allow(clippy::too_many_arguments)]
pub async fn submit(
    ctx: &SubmissionContext,
    process_id: String,
    process_version: Option<String>,
    provider_id: Option<String>,
    kind: JobKind,
    job_control: Option<Vec<JobControlOption>>,
    headers: &HeaderMap,
    mut request: ExecuteRequest,
) -> Result<Response, ApiError> {
    let prefs = parse_prefer(headers);
    let sync = resolve_mode(&request, &prefs, job_control.as_deref())?;
    let on_trigger = request.status.as_deref() == Some("create");

    // deprecated field folds into subscribers
    if let Some(email) = request.notification_email.take() {
        let subscribers = request.subscribers.get_or_insert_with(Subscribers::default);
        if subscribers.success_email.is_none() {
            subscribers.success_email = Some(email.clone());
        }
        if subscribers.failed_email.is_none() {
            subscribers.failed_email = Some(email);
        }
    }

    let subscribers_encrypted = match (&request.subscribers, &ctx.crypto) {
        (Some(subscribers), Some(crypto)) if !subscribers.is_empty() => Some(
            crypto
                .seal(
                    &serde_json::to_vec(subscribers)
                        .map_err(|e| ApiError::internal(e))?,
                )
                .map_err(ApiError::from)?
                .bytes,
        ),
        (Some(subscribers), None) if !subscribers.is_empty() => {
            tracing::warn!("subscribers submitted but no vault secret configured; dropping");
            None
        }
        _ => None,
    };

    let auth = auth_from_headers(headers);
    let auth_encrypted = match (&ctx.crypto, auth.is_empty()) {
        (Some(crypto), false) => Some(
            crypto
                .seal(&serde_json::to_vec(&auth).map_err(|e| ApiError::internal(e))?)
                .map_err(ApiError::from)?
                .bytes,
        ),
        _ => None,
    };

    let outputs_request = request
        .outputs
        .as_ref()
        .map(|outputs| serde_json::to_value(outputs))
        .transpose()
        .map_err(|e| ApiError::internal(e))?;

    let job_id = Uuid::now_v7();
    let inputs = serde_json::to_value(&request).map_err(|e| ApiError::internal(e))?;
    let job = ctx
        .db
        .create_job(CreateJob {
            id: job_id,
            process_id: process_id.clone(),
            process_version,
            provider_id,
            kind,
            status: if on_trigger {
                JobStatus::Created
            } else {
                JobStatus::Accepted
            },
            inputs,
            outputs_request,
            subscribers_encrypted,
            auth_encrypted,
            execution_mode: serde_json::to_value(request.mode)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "auto".into()),
            response_form: serde_json::to_value(request.response)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "document".into()),
            output_context: output_context(headers),
            tags: request.tags.clone(),
        })
        .await
        .map_err(ApiError::from)?;

    ctx.db
        .append_job_log(job_id, "INFO", "job submitted")
        .await
        .map_err(ApiError::from)?;
    // initial WPS-style status location, updated by the worker as the job
    // progresses
    weft_worker::status_doc::write(&ctx.settings, &job).await;

    if !on_trigger {
        ctx.queue.enqueue(job_id).await.map_err(ApiError::from)?;
    }

    if sync && !on_trigger {
        let wait = prefs
            .wait
            .unwrap_or(ctx.settings.execute_sync_max_wait)
            .min(ctx.settings.execute_sync_max_wait);
        let waited = ctx
            .queue
            .wait_terminal(&ctx.db, job_id, Duration::from_secs(wait))
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("job vanished during synchronous wait"))?;
        if waited.is_terminal() {
            return Ok(terminal_response(&ctx.settings, &waited, request.response));
        }
        // wait budget exhausted; the client falls back to polling
        return Ok(status_response(&ctx.settings, &waited, StatusCode::ACCEPTED));
    }

    Ok(status_response(&ctx.settings, &job, StatusCode::CREATED))
}

/// Status document response with Location and monitor links.
pub fn status_response(settings: &Settings, job: &JobRow, code: StatusCode) -> Response {
    let mut info = job.to_status_info(StatusProfile::Ogc);
    let base = settings.url.trim_end_matches('/');
    let job_url = format!("{}/jobs/{}", base, job.id);
    info.links = vec![
        weft_contracts::Link::new(job_url.clone(), "self").with_type("application/json"),
        weft_contracts::Link::new(job_url.clone(), "monitor")
            .with_type("application/json")
            .with_title("job status"),
    ];
    let mut response = (code, Json(info)).into_response();
    if code == StatusCode::CREATED || code == StatusCode::ACCEPTED {
        if let Ok(value) = job_url.parse() {
            response.headers_mut().insert(header::LOCATION, value);
        }
        if let Ok(value) = format!("<{}>; rel=monitor", job_url).parse() {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    response
}

/// Terminal response for the synchronous bridge: results document, raw
/// bytes, or the failure/dismissal document.
pub fn terminal_response(settings: &Settings, job: &JobRow, form: ResponseForm) -> Response {
    match job.status() {
        JobStatus::Successful => {
            let results = job.results.clone().unwrap_or(Value::Object(Default::default()));
            match form {
                ResponseForm::Document => (StatusCode::OK, Json(results)).into_response(),
                ResponseForm::Raw => raw_response(results),
            }
        }
        JobStatus::Failed => {
            let body = weft_contracts::ErrorBody {
                code: "RUNNER_FAILED".into(),
                status: 500,
                title: "Job failed".into(),
                description: job
                    .message
                    .clone()
                    .unwrap_or_else(|| "job failed".into()),
                cause: None,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
        // dismissal wins over the sync bridge
        _ => status_response(settings, job, StatusCode::OK),
    }
}

/// `response: raw` rendering. A single inline output is returned as the
/// bare body; multiple outputs use multipart/mixed; references become Link
/// headers on an empty body.
pub fn raw_response(results: Value) -> Response {
    let Some(map) = results.as_object() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let entries: Vec<(&String, &Value)> = map.iter().collect();
    match entries.len() {
        0 => StatusCode::NO_CONTENT.into_response(),
        1 => {
            let (_, entry) = entries[0];
            single_raw_part(entry)
        }
        _ => {
            let boundary = format!("weft-{}", Uuid::now_v7().simple());
            let mut body = String::new();
            for (id, entry) in entries {
                body.push_str(&format!("--{}\r\n", boundary));
                body.push_str(&format!("Content-ID: <{}>\r\n", id));
                if let Some(href) = entry.get("href").and_then(Value::as_str) {
                    let media_type = entry
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("application/octet-stream");
                    body.push_str(&format!("Content-Type: {}\r\n", media_type));
                    body.push_str(&format!("Content-Location: {}\r\n\r\n\r\n", href));
                } else {
                    let value = entry.get("value").cloned().unwrap_or(Value::Null);
                    let media_type = entry
                        .get("mediaType")
                        .and_then(Value::as_str)
                        .unwrap_or("text/plain");
                    let text = match &value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    body.push_str(&format!("Content-Type: {}\r\n\r\n{}\r\n", media_type, text));
                }
            }
            body.push_str(&format!("--{}--\r\n", boundary));
            (
                StatusCode::OK,
                [(
                    header::CONTENT_TYPE,
                    format!("multipart/mixed; boundary={}", boundary),
                )],
                body,
            )
                .into_response()
        }
    }
}

fn single_raw_part(entry: &Value) -> Response {
    if let Some(href) = entry.get("href").and_then(Value::as_str) {
        let link = format!("<{}>; rel=\"results\"", href);
        let mut response = StatusCode::NO_CONTENT.into_response();
        if let Ok(value) = link.parse() {
            response.headers_mut().insert(header::LINK, value);
        }
        return response;
    }
    let media_type = entry
        .get("mediaType")
        .and_then(Value::as_str)
        .unwrap_or("text/plain")
        .to_string();
    let value = entry.get("value").cloned().unwrap_or(Value::Null);
    let body = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (StatusCode::OK, [(header::CONTENT_TYPE, media_type)], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_resolution() {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "wait=5".parse().unwrap());
        let prefs = parse_prefer(&headers);

        let request = ExecuteRequest {
            mode: ExecutionMode::Auto,
            ..Default::default()
        };
        assert!(resolve_mode(&request, &prefs, None).unwrap());

        let async_prefs = Preferences {
            respond_async: true,
            wait: Some(5),
            minimal: false,
        };
        assert!(!resolve_mode(&request, &async_prefs, None).unwrap());

        let sync_request = ExecuteRequest {
            mode: ExecutionMode::Sync,
            ..Default::default()
        };
        let err = resolve_mode(
            &sync_request,
            &Preferences::default(),
            Some(&[JobControlOption::AsyncExecute]),
        );
        assert!(err.is_err());
    }

    #[test]
    fn auth_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        headers.insert("cookie", "session=abc; theme=dark".parse().unwrap());
        headers.insert("x-auth-docker", "Bearer pull-tok".parse().unwrap());
        let auth = auth_from_headers(&headers);
        assert_eq!(auth.bearer.as_deref(), Some("tok"));
        assert_eq!(auth.cookies.get("session").map(String::as_str), Some("abc"));
        assert_eq!(auth.docker_token.as_deref(), Some("pull-tok"));
    }

    #[test]
    fn raw_single_inline_body() {
        let response = raw_response(json!({
            "echoed": {"value": "hello", "mediaType": "text/plain"}
        }));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn raw_single_reference_uses_link_header() {
        let response = raw_response(json!({
            "data": {"href": "http://localhost/wpsoutputs/x/data/out.nc", "type": "application/x-netcdf"}
        }));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().contains_key(header::LINK));
    }

    #[test]
    fn raw_multi_output_is_multipart() {
        let response = raw_response(json!({
            "a": {"value": "1"},
            "b": {"href": "http://localhost/wpsoutputs/x/b/out.nc", "type": "application/x-netcdf"}
        }));
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("multipart/mixed; boundary="));
    }
}
