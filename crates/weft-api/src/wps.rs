// Legacy WPS 1.0 KVP endpoint mirroring the OGC API operations:
// GetCapabilities, DescribeProcess, and KVP Execute. Responses are XML by
// default and JSON with f=json (or an Accept header asking for it).

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use weft_contracts::{ExecuteRequest, ExecuteValue, JobKind};
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::model::render;
use weft_core::vault::VaultCrypto;
use weft_storage::{Database, ProcessQuery, Queue};

use crate::common::ApiError;
use crate::submission::{self, SubmissionContext};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: Queue,
    pub settings: Arc<Settings>,
    pub crypto: Option<VaultCrypto>,
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
    Router::new().route("/wps", get(kvp)).with_state(state)
}

/// KVP parameters are case-insensitive by the WPS spec; normalise on parse.
#[derive(Debug, Default, Deserialize)]
pub struct KvpParams {
    #[serde(alias = "Request", alias = "REQUEST")]
    pub request: Option<String>,
    #[serde(alias = "Identifier", alias = "IDENTIFIER")]
    pub identifier: Option<String>,
    #[serde(alias = "DataInputs", alias = "DATAINPUTS", rename = "datainputs")]
    pub data_inputs: Option<String>,
    pub f: Option<String>,
    #[serde(alias = "Service", alias = "SERVICE")]
    pub service: Option<String>,
}

fn wants_json(params: &KvpParams, headers: &HeaderMap) -> bool {
    params.f.as_deref() == Some("json")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|accept| accept.contains("application/json"))
            .unwrap_or(false)
}

/// Parse the KVP `DataInputs` form: `a=1;b=2;file=@href`.
pub fn parse_data_inputs(raw: &str) -> BTreeMap<String, ExecuteValue> {
    let mut inputs = BTreeMap::new();
    for pair in raw.split(';') {
        let Some((id, value)) = pair.split_once('=') else {
            continue;
        };
        let id = id.trim();
        let value = value.trim();
        if id.is_empty() || value.is_empty() {
            continue;
        }
        let parsed = if let Some(href) = value.strip_prefix('@') {
            ExecuteValue::Reference {
                href: href.to_string(),
                media_type: None,
                schema: None,
                encoding: None,
            }
        } else if value.contains("://") {
            ExecuteValue::Reference {
                href: value.to_string(),
                media_type: None,
                schema: None,
                encoding: None,
            }
        } else if let Ok(number) = value.parse::<i64>() {
            ExecuteValue::Literal(Value::from(number))
        } else if let Ok(number) = value.parse::<f64>() {
            ExecuteValue::Literal(Value::from(number))
        } else if let Ok(flag) = value.parse::<bool>() {
            ExecuteValue::Literal(Value::from(flag))
        } else {
            ExecuteValue::Literal(Value::String(value.to_string()))
        };
        inputs.insert(id.to_string(), parsed);
    }
    inputs
}

async fn kvp(
    State(state): State<AppState>,
    Query(params): Query<KvpParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(service) = &params.service {
        if !service.eq_ignore_ascii_case("wps") {
            return Err(ApiError::schema(format!("unknown service '{}'", service)));
        }
    }
    match params
        .request
        .as_deref()
        .map(|r| r.to_ascii_lowercase())
        .as_deref()
    {
        Some("getcapabilities") | None => capabilities(&state, &params, &headers).await,
        Some("describeprocess") => describe(&state, &params, &headers).await,
        Some("execute") => execute(&state, &params, &headers).await,
        Some(other) => Err(ApiError::schema(format!(
            "unsupported WPS request '{}'",
            other
        ))),
    }
}

async fn capabilities(
    state: &AppState,
    params: &KvpParams,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let query = ProcessQuery {
        limit: 500,
        page: 0,
        revisions: false,
        version: None,
        sort: None,
        public_only: false,
    };
    let (rows, _) = state.db.list_processes(&query).await.map_err(ApiError::from)?;
    if wants_json(params, headers) {
        let processes: Vec<Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.process_id,
                    "title": row.title,
                    "version": row.version,
                })
            })
            .collect();
        return Ok(Json(serde_json::json!({ "processes": processes })).into_response());
    }
    let summaries: Vec<(String, Option<String>, Option<String>)> = rows
        .into_iter()
        .map(|row| (row.process_id, row.title, row.description))
        .collect();
    let xml = render::wps_capabilities_xml("Weft WPS", &summaries)?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], xml).into_response())
}

async fn describe(
    state: &AppState,
    params: &KvpParams,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let identifier = params
        .identifier
        .as_deref()
        .ok_or_else(|| ApiError::schema("DescribeProcess requires identifier"))?;
    let mut models = Vec::new();
    if identifier.eq_ignore_ascii_case("all") {
        let (rows, _) = state
            .db
            .list_processes(&ProcessQuery {
                limit: 500,
                page: 0,
                revisions: false,
                version: None,
                sort: None,
                public_only: false,
            })
            .await
            .map_err(ApiError::from)?;
        for row in rows {
            models.push(row.to_model().map_err(ApiError::from)?);
        }
    } else {
        for id in identifier.split(',') {
            let row = state
                .db
                .get_process(id.trim(), None)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::not_found(format!("process '{}'", id)))?;
            models.push(row.to_model().map_err(ApiError::from)?);
        }
    }
    if wants_json(params, headers) {
        let documents: Vec<Value> = models.iter().map(render::ogc_description).collect();
        return Ok(Json(serde_json::json!({ "processes": documents })).into_response());
    }
    let refs: Vec<&weft_core::model::ProcessModel> = models.iter().collect();
    let xml = render::wps_descriptions_xml(&refs)?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], xml).into_response())
}

async fn execute(
    state: &AppState,
    params: &KvpParams,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let identifier = params
        .identifier
        .as_deref()
        .ok_or_else(|| ApiError::schema("Execute requires identifier"))?;
    let row = state
        .db
        .get_process(identifier, None)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("process '{}'", identifier)))?;
    let model = row.to_model().map_err(ApiError::from)?;

    let request = ExecuteRequest {
        inputs: params
            .data_inputs
            .as_deref()
            .map(parse_data_inputs)
            .unwrap_or_default(),
        ..Default::default()
    };

    // the KVP path is always asynchronous; clients poll the status location
    let response = submission::submit(
        &state.submission(),
        model.id.clone(),
        None,
        None,
        JobKind::Process,
        Some(model.job_control_options.clone()),
        headers,
        request,
    )
    .await?;

    if wants_json(params, headers) {
        return Ok(response);
    }
    // rewrap the status document as a WPS accepted response
    let status = response.status();
    if !status.is_success() {
        return Ok(response);
    }
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1" service="WPS" version="1.0.0" statusLocation="{}"><wps:Process><ows:Identifier>{}</ows:Identifier></wps:Process><wps:Status><wps:ProcessAccepted>queued</wps:ProcessAccepted></wps:Status></wps:ExecuteResponse>"#,
        location.replace('&', "&amp;"),
        model.id
    );
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        xml,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_inputs_parsing() {
        let inputs = parse_data_inputs("message=hello;level=2;ratio=0.5;flag=true;data=@https://example.test/a.nc");
        assert_eq!(
            inputs["message"],
            ExecuteValue::Literal(Value::String("hello".into()))
        );
        assert_eq!(inputs["level"], ExecuteValue::Literal(Value::from(2)));
        assert_eq!(inputs["ratio"], ExecuteValue::Literal(Value::from(0.5)));
        assert_eq!(inputs["flag"], ExecuteValue::Literal(Value::from(true)));
        assert_eq!(
            inputs["data"].href(),
            Some("https://example.test/a.nc")
        );
    }

    #[test]
    fn bare_urls_become_references() {
        let inputs = parse_data_inputs("data=https://example.test/b.nc");
        assert_eq!(inputs["data"].href(), Some("https://example.test/b.nc"));
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let inputs = parse_data_inputs("novalue;=nokey;ok=1");
        assert_eq!(inputs.len(), 1);
        assert!(inputs.contains_key("ok"));
    }
}
