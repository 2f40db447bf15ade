// OGC API - Processes runner: JSON submission with the /execution ->
// /jobs endpoint fallback, JSON status polling, results collection.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use weft_core::builtin::Artifact;
use weft_core::error::{Error, Result};
use weft_core::package::StepRequirement;

use super::{StepContext, StepOutputs, StepRunner};

const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_CEILING: Duration = Duration::from_secs(30);

pub struct OgcApiRunner {
    client: reqwest::Client,
}

impl OgcApiRunner {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn process_url(ctx: &StepContext) -> Result<String> {
        match &ctx.requirement {
            StepRequirement::OgcApi { process_url } => Ok(process_url.trim_end_matches('/').into()),
            other => Err(Error::step(
                &ctx.step_id,
                format!("OGC API runner received {:?}", other),
            )),
        }
    }

    /// Execution body: references become href objects, everything else is
    /// passed inline.
    pub fn execution_body(inputs: &BTreeMap<String, Value>) -> Value {
        let mut body = Map::new();
        for (id, value) in inputs {
            body.insert(id.clone(), execution_input(value));
        }
        json!({ "inputs": body, "response": "document" })
    }

    async fn submit(&self, ctx: &StepContext, process_url: &str) -> Result<(String, Value)> {
        let body = Self::execution_body(&ctx.inputs);
        // newer servers expose /execution, older ones only /jobs
        for (i, endpoint) in ["execution", "jobs"].iter().enumerate() {
            let url = format!("{}/{}", process_url, endpoint);
            let response = ctx
                .auth
                .apply(
                    self.client
                        .post(&url)
                        .json(&body)
                        .header("Prefer", "respond-async")
                        .timeout(ctx.timeout),
                )
                .send()
                .await
                .map_err(|e| Error::step(&ctx.step_id, format!("submit to {}: {}", url, e)))?;
            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND && i == 0 {
                continue;
            }
            if status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                return Err(Error::step(
                    &ctx.step_id,
                    format!("submit to {} returned {}", url, status),
                ));
            }
            if !status.is_success() {
                return Err(Error::StepFailed {
                    step: ctx.step_id.clone(),
                    detail: format!("submit to {} rejected with {}", url, status),
                });
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|l| absolutise(process_url, l));
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let location = location
                .or_else(|| {
                    body.get("jobID")
                        .and_then(Value::as_str)
                        .map(|id| format!("{}/jobs/{}", server_root(process_url), id))
                })
                .ok_or_else(|| {
                    Error::step(&ctx.step_id, "submission response carries no job location")
                })?;
            return Ok((location, body));
        }
        Err(Error::step(
            &ctx.step_id,
            "no execution endpoint accepted the submission",
        ))
    }

    async fn collect_results(&self, ctx: &StepContext, job_url: &str) -> Result<StepOutputs> {
        let url = format!("{}/results", job_url.trim_end_matches('/'));
        let response = ctx
            .auth
            .apply(self.client.get(&url).timeout(Duration::from_secs(30)))
            .send()
            .await
            .map_err(|e| Error::step(&ctx.step_id, format!("results fetch: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::StepFailed {
                step: ctx.step_id.clone(),
                detail: format!("results fetch returned {}", response.status()),
            });
        }
        let document: Value = response
            .json()
            .await
            .map_err(|e| Error::step(&ctx.step_id, format!("results parse: {}", e)))?;
        let mut outputs = StepOutputs::new();
        if let Some(map) = document.as_object() {
            for (id, entry) in map {
                let mut artifacts = Vec::new();
                collect_result(entry, &mut artifacts);
                outputs.insert(id.clone(), artifacts);
            }
        }
        Ok(outputs)
    }
}

fn execution_input(value: &Value) -> Value {
    match value {
        Value::String(s) if s.contains("://") => json!({ "href": s }),
        Value::Array(items) => Value::Array(items.iter().map(execution_input).collect()),
        other => other.clone(),
    }
}

fn collect_result(entry: &Value, artifacts: &mut Vec<Artifact>) {
    match entry {
        Value::Object(obj) if obj.get("href").is_some() => {
            let href = obj["href"].as_str().unwrap_or_default();
            artifacts.push(Artifact::File {
                path: href.into(),
                media_type: obj
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream")
                    .to_string(),
            });
        }
        Value::Object(obj) if obj.get("value").is_some() => {
            artifacts.push(Artifact::Literal(obj["value"].clone()));
        }
        Value::Array(items) => {
            for item in items {
                collect_result(item, artifacts);
            }
        }
        other => artifacts.push(Artifact::Literal(other.clone())),
    }
}

fn server_root(process_url: &str) -> String {
    // …/processes/{id} -> service root
    match process_url.rfind("/processes/") {
        Some(idx) => process_url[..idx].to_string(),
        None => process_url.to_string(),
    }
}

fn absolutise(process_url: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    if let Ok(base) = url::Url::parse(process_url) {
        if let Ok(joined) = base.join(location) {
            return joined.to_string();
        }
    }
    location.to_string()
}

#[async_trait]
impl StepRunner for OgcApiRunner {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs> {
        let process_url = Self::process_url(ctx)?;
        let (job_url, initial) = self.submit(ctx, &process_url).await?;
        tracing::info!(step = %ctx.step_id, job_url = %job_url, "remote OGC API job submitted");

        let deadline = tokio::time::Instant::now() + ctx.timeout;
        let mut interval = POLL_INITIAL;
        let mut status_doc = initial;
        loop {
            let status = status_doc
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("accepted");
            match status {
                "successful" | "succeeded" => {
                    tracing::info!(step = %ctx.step_id, "remote OGC API job succeeded");
                    return self.collect_results(ctx, &job_url).await;
                }
                "failed" => {
                    let message = status_doc
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("remote job failed");
                    return Err(Error::StepFailed {
                        step: ctx.step_id.clone(),
                        detail: message.to_string(),
                    });
                }
                "dismissed" => {
                    return Err(Error::StepFailed {
                        step: ctx.step_id.clone(),
                        detail: "remote job was dismissed".into(),
                    });
                }
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::RunnerTimeout(ctx.timeout.as_secs()));
                    }
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(POLL_CEILING);
                    let response = ctx
                        .auth
                        .apply(self.client.get(&job_url).timeout(Duration::from_secs(30)))
                        .send()
                        .await
                        .map_err(|e| Error::step(&ctx.step_id, format!("status poll: {}", e)))?;
                    if response.status().is_server_error() {
                        return Err(Error::step(
                            &ctx.step_id,
                            format!("status poll returned {}", response.status()),
                        ));
                    }
                    status_doc = response
                        .json()
                        .await
                        .map_err(|e| Error::step(&ctx.step_id, format!("status parse: {}", e)))?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn execution_body_wraps_urls() {
        let mut inputs = BTreeMap::new();
        inputs.insert("message".to_string(), Value::String("hello".into()));
        inputs.insert(
            "data".to_string(),
            Value::String("https://example.test/a.nc".into()),
        );
        let body = OgcApiRunner::execution_body(&inputs);
        assert_eq!(body["inputs"]["message"], "hello");
        assert_eq!(body["inputs"]["data"]["href"], "https://example.test/a.nc");
    }

    #[test]
    fn result_collection() {
        let mut artifacts = Vec::new();
        collect_result(
            &json!({"href": "https://example.test/out.nc", "type": "application/x-netcdf"}),
            &mut artifacts,
        );
        collect_result(&json!({"value": 42}), &mut artifacts);
        collect_result(&json!("inline"), &mut artifacts);
        assert_eq!(artifacts.len(), 3);
        assert!(matches!(artifacts[0], Artifact::File { .. }));
        assert_eq!(artifacts[1], Artifact::Literal(json!(42)));
        assert_eq!(artifacts[2], Artifact::Literal(json!("inline")));
    }

    #[test]
    fn server_root_extraction() {
        assert_eq!(
            server_root("https://ades.example.test/api/processes/subset"),
            "https://ades.example.test/api"
        );
    }

    fn test_ctx(process_url: String) -> StepContext {
        use std::sync::Arc;
        use weft_core::config::{Configuration, RequestOptions, Settings};
        let settings = Arc::new(Settings {
            configuration: Configuration::Default,
            url: "http://localhost:9000".into(),
            wps_output_dir: std::env::temp_dir(),
            wps_output_url: "http://localhost:9000/wpsoutputs".into(),
            wps_output_s3_bucket: None,
            wps_output_s3_region: None,
            wps_output_context: None,
            wps_workdir: std::env::temp_dir(),
            cwl_euid: None,
            cwl_egid: None,
            execute_sync_max_wait: 20,
            wps_max_request_size: 30 * 1024 * 1024,
            wps_max_single_input_size: 3 * 1024 * 1024 * 1024,
            request_options: RequestOptions::empty(),
            cwl_processes_dir: None,
            cwl_processes_register_error: false,
            cwl_prov: true,
            schema_url: String::new(),
            wps_email_notify_timeout: 10,
            vault_dir: std::env::temp_dir(),
            vault_secret: None,
            file_allowlist: vec![],
            cwl_engine: "cwltool".into(),
        });
        StepContext {
            step_id: "remote".into(),
            requirement: StepRequirement::OgcApi { process_url },
            document: Value::Null,
            inputs: BTreeMap::new(),
            output_globs: BTreeMap::new(),
            work_dir: std::env::temp_dir(),
            auth: weft_core::auth::AuthContext::default(),
            settings: settings.clone(),
            fetcher: Arc::new(weft_core::fetch::Fetcher::new(settings)),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn falls_back_to_jobs_endpoint_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/processes/subset/execution"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/processes/subset/jobs"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", "/jobs/abc")
                    .set_body_json(json!({"status": "accepted", "jobID": "abc"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "successful"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/abc/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": {"href": "https://example.test/out.nc", "type": "application/x-netcdf"}
            })))
            .mount(&server)
            .await;

        let runner = OgcApiRunner::new(reqwest::Client::new());
        let ctx = test_ctx(format!("{}/processes/subset", server.uri()));
        let outputs = runner.execute(&ctx).await.unwrap();
        assert_eq!(outputs["output"].len(), 1);
    }
}
