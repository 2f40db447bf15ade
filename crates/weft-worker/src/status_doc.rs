// WPS-style status document written into the job root (status.xml) so the
// persisted layout stays consumable by legacy WPS clients polling a status
// location.

use weft_contracts::JobStatus;
use weft_core::config::Settings;
use weft_storage::JobRow;

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the ExecuteResponse-shaped status document for a job.
pub fn render(settings: &Settings, job: &JobRow) -> String {
    let status_location = format!(
        "{}/status.xml",
        settings.job_output_url(job.output_context.as_deref(), job.id)
    );
    let mut body = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    body.push_str(&format!(
        r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1" service="WPS" version="1.0.0" statusLocation="{}">"#,
        escape(&status_location)
    ));
    body.push_str(&format!(
        "<wps:Process><ows:Identifier>{}</ows:Identifier></wps:Process>",
        escape(&job.process_id)
    ));
    body.push_str("<wps:Status>");
    match job.status() {
        JobStatus::Successful => {
            body.push_str("<wps:ProcessSucceeded>job completed</wps:ProcessSucceeded>")
        }
        JobStatus::Failed => {
            let message = job.message.as_deref().unwrap_or("job failed");
            body.push_str(&format!(
                "<wps:ProcessFailed><ows:ExceptionReport><ows:Exception><ows:ExceptionText>{}</ows:ExceptionText></ows:Exception></ows:ExceptionReport></wps:ProcessFailed>",
                escape(message)
            ));
        }
        JobStatus::Running | JobStatus::Started => body.push_str(&format!(
            r#"<wps:ProcessStarted percentCompleted="{}">running</wps:ProcessStarted>"#,
            job.progress.clamp(0, 100)
        )),
        _ => body.push_str("<wps:ProcessAccepted>queued</wps:ProcessAccepted>"),
    }
    body.push_str("</wps:Status>");
    if let Some(results) = job.results.as_ref().and_then(|r| r.as_object()) {
        body.push_str("<wps:ProcessOutputs>");
        for (id, entry) in results {
            body.push_str("<wps:Output>");
            body.push_str(&format!("<ows:Identifier>{}</ows:Identifier>", escape(id)));
            if let Some(href) = entry.get("href").and_then(|h| h.as_str()) {
                let media_type = entry
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("application/octet-stream");
                body.push_str(&format!(
                    r#"<wps:Reference xlink:href="{}" xmlns:xlink="http://www.w3.org/1999/xlink" mimeType="{}"/>"#,
                    escape(href),
                    escape(media_type)
                ));
            } else if let Some(value) = entry.get("value") {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                body.push_str(&format!(
                    "<wps:Data><wps:LiteralData>{}</wps:LiteralData></wps:Data>",
                    escape(&text)
                ));
            }
            body.push_str("</wps:Output>");
        }
        body.push_str("</wps:ProcessOutputs>");
    }
    body.push_str("</wps:ExecuteResponse>");
    body
}

/// Write status.xml into the job root. Failures are logged, never fatal.
pub async fn write(settings: &Settings, job: &JobRow) {
    let dir = settings.job_output_dir(job.output_context.as_deref(), job.id);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        tracing::warn!(job_id = %job.id, error = %e, "cannot create job root for status.xml");
        return;
    }
    let path = dir.join("status.xml");
    if let Err(e) = tokio::fs::write(&path, render(settings, job)).await {
        tracing::warn!(job_id = %job.id, error = %e, "failed to write status.xml");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;
    use weft_core::config::{Configuration, RequestOptions};

    fn job(status: &str, results: Option<serde_json::Value>) -> JobRow {
        JobRow {
            id: Uuid::nil(),
            process_id: "echo".into(),
            process_version: None,
            provider_id: None,
            kind: "process".into(),
            status: status.into(),
            progress: 42,
            message: Some("boom".into()),
            inputs: json!({}),
            outputs_request: None,
            results,
            exceptions: json!([]),
            logs: json!([]),
            statistics: None,
            subscribers_encrypted: None,
            auth_encrypted: None,
            execution_mode: "auto".into(),
            response_form: "document".into(),
            output_context: None,
            tags: vec![],
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }

    fn settings() -> Settings {
        Settings {
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
            wps_max_request_size: 1,
            wps_max_single_input_size: 1,
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
        }
    }

    #[test]
    fn success_document_lists_outputs() {
        let job = job(
            "successful",
            Some(json!({
                "data": {"href": "http://localhost:9000/wpsoutputs/x/data/out.nc", "type": "application/x-netcdf"},
                "echoed": {"value": "hello"}
            })),
        );
        let xml = render(&settings(), &job);
        assert!(xml.contains("ProcessSucceeded"));
        assert!(xml.contains("out.nc"));
        assert!(xml.contains("<wps:LiteralData>hello</wps:LiteralData>"));
        // parseable by the same machinery the WPS runner uses
        let parsed = weft_core::model::wps_io::parse_execute_response(&xml).unwrap();
        assert_eq!(parsed.outputs.len(), 2);
    }

    #[test]
    fn failure_document_carries_exception_text() {
        let xml = render(&settings(), &job("failed", None));
        assert!(xml.contains("ProcessFailed"));
        assert!(xml.contains("boom"));
    }

    #[test]
    fn running_document_reports_progress() {
        let xml = render(&settings(), &job("running", None));
        assert!(xml.contains(r#"percentCompleted="42""#));
    }
}
