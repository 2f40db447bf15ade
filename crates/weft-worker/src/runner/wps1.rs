// WPS 1.0 runner: Execute request as XML, asynchronous status polling over
// the statusLocation document with capped exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weft_core::builtin::Artifact;
use weft_core::error::{Error, Result};
use weft_core::model::wps_io::{
    parse_execute_response, WpsExecuteStatus, WpsOutputData,
};
use weft_core::package::StepRequirement;

use super::{StepContext, StepOutputs, StepRunner};

const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_CEILING: Duration = Duration::from_secs(30);

pub struct Wps1Runner {
    client: reqwest::Client,
}

impl Wps1Runner {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(ctx: &StepContext) -> Result<(String, String)> {
        match &ctx.requirement {
            StepRequirement::Wps1 { provider, process } => {
                Ok((provider.clone(), process.clone()))
            }
            other => Err(Error::step(
                &ctx.step_id,
                format!("WPS runner received {:?}", other),
            )),
        }
    }

    /// Execute request document. Inputs travel as literal data or
    /// references; staged URLs stay references.
    pub fn execute_request(process: &str, inputs: &std::collections::BTreeMap<String, Value>) -> String {
        let mut body = String::new();
        body.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        body.push_str(&format!(
            r#"<wps:Execute service="WPS" version="1.0.0" xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1" xmlns:xlink="http://www.w3.org/1999/xlink"><ows:Identifier>{}</ows:Identifier><wps:DataInputs>"#,
            xml_escape(process)
        ));
        for (id, value) in inputs {
            let values: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            for value in values {
                body.push_str("<wps:Input>");
                body.push_str(&format!("<ows:Identifier>{}</ows:Identifier>", xml_escape(id)));
                match value {
                    Value::String(s) if s.contains("://") => {
                        body.push_str(&format!(
                            r#"<wps:Reference xlink:href="{}"/>"#,
                            xml_escape(s)
                        ));
                    }
                    other => {
                        let text = match other {
                            Value::String(s) => s.clone(),
                            v => v.to_string(),
                        };
                        body.push_str(&format!(
                            "<wps:Data><wps:LiteralData>{}</wps:LiteralData></wps:Data>",
                            xml_escape(&text)
                        ));
                    }
                }
                body.push_str("</wps:Input>");
            }
        }
        body.push_str(r#"</wps:DataInputs><wps:ResponseForm><wps:ResponseDocument storeExecuteResponse="true" status="true"/></wps:ResponseForm></wps:Execute>"#);
        body
    }

    fn outputs_from(outputs: Vec<(String, WpsOutputData)>) -> StepOutputs {
        let mut collected = StepOutputs::new();
        for (id, data) in outputs {
            let artifact = match data {
                WpsOutputData::Reference { href, media_type } => Artifact::File {
                    path: std::path::PathBuf::from(href),
                    media_type: media_type.unwrap_or_else(|| "application/octet-stream".into()),
                },
                WpsOutputData::Literal(text) => Artifact::Literal(Value::String(text)),
            };
            collected.entry(id).or_insert_with(Vec::new).push(artifact);
        }
        collected
    }
}

#[async_trait]
impl StepRunner for Wps1Runner {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs> {
        let (provider, process) = Self::endpoint(ctx)?;
        let request_body = Self::execute_request(&process, &ctx.inputs);

        let response = ctx
            .auth
            .apply(
                self.client
                    .post(&provider)
                    .header(reqwest::header::CONTENT_TYPE, "text/xml")
                    .timeout(ctx.timeout),
            )
            .body(request_body)
            .send()
            .await
            .map_err(|e| Error::step(&ctx.step_id, format!("WPS submit: {}", e)))?;

        let status = response.status();
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            // recoverable; step retry policy decides
            return Err(Error::step(
                &ctx.step_id,
                format!("WPS submit returned {}", status),
            ));
        }
        if !status.is_success() {
            return Err(Error::StepFailed {
                step: ctx.step_id.clone(),
                detail: format!("WPS submit rejected with {}", status),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::step(&ctx.step_id, format!("WPS submit body: {}", e)))?;
        let mut parsed = parse_execute_response(&body)
            .map_err(|e| Error::step(&ctx.step_id, format!("WPS response parse: {}", e)))?;

        let deadline = tokio::time::Instant::now() + ctx.timeout;
        let mut interval = POLL_INITIAL;
        loop {
            match parsed.status {
                WpsExecuteStatus::Succeeded => {
                    tracing::info!(step = %ctx.step_id, "WPS step succeeded");
                    return Ok(Self::outputs_from(parsed.outputs));
                }
                WpsExecuteStatus::Failed { text } => {
                    return Err(Error::StepFailed {
                        step: ctx.step_id.clone(),
                        detail: format!("remote WPS failure: {}", text),
                    });
                }
                WpsExecuteStatus::Accepted | WpsExecuteStatus::Started { .. } => {
                    let Some(location) = parsed.status_location.clone() else {
                        return Err(Error::StepFailed {
                            step: ctx.step_id.clone(),
                            detail: "WPS accepted without statusLocation".into(),
                        });
                    };
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::RunnerTimeout(ctx.timeout.as_secs()));
                    }
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(POLL_CEILING);

                    let poll = ctx
                        .auth
                        .apply(self.client.get(&location).timeout(Duration::from_secs(30)))
                        .send()
                        .await
                        .map_err(|e| Error::step(&ctx.step_id, format!("WPS poll: {}", e)))?;
                    let body = poll
                        .text()
                        .await
                        .map_err(|e| Error::step(&ctx.step_id, format!("WPS poll body: {}", e)))?;
                    // recoverable parse failures feed the retry whitelist
                    parsed = parse_execute_response(&body).map_err(|e| {
                        Error::step(&ctx.step_id, format!("WPS status parse: {}", e))
                    })?;
                    if parsed.status_location.is_none() {
                        parsed.status_location = Some(location);
                    }
                }
            }
        }
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn execute_request_mixes_literals_and_references() {
        let mut inputs = BTreeMap::new();
        inputs.insert("level".to_string(), Value::from(2));
        inputs.insert(
            "dataset".to_string(),
            Value::String("https://example.test/a.nc".into()),
        );
        let body = Wps1Runner::execute_request("subset", &inputs);
        assert!(body.contains("<ows:Identifier>subset</ows:Identifier>"));
        assert!(body.contains("<wps:LiteralData>2</wps:LiteralData>"));
        assert!(body.contains(r#"xlink:href="https://example.test/a.nc""#));
        assert!(body.contains("storeExecuteResponse=\"true\""));
    }

    #[test]
    fn execute_request_expands_arrays() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "files".to_string(),
            serde_json::json!(["https://example.test/a.nc", "https://example.test/b.nc"]),
        );
        let body = Wps1Runner::execute_request("merge", &inputs);
        assert_eq!(body.matches("<wps:Input>").count(), 2);
    }

    #[test]
    fn xml_escaping() {
        assert_eq!(xml_escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
