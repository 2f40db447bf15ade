// Local CWL engine adapter. The engine is an external executable driven
// over files: the package document and a job-order JSON go into the work
// directory, the engine writes collected outputs as JSON on stdout, stderr
// is captured to a log file whose tail travels in classified failures.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use weft_core::builtin::Artifact;
use weft_core::config::Settings;
use weft_core::error::{Error, Result};

use super::{StepContext, StepOutputs, StepRunner};

const STDERR_TAIL_BYTES: usize = 2048;

pub struct LocalCwlRunner {
    settings: Arc<Settings>,
    gpu: bool,
}

impl LocalCwlRunner {
    pub fn new(settings: Arc<Settings>, gpu: bool) -> Self {
        Self { settings, gpu }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    /// Job-order document: literals pass through, staged files become CWL
    /// File/Directory objects.
    fn job_order(ctx: &StepContext) -> Value {
        let mut order = Map::new();
        for (id, value) in &ctx.inputs {
            order.insert(id.clone(), cwl_input_value(value));
        }
        Value::Object(order)
    }

    fn parse_outputs(stdout: &str) -> Result<StepOutputs> {
        let parsed: Value = serde_json::from_str(stdout).map_err(|e| Error::RunnerFailed {
            detail: format!("engine produced unparseable output listing: {}", e),
            stderr_tail: String::new(),
        })?;
        let mut outputs = StepOutputs::new();
        let Some(object) = parsed.as_object() else {
            return Ok(outputs);
        };
        for (id, entry) in object {
            let mut artifacts = Vec::new();
            collect_artifacts(entry, &mut artifacts);
            outputs.insert(id.clone(), artifacts);
        }
        Ok(outputs)
    }
}

fn cwl_input_value(value: &Value) -> Value {
    match value {
        Value::String(s) if looks_like_path(s) => serde_json::json!({
            "class": if s.ends_with('/') { "Directory" } else { "File" },
            "path": s.trim_end_matches('/'),
        }),
        Value::Array(items) => Value::Array(items.iter().map(cwl_input_value).collect()),
        other => other.clone(),
    }
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with('/') && !s.contains("://")
}

fn collect_artifacts(entry: &Value, artifacts: &mut Vec<Artifact>) {
    match entry {
        Value::Object(obj) if obj.get("class").is_some() => {
            if let Some(path) = obj.get("path").and_then(Value::as_str) {
                let media_type = obj
                    .get("format")
                    .and_then(Value::as_str)
                    .and_then(weft_core::model::formats::resolve_format_reference)
                    .or_else(|| mime_guess::from_path(path).first_raw().map(String::from))
                    .unwrap_or_else(|| "application/octet-stream".into());
                artifacts.push(Artifact::File {
                    path: path.into(),
                    media_type,
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_artifacts(item, artifacts);
            }
        }
        Value::Null => {}
        literal => artifacts.push(Artifact::Literal(literal.clone())),
    }
}

#[async_trait]
impl StepRunner for LocalCwlRunner {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs> {
        tokio::fs::create_dir_all(&ctx.work_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create workdir: {}", e)))?;
        let package_path = ctx.work_dir.join("package.cwl.json");
        let order_path = ctx.work_dir.join("job_order.json");
        let package = serde_json::to_vec_pretty(&ctx.document)
            .map_err(|e| Error::Internal(anyhow::anyhow!("serialize package: {}", e)))?;
        tokio::fs::write(&package_path, package)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write package: {}", e)))?;
        let order = serde_json::to_vec_pretty(&Self::job_order(ctx))
            .map_err(|e| Error::Internal(anyhow::anyhow!("serialize job order: {}", e)))?;
        tokio::fs::write(&order_path, order)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write job order: {}", e)))?;

        let out_dir = ctx.work_dir.join("out");
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create outdir: {}", e)))?;

        let mut command = Command::new(&self.settings.cwl_engine);
        command
            .arg("--outdir")
            .arg(&out_dir)
            .arg("--quiet")
            // originals are staged, never mutated in place
            .arg("--no-read-only=false");
        if self.gpu {
            command.arg("--enable-ext");
        }
        if let Some(euid) = self.settings.cwl_euid {
            command.arg(format!("--user-space-docker-cmd-uid={}", euid));
        }
        if let Some(egid) = self.settings.cwl_egid {
            command.arg(format!("--user-space-docker-cmd-gid={}", egid));
        }
        if let Some(token) = &ctx.auth.docker_token {
            command.env("CWL_DOCKER_AUTH_TOKEN", token);
        }
        command
            .arg(&package_path)
            .arg(&order_path)
            .current_dir(&ctx.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(step = %ctx.step_id, engine = %self.settings.cwl_engine, "starting CWL engine");
        let child = command.spawn().map_err(|e| Error::RunnerFailed {
            detail: format!("failed to start CWL engine '{}': {}", self.settings.cwl_engine, e),
            stderr_tail: String::new(),
        })?;

        let output = match tokio::time::timeout(ctx.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| Error::RunnerFailed {
                detail: format!("engine wait failed: {}", e),
                stderr_tail: String::new(),
            })?,
            Err(_) => {
                return Err(Error::RunnerTimeout(ctx.timeout.as_secs()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // combined stdout/stderr kept next to the outputs
        let log_path = ctx.work_dir.join("engine.log");
        let mut log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create engine log: {}", e)))?;
        log.write_all(stdout.as_bytes())
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write engine log: {}", e)))?;
        log.write_all(stderr.as_bytes())
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write engine log: {}", e)))?;

        if !output.status.success() {
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            return Err(Error::RunnerFailed {
                detail: format!(
                    "engine exited with {} for step {}",
                    output.status, ctx.step_id
                ),
                stderr_tail: stderr[tail_start..].to_string(),
            });
        }

        Self::parse_outputs(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_order_wraps_paths_in_file_objects() {
        let value = cwl_input_value(&Value::String("/work/in/data.nc".into()));
        assert_eq!(value["class"], "File");
        assert_eq!(value["path"], "/work/in/data.nc");

        let dir = cwl_input_value(&Value::String("/work/in/tiles/".into()));
        assert_eq!(dir["class"], "Directory");
        assert_eq!(dir["path"], "/work/in/tiles");

        let literal = cwl_input_value(&Value::String("hello".into()));
        assert_eq!(literal, Value::String("hello".into()));

        let url = cwl_input_value(&Value::String("https://example.test/x".into()));
        assert_eq!(url, Value::String("https://example.test/x".into()));
    }

    #[test]
    fn artifact_collection_handles_files_arrays_and_literals() {
        let mut artifacts = Vec::new();
        collect_artifacts(
            &serde_json::json!([
                {"class": "File", "path": "/out/a.nc", "format": "http://edamontology.org/format_3650"},
                {"class": "File", "path": "/out/b.txt"}
            ]),
            &mut artifacts,
        );
        assert_eq!(artifacts.len(), 2);
        assert_eq!(
            artifacts[0],
            Artifact::File {
                path: "/out/a.nc".into(),
                media_type: "application/x-netcdf".into()
            }
        );
        assert_eq!(
            artifacts[1],
            Artifact::File {
                path: "/out/b.txt".into(),
                media_type: "text/plain".into()
            }
        );

        let mut literals = Vec::new();
        collect_artifacts(&serde_json::json!("echoed text"), &mut literals);
        assert_eq!(literals, vec![Artifact::Literal(serde_json::json!("echoed text"))]);
    }
}
