// Step dispatcher: orders workflow steps by their CWL data dependencies,
// picks a runner per step requirement, forwards staged inputs, and lays
// collected outputs out under {step_id}/{output_id}/{filename} so later
// steps and the final collection locate them unambiguously.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weft_core::auth::AuthContext;
use weft_core::builtin::Artifact;
use weft_core::config::Settings;
use weft_core::error::{Error, Result};
use weft_core::fetch::{FetchOptions, Fetcher};
use weft_core::package::{Package, WorkflowStep};

use crate::runner::{
    run_step_with_retries, RunnerKind, RunnerRegistry, StepContext, StepOutputs,
};

/// Hooks back into the job record: logging, cancellation checkpoints,
/// progress accounting.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn log(&self, level: &str, message: &str);
    async fn is_cancelled(&self) -> bool;
    async fn progress(&self, percent: u8);
    /// Step lifetime notification for provenance and statistics.
    async fn step_finished(&self, step_id: &str, duration: Duration);
}

/// Source reference of a step input or workflow output.
fn split_source(source: &str) -> (Option<&str>, &str) {
    let source = source.trim_start_matches('#');
    match source.split_once('/') {
        Some((step, output)) => (Some(step), output),
        None => (None, source),
    }
}

/// Step input connections: input id -> list of sources.
fn step_connections(step: &Value) -> Vec<(String, Vec<String>)> {
    let mut connections = Vec::new();
    let Some(section) = step.get("in") else {
        return connections;
    };
    let mut push = |id: &str, entry: &Value| {
        let sources = match entry {
            Value::String(s) => vec![s.clone()],
            Value::Object(obj) => match obj.get("source") {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(list)) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        connections.push((id.to_string(), sources));
    };
    match section {
        Value::Object(map) => {
            for (id, entry) in map {
                push(id, entry);
            }
        }
        Value::Array(list) => {
            for entry in list {
                if let Some(id) = entry.get("id").and_then(Value::as_str) {
                    push(id.rsplit('/').next().unwrap_or(id), entry);
                }
            }
        }
        _ => {}
    }
    connections
}

/// Order steps by data dependencies (Kahn). Fails on cycles.
pub fn plan_steps(package: &Package) -> Result<Vec<WorkflowStep>> {
    let steps = package.steps()?;
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let bodies: HashMap<&str, &Value> = match package.document.get("steps") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(id, body)| (id.rsplit('/').next().unwrap_or(id), body))
            .collect(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|body| {
                body.get("id")
                    .and_then(Value::as_str)
                    .map(|id| (id.rsplit('/').next().unwrap_or(id), body))
            })
            .collect(),
        _ => HashMap::new(),
    };

    let mut dependencies: HashMap<&str, HashSet<&str>> = HashMap::new();
    for step in &steps {
        let body = bodies.get(step.id.as_str()).copied().unwrap_or(&Value::Null);
        let mut deps = HashSet::new();
        for (_, sources) in step_connections(body) {
            for source in sources {
                if let (Some(dep), _) = split_source(&source) {
                    if ids.contains(dep) && dep != step.id {
                        if let Some(dep) = ids.get(dep) {
                            deps.insert(*dep);
                        }
                    }
                }
            }
        }
        dependencies.insert(step.id.as_str(), deps);
    }

    let mut ordered = Vec::with_capacity(steps.len());
    let mut placed: HashSet<String> = HashSet::new();
    let mut remaining: Vec<&WorkflowStep> = steps.iter().collect();
    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, step)| {
                dependencies[step.id.as_str()]
                    .iter()
                    .all(|dep| placed.contains(*dep))
            })
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return Err(Error::schema("workflow steps form a dependency cycle"));
        }
        // take in reverse index order to keep removal indices valid
        for index in ready.into_iter().rev() {
            let step = remaining.remove(index);
            placed.insert(step.id.clone());
            ordered.push(step.clone());
        }
    }
    Ok(ordered)
}

/// Resolve one step's inputs from workflow inputs and upstream outputs.
fn resolve_step_inputs(
    body: &Value,
    workflow_inputs: &BTreeMap<String, Value>,
    step_results: &HashMap<String, StepOutputs>,
) -> Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for (id, sources) in step_connections(body) {
        let mut values = Vec::new();
        for source in &sources {
            match split_source(source) {
                (Some(step), output) if step_results.contains_key(step) => {
                    let outputs = &step_results[step];
                    let artifacts = outputs.get(output).ok_or_else(|| {
                        Error::schema(format!(
                            "step input '{}' references unknown output '{}/{}'",
                            id, step, output
                        ))
                    })?;
                    values.extend(artifacts.iter().map(artifact_value));
                }
                _ => {
                    if let Some(value) = workflow_inputs.get(source.trim_start_matches('#')) {
                        values.push(value.clone());
                    }
                    // omitted optional workflow inputs stay omitted
                }
            }
        }
        match values.len() {
            0 => {}
            1 => {
                inputs.insert(id, values.into_iter().next().expect("len checked"));
            }
            _ => {
                inputs.insert(id, Value::Array(values));
            }
        }
    }
    Ok(inputs)
}

fn artifact_value(artifact: &Artifact) -> Value {
    match artifact {
        Artifact::Literal(value) => value.clone(),
        Artifact::File { path, .. } => Value::String(path.display().to_string()),
    }
}

/// Materialise a step's collected outputs under
/// `{work_dir}/{step_id}/{output_id}/{filename}`. Remote references are
/// downloaded; local files are copied into place.
pub async fn relocate_outputs(
    step_id: &str,
    outputs: StepOutputs,
    work_dir: &Path,
    fetcher: &Fetcher,
    auth: &AuthContext,
) -> Result<StepOutputs> {
    let mut relocated = StepOutputs::new();
    for (output_id, artifacts) in outputs {
        let dest_dir = work_dir.join(step_id).join(&output_id);
        let mut moved = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            match artifact {
                Artifact::Literal(value) => moved.push(Artifact::Literal(value)),
                Artifact::File { path, media_type } => {
                    let raw = path.to_string_lossy().to_string();
                    if raw.contains("://") {
                        let options = FetchOptions {
                            auth: auth.clone(),
                            expect_media_type: None,
                            no_cache: false,
                        };
                        let fetched = fetcher.fetch(&raw, &dest_dir, &options).await?;
                        moved.push(Artifact::File {
                            path: fetched.local_path,
                            media_type: fetched.media_type.unwrap_or(media_type),
                        });
                    } else {
                        tokio::fs::create_dir_all(&dest_dir).await.map_err(|e| {
                            Error::Internal(anyhow::anyhow!(
                                "create {}: {}",
                                dest_dir.display(),
                                e
                            ))
                        })?;
                        let filename = path
                            .file_name()
                            .ok_or_else(|| Error::step(step_id, "output without filename"))?;
                        let dest = dest_dir.join(filename);
                        if dest != path {
                            tokio::fs::copy(&path, &dest).await.map_err(|e| {
                                Error::Internal(anyhow::anyhow!(
                                    "relocate {}: {}",
                                    dest.display(),
                                    e
                                ))
                            })?;
                        }
                        moved.push(Artifact::File {
                            path: dest,
                            media_type,
                        });
                    }
                }
            }
        }
        relocated.insert(output_id, moved);
    }
    Ok(relocated)
}

/// Execute a CWL workflow step by step.
#[allow(clippy::too_many_arguments)]
pub async fn execute_workflow(
    package: &Package,
    workflow_inputs: &BTreeMap<String, Value>,
    registry: &RunnerRegistry,
    settings: &Arc<Settings>,
    fetcher: &Arc<Fetcher>,
    auth: &AuthContext,
    work_dir: &Path,
    step_timeout: Duration,
    hooks: &dyn ExecutionHooks,
) -> Result<StepOutputs> {
    let ordered = plan_steps(package)?;
    if ordered.is_empty() {
        return Err(Error::schema("workflow has no steps"));
    }
    let bodies = package.document.get("steps").cloned().unwrap_or(Value::Null);
    let total = ordered.len() as u8;

    let mut step_results: HashMap<String, StepOutputs> = HashMap::new();
    for (index, step) in ordered.iter().enumerate() {
        // cancellation checkpoint between steps
        if hooks.is_cancelled().await {
            return Err(Error::Gone("job was dismissed".into()));
        }
        if step.requirement.is_local() && !settings.configuration.allows_local_execution() {
            return Err(Error::unprocessable(format!(
                "step '{}' requires local execution, refused in EMS mode",
                step.id
            )));
        }
        if !step.requirement.is_local() && !settings.configuration.allows_remote_dispatch() {
            return Err(Error::unprocessable(format!(
                "step '{}' requires remote dispatch, refused in ADES mode",
                step.id
            )));
        }

        let body = step_body(&bodies, &step.id);
        let inputs = resolve_step_inputs(&body, workflow_inputs, &step_results)?;
        let kind = RunnerKind::for_requirement(&step.requirement);

        let run_package = match &step.run {
            Value::Object(_) => Package::from_value(step.run.clone())?,
            _ => package.clone(),
        };
        let mut output_globs = BTreeMap::new();
        if let Ok(outputs) = run_package.outputs() {
            for output in outputs {
                output_globs.insert(output.id.clone(), run_package.output_glob(&output.id));
            }
        }

        let ctx = StepContext {
            step_id: step.id.clone(),
            requirement: step.requirement.clone(),
            document: run_package.document.clone(),
            inputs,
            output_globs,
            work_dir: work_dir.join(&step.id).join("work"),
            auth: auth.clone(),
            settings: settings.clone(),
            fetcher: fetcher.clone(),
            timeout: step_timeout,
        };
        let runner = registry.for_requirement(&step.requirement);

        hooks
            .log("INFO", &format!("starting step {}", step.id))
            .await;
        let started = tokio::time::Instant::now();
        let outputs = {
            // buffered retry notices: the hook is async, the retry callback
            // is not
            let mut notices = Vec::new();
            let result = run_step_with_retries(runner.as_ref(), &ctx, |attempt, err| {
                notices.push(format!(
                    "retrying step {} after attempt {}: {}",
                    step.id, attempt, err
                ));
            })
            .await;
            for notice in notices {
                hooks.log("WARNING", &notice).await;
            }
            result?
        };
        hooks
            .log("INFO", &format!("step {} completed", step.id))
            .await;
        hooks.step_finished(&step.id, started.elapsed()).await;
        let percent = ((index + 1) as f32 / total as f32 * 90.0) as u8;
        hooks.progress(percent).await;

        let relocated = relocate_outputs(&step.id, outputs, work_dir, fetcher, auth).await?;
        if kind.wants_local_files() {
            tracing::debug!(step = %step.id, "local step outputs relocated");
        }
        step_results.insert(step.id.clone(), relocated);
    }

    // workflow outputs: outputSource step/output
    let mut collected = StepOutputs::new();
    if let Some(outputs) = package.document.get("outputs") {
        let entries: Vec<(String, Value)> = match outputs {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::Array(list) => list
                .iter()
                .filter_map(|entry| {
                    entry.get("id").and_then(Value::as_str).map(|id| {
                        (
                            id.rsplit('/').next().unwrap_or(id).to_string(),
                            entry.clone(),
                        )
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        for (id, entry) in entries {
            let source = entry
                .get("outputSource")
                .and_then(|s| match s {
                    Value::String(s) => Some(s.clone()),
                    Value::Array(list) => list.first().and_then(Value::as_str).map(String::from),
                    _ => None,
                })
                .ok_or_else(|| {
                    Error::schema(format!("workflow output '{}' without outputSource", id))
                })?;
            let (step, output) = split_source(&source);
            let step = step.ok_or_else(|| {
                Error::schema(format!("workflow output '{}' source is not step-scoped", id))
            })?;
            let artifacts = step_results
                .get(step)
                .and_then(|outputs| outputs.get(output))
                .ok_or_else(|| {
                    Error::schema(format!(
                        "workflow output '{}' references unknown '{}/{}'",
                        id, step, output
                    ))
                })?;
            collected.insert(id, artifacts.clone());
        }
    }
    Ok(collected)
}

fn step_body(bodies: &Value, step_id: &str) -> Value {
    match bodies {
        Value::Object(map) => map
            .iter()
            .find(|(id, _)| id.rsplit('/').next().unwrap_or(id) == step_id)
            .map(|(_, body)| body.clone())
            .unwrap_or(Value::Null),
        Value::Array(list) => list
            .iter()
            .find(|body| {
                body.get("id")
                    .and_then(Value::as_str)
                    .map(|id| id.rsplit('/').next().unwrap_or(id) == step_id)
                    .unwrap_or(false)
            })
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(steps: Value) -> Package {
        Package::from_value(json!({
            "cwlVersion": "v1.2",
            "class": "Workflow",
            "inputs": {"message": "string"},
            "outputs": {"final": {"type": "File", "outputSource": "last/out"}},
            "steps": steps,
        }))
        .unwrap()
    }

    #[test]
    fn plan_orders_by_dependencies() {
        let package = workflow(json!({
            "last": {
                "run": {"class": "CommandLineTool"},
                "in": {"data": {"source": "first/out"}},
                "out": ["out"]
            },
            "first": {
                "run": {"class": "CommandLineTool"},
                "in": {"message": "message"},
                "out": ["out"]
            }
        }));
        let ordered = plan_steps(&package).unwrap();
        let ids: Vec<&str> = ordered.iter().map(|s| s.id.as_str()).collect();
        let first_pos = ids.iter().position(|id| *id == "first").unwrap();
        let last_pos = ids.iter().position(|id| *id == "last").unwrap();
        assert!(first_pos < last_pos);
    }

    #[test]
    fn cycle_detected() {
        let package = workflow(json!({
            "a": {"run": {"class": "CommandLineTool"}, "in": {"x": "b/out"}, "out": ["out"]},
            "b": {"run": {"class": "CommandLineTool"}, "in": {"x": "a/out"}, "out": ["out"]}
        }));
        assert!(plan_steps(&package).is_err());
    }

    #[test]
    fn step_inputs_resolve_from_workflow_and_upstream() {
        let mut workflow_inputs = BTreeMap::new();
        workflow_inputs.insert("message".to_string(), json!("hello"));
        let mut step_results = HashMap::new();
        let mut upstream = StepOutputs::new();
        upstream.insert(
            "out".into(),
            vec![Artifact::File {
                path: "/work/first/out/data.nc".into(),
                media_type: "application/x-netcdf".into(),
            }],
        );
        step_results.insert("first".to_string(), upstream);

        let body = json!({
            "in": {
                "msg": "message",
                "data": {"source": "first/out"}
            }
        });
        let inputs = resolve_step_inputs(&body, &workflow_inputs, &step_results).unwrap();
        assert_eq!(inputs["msg"], json!("hello"));
        assert_eq!(inputs["data"], json!("/work/first/out/data.nc"));
    }

    #[test]
    fn missing_upstream_output_is_an_error() {
        let mut step_results = HashMap::new();
        step_results.insert("first".to_string(), StepOutputs::new());
        let body = json!({"in": {"data": {"source": "first/missing"}}});
        assert!(resolve_step_inputs(&body, &BTreeMap::new(), &step_results).is_err());
    }

    #[tokio::test]
    async fn relocation_copies_into_step_layout() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw.nc");
        std::fs::write(&source, "CDF").unwrap();

        let mut outputs = StepOutputs::new();
        outputs.insert(
            "out".into(),
            vec![
                Artifact::File {
                    path: source,
                    media_type: "application/x-netcdf".into(),
                },
                Artifact::Literal(json!(3)),
            ],
        );

        use weft_core::config::{Configuration, RequestOptions, Settings};
        let settings = Arc::new(Settings {
            configuration: Configuration::Default,
            url: String::new(),
            wps_output_dir: dir.path().to_path_buf(),
            wps_output_url: "http://localhost/wpsoutputs".into(),
            wps_output_s3_bucket: None,
            wps_output_s3_region: None,
            wps_output_context: None,
            wps_workdir: dir.path().to_path_buf(),
            cwl_euid: None,
            cwl_egid: None,
            execute_sync_max_wait: 20,
            wps_max_request_size: 1,
            wps_max_single_input_size: 1024,
            request_options: RequestOptions::empty(),
            cwl_processes_dir: None,
            cwl_processes_register_error: false,
            cwl_prov: true,
            schema_url: String::new(),
            wps_email_notify_timeout: 10,
            vault_dir: dir.path().join("vault"),
            vault_secret: None,
            file_allowlist: vec![],
            cwl_engine: "cwltool".into(),
        });
        let fetcher = Fetcher::new(settings);

        let relocated = relocate_outputs(
            "stepA",
            outputs,
            dir.path(),
            &fetcher,
            &AuthContext::default(),
        )
        .await
        .unwrap();
        let Artifact::File { path, .. } = &relocated["out"][0] else {
            panic!("expected file");
        };
        assert_eq!(path, &dir.path().join("stepA").join("out").join("raw.nc"));
        assert!(path.exists());
        assert_eq!(relocated["out"][1], Artifact::Literal(json!(3)));
    }
}
