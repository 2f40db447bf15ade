// I/O staging: pre-execution input materialisation under locality rules,
// post-execution result publication to the output directory or S3.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use weft_contracts::{ExecuteValue, OutputRequest, TransmissionMode};
use weft_core::auth::AuthContext;
use weft_core::builtin::Artifact;
use weft_core::config::Settings;
use weft_core::error::{Error, Result};
use weft_core::fetch::{FetchOptions, Fetcher};
use weft_core::model::{IoDescriptor, IoType, Occurrence, ProcessModel};

use crate::runner::{RunnerKind, StepOutputs};

/// Inline literal outputs above this size stay references.
const INLINE_LIMIT_BYTES: u64 = 64 * 1024;

// ============================================
// Input staging
// ============================================

/// Materialise submitted inputs for a runner. Local runners receive staged
/// file paths; remote runners keep URLs except for vault references, which
/// are always resolved first.
pub async fn stage_inputs(
    model: &ProcessModel,
    submitted: &BTreeMap<String, ExecuteValue>,
    runner_kind: RunnerKind,
    fetcher: &Fetcher,
    work_dir: &Path,
    auth: &AuthContext,
) -> Result<BTreeMap<String, Value>> {
    for id in submitted.keys() {
        if model.input(id).is_none() {
            return Err(Error::schema(format!("unknown input '{}'", id)));
        }
    }

    let input_dir = work_dir.join("inputs");
    let mut staged = BTreeMap::new();
    for descriptor in &model.inputs {
        match submitted.get(&descriptor.id) {
            Some(value) => {
                let staged_value = stage_one(
                    descriptor,
                    value,
                    runner_kind,
                    fetcher,
                    &input_dir.join(&descriptor.id),
                    auth,
                )
                .await?;
                staged.insert(descriptor.id.clone(), staged_value);
            }
            None if descriptor.default.is_some() => {
                staged.insert(
                    descriptor.id.clone(),
                    descriptor.default.clone().expect("checked above"),
                );
            }
            // omitted optionals are dropped entirely, no null placeholder
            None if descriptor.optional() => {}
            None => {
                return Err(Error::schema(format!(
                    "missing required input '{}'",
                    descriptor.id
                )))
            }
        }
    }
    Ok(staged)
}

async fn stage_one(
    descriptor: &IoDescriptor,
    value: &ExecuteValue,
    runner_kind: RunnerKind,
    fetcher: &Fetcher,
    dest_dir: &Path,
    auth: &AuthContext,
) -> Result<Value> {
    if let ExecuteValue::Array(items) = value {
        check_occurrences(descriptor, items.len())?;
        let mut staged = Vec::with_capacity(items.len());
        // order preserved
        for item in items {
            staged.push(
                Box::pin(stage_one(descriptor, item, runner_kind, fetcher, dest_dir, auth))
                    .await?,
            );
        }
        return Ok(Value::Array(staged));
    }
    check_occurrences(descriptor, 1)?;

    match (&descriptor.io_type, value) {
        (IoType::Literal(lit), ExecuteValue::Literal(raw))
        | (IoType::Literal(lit), ExecuteValue::Qualified { value: raw, .. }) => {
            if !lit.accepts(raw) {
                return Err(Error::schema(format!(
                    "input '{}' value {} does not satisfy type {:?}",
                    descriptor.id, raw, lit
                )));
            }
            for domain in &descriptor.domains {
                if !domain.accepts(raw) {
                    return Err(Error::schema(format!(
                        "input '{}' value {} outside its literal domain",
                        descriptor.id, raw
                    )));
                }
            }
            Ok(raw.clone())
        }
        (IoType::Enum { values }, ExecuteValue::Literal(raw)) => {
            let Some(symbol) = raw.as_str() else {
                return Err(Error::schema(format!(
                    "input '{}' enum value must be a string",
                    descriptor.id
                )));
            };
            if !values.iter().any(|v| v == symbol) {
                return Err(Error::schema(format!(
                    "input '{}' value '{}' not among allowed symbols",
                    descriptor.id, symbol
                )));
            }
            Ok(raw.clone())
        }
        (IoType::BoundingBox { .. }, ExecuteValue::Literal(raw)) => Ok(raw.clone()),
        (IoType::Complex { directory }, ExecuteValue::Reference { href, media_type, .. }) => {
            stage_reference(
                descriptor,
                href,
                media_type.as_deref(),
                *directory,
                runner_kind,
                fetcher,
                dest_dir,
                auth,
            )
            .await
        }
        (IoType::Complex { .. }, ExecuteValue::Qualified { value: raw, media_type }) => {
            // inline complex payload gets written out for local runners
            if runner_kind.wants_local_files() {
                let extension = media_type
                    .as_deref()
                    .and_then(weft_core::model::formats::extension_for)
                    .unwrap_or("dat");
                tokio::fs::create_dir_all(dest_dir).await.map_err(|e| {
                    Error::Internal(anyhow::anyhow!("create {}: {}", dest_dir.display(), e))
                })?;
                let path = dest_dir.join(format!("{}.{}", descriptor.id, extension));
                let body = match raw {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string(other)
                        .map_err(|e| Error::Internal(anyhow::anyhow!("serialize inline: {}", e)))?,
                };
                tokio::fs::write(&path, body).await.map_err(|e| {
                    Error::Internal(anyhow::anyhow!("write {}: {}", path.display(), e))
                })?;
                Ok(Value::String(path.display().to_string()))
            } else {
                Ok(raw.clone())
            }
        }
        (IoType::Complex { .. }, ExecuteValue::Literal(raw)) if raw.is_string() => {
            // bare string for a complex input is treated as a reference
            let href = raw.as_str().expect("checked");
            stage_reference(
                descriptor,
                href,
                None,
                false,
                runner_kind,
                fetcher,
                dest_dir,
                auth,
            )
            .await
        }
        (io_type, _) => Err(Error::schema(format!(
            "input '{}' value shape does not match {:?}",
            descriptor.id, io_type
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn stage_reference(
    descriptor: &IoDescriptor,
    href: &str,
    media_type: Option<&str>,
    directory: bool,
    runner_kind: RunnerKind,
    fetcher: &Fetcher,
    dest_dir: &Path,
    auth: &AuthContext,
) -> Result<Value> {
    if directory && !href.ends_with('/') {
        return Err(Error::schema(format!(
            "input '{}' is a directory reference and requires a trailing slash: {}",
            descriptor.id, href
        )));
    }
    let is_vault = href.starts_with("vault://");
    if !runner_kind.wants_local_files() && !is_vault {
        // remote runners take the URL as-is
        return Ok(Value::String(href.to_string()));
    }

    if directory {
        // fetching preserves the top-level directory name so relative
        // resolution inside keeps working
        let trimmed = href.trim_end_matches('/');
        let dir_name = trimmed.rsplit('/').next().unwrap_or("dir");
        if let Some(local) = trimmed.strip_prefix("file://") {
            let fetched = fetcher
                .fetch(&format!("file://{}", local), dest_dir, &fetch_options(auth, media_type))
                .await?;
            return Ok(Value::String(format!("{}/", fetched.local_path.display())));
        }
        let dest = dest_dir.join(dir_name);
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create {}: {}", dest.display(), e)))?;
        let fetched = fetcher
            .fetch(trimmed, &dest, &fetch_options(auth, media_type))
            .await?;
        let parent = fetched
            .local_path
            .parent()
            .unwrap_or(&dest)
            .display()
            .to_string();
        return Ok(Value::String(format!("{}/", parent)));
    }

    let fetched = fetcher
        .fetch(href, dest_dir, &fetch_options(auth, media_type))
        .await?;
    Ok(Value::String(fetched.local_path.display().to_string()))
}

fn fetch_options(auth: &AuthContext, media_type: Option<&str>) -> FetchOptions {
    FetchOptions {
        auth: auth.clone(),
        expect_media_type: media_type.map(String::from),
        no_cache: false,
    }
}

fn check_occurrences(descriptor: &IoDescriptor, count: usize) -> Result<()> {
    let count = count as u32;
    if count < descriptor.min_occurs && descriptor.min_occurs > 0 {
        return Err(Error::schema(format!(
            "input '{}' needs at least {} values, got {}",
            descriptor.id, descriptor.min_occurs, count
        )));
    }
    if let Occurrence::Finite(max) = descriptor.max_occurs {
        if count > max {
            return Err(Error::schema(format!(
                "input '{}' allows at most {} values, got {}",
                descriptor.id, max, count
            )));
        }
    }
    Ok(())
}

// ============================================
// Output publication
// ============================================

/// Destination resolved for a job's outputs.
pub enum OutputSink {
    Directory(PathBuf),
    S3 { bucket: String, prefix: String },
}

pub fn resolve_sink(settings: &Settings, context: Option<&str>, job_id: Uuid) -> OutputSink {
    if let Some(bucket) = &settings.wps_output_s3_bucket {
        let region = settings
            .wps_output_s3_region
            .clone()
            .unwrap_or_else(|| "us-east-1".into());
        let prefix = match context.or(settings.wps_output_context.as_deref()) {
            Some(ctx) => format!("{}/{}/{}", region, ctx.trim_matches('/'), job_id),
            None => format!("{}/{}", region, job_id),
        };
        OutputSink::S3 {
            bucket: bucket.clone(),
            prefix,
        }
    } else {
        OutputSink::Directory(settings.job_output_dir(context, job_id))
    }
}

/// Published results document plus the cumulative output size.
pub struct Published {
    pub results: Value,
    pub total_bytes: u64,
}

/// Publish collected step outputs: copy files to the sink, resolve
/// transmission modes, inline small literal results.
pub async fn publish_outputs(
    settings: &Arc<Settings>,
    model: &ProcessModel,
    job_id: Uuid,
    output_context: Option<&str>,
    collected: &StepOutputs,
    requests: Option<&BTreeMap<String, OutputRequest>>,
) -> Result<Published> {
    let sink = resolve_sink(settings, output_context, job_id);
    let mut results = Map::new();
    let mut total_bytes: u64 = 0;

    for descriptor in &model.outputs {
        // submit-time filter: when any outputs were requested, only those
        // are published
        if let Some(requests) = requests {
            if !requests.is_empty() && !requests.contains_key(&descriptor.id) {
                continue;
            }
        }
        let Some(artifacts) = collected.get(&descriptor.id) else {
            if descriptor.optional() {
                continue;
            }
            return Err(Error::step(
                &descriptor.id,
                "runner produced no artifact for required output",
            ));
        };

        let mode = transmission_for(descriptor, model, requests);
        let mut rendered: Vec<Value> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            rendered.push(
                publish_artifact(
                    settings,
                    &sink,
                    job_id,
                    output_context,
                    descriptor,
                    artifact,
                    mode,
                    &mut total_bytes,
                )
                .await?,
            );
        }
        let value = if descriptor.array() && rendered.len() != 1 {
            Value::Array(rendered)
        } else if rendered.len() == 1 {
            rendered.into_iter().next().expect("len checked")
        } else {
            Value::Array(rendered)
        };
        results.insert(descriptor.id.clone(), value);
    }

    Ok(Published {
        results: Value::Object(results),
        total_bytes,
    })
}

/// Submit-time override wins over the process default wins over `value`.
fn transmission_for(
    descriptor: &IoDescriptor,
    model: &ProcessModel,
    requests: Option<&BTreeMap<String, OutputRequest>>,
) -> TransmissionMode {
    if let Some(request) = requests.and_then(|r| r.get(&descriptor.id)) {
        if let Some(mode) = request.transmission_mode {
            return mode;
        }
    }
    model
        .output_transmission
        .first()
        .copied()
        .unwrap_or(TransmissionMode::Value)
}

#[allow(clippy::too_many_arguments)]
async fn publish_artifact(
    settings: &Arc<Settings>,
    sink: &OutputSink,
    job_id: Uuid,
    output_context: Option<&str>,
    descriptor: &IoDescriptor,
    artifact: &Artifact,
    mode: TransmissionMode,
    total_bytes: &mut u64,
) -> Result<Value> {
    match artifact {
        Artifact::Literal(value) => {
            *total_bytes += value.to_string().len() as u64;
            Ok(json!({ "value": value }))
        }
        Artifact::File { path, media_type } => {
            // remote references that were never materialised pass through
            if path.to_string_lossy().contains("://") {
                return Ok(json!({ "href": path.to_string_lossy(), "type": media_type }));
            }
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::step(&descriptor.id, "artifact without filename"))?;
            let size = tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            *total_bytes += size;

            let href = match sink {
                OutputSink::Directory(dir) => {
                    let dest_dir = dir.join(&descriptor.id);
                    tokio::fs::create_dir_all(&dest_dir).await.map_err(|e| {
                        Error::Internal(anyhow::anyhow!("create {}: {}", dest_dir.display(), e))
                    })?;
                    let dest = dest_dir.join(filename);
                    if dest != *path {
                        tokio::fs::copy(path, &dest).await.map_err(|e| {
                            Error::Internal(anyhow::anyhow!("publish {}: {}", dest.display(), e))
                        })?;
                    }
                    format!(
                        "{}/{}/{}",
                        settings.job_output_url(output_context, job_id),
                        descriptor.id,
                        filename
                    )
                }
                OutputSink::S3 { bucket, prefix } => {
                    let key = format!("{}/{}/{}", prefix, descriptor.id, filename);
                    upload_s3(settings, bucket, &key, path, media_type).await?;
                    format!("s3://{}/{}", bucket, key)
                }
            };

            // small text results can still be inlined when value was asked
            if mode == TransmissionMode::Value
                && size <= INLINE_LIMIT_BYTES
                && is_textual(media_type)
            {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::Internal(anyhow::anyhow!("read {}: {}", path.display(), e))
                })?;
                return Ok(json!({ "value": content, "mediaType": media_type }));
            }
            Ok(json!({ "href": href, "type": media_type }))
        }
    }
}

fn is_textual(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type == "application/json"
        || media_type == "application/geo+json"
}

async fn upload_s3(
    settings: &Arc<Settings>,
    bucket: &str,
    key: &str,
    path: &Path,
    media_type: &str,
) -> Result<()> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &settings.wps_output_s3_region {
        loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
    }
    let config = loader.load().await;
    let client = aws_sdk_s3::Client::new(&config);
    let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("read {}: {}", path.display(), e)))?;
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .content_type(media_type)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("S3 upload {}: {}", key, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_contracts::ProcessKind;
    use weft_core::config::{Configuration, RequestOptions};
    use weft_core::model::{Format, LiteralDomain, LiteralType};

    fn settings(dir: &Path) -> Arc<Settings> {
        Arc::new(Settings {
            configuration: Configuration::Default,
            url: "http://localhost:9000".into(),
            wps_output_dir: dir.to_path_buf(),
            wps_output_url: "http://localhost:9000/wpsoutputs".into(),
            wps_output_s3_bucket: None,
            wps_output_s3_region: None,
            wps_output_context: None,
            wps_workdir: dir.to_path_buf(),
            cwl_euid: None,
            cwl_egid: None,
            execute_sync_max_wait: 20,
            wps_max_request_size: 30 * 1024 * 1024,
            wps_max_single_input_size: 1024 * 1024,
            request_options: RequestOptions::empty(),
            cwl_processes_dir: None,
            cwl_processes_register_error: false,
            cwl_prov: true,
            schema_url: String::new(),
            wps_email_notify_timeout: 10,
            vault_dir: dir.join("vault"),
            vault_secret: None,
            file_allowlist: vec![dir.to_path_buf()],
            cwl_engine: "cwltool".into(),
        })
    }

    fn echo_model() -> ProcessModel {
        let mut model = ProcessModel::new("echo", ProcessKind::Builtin);
        model
            .inputs
            .push(IoDescriptor::new("message", IoType::Literal(LiteralType::String)));
        let mut optional = IoDescriptor::new("level", IoType::Literal(LiteralType::Integer));
        optional.min_occurs = 0;
        model.inputs.push(optional);
        model
            .outputs
            .push(IoDescriptor::new("echoed", IoType::Literal(LiteralType::String)));
        model
    }

    #[tokio::test]
    async fn literals_validate_and_optionals_drop() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let model = echo_model();

        let mut submitted = BTreeMap::new();
        submitted.insert(
            "message".to_string(),
            ExecuteValue::Literal(json!("hello")),
        );
        let staged = stage_inputs(
            &model,
            &submitted,
            RunnerKind::Builtin,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(staged.get("message"), Some(&json!("hello")));
        // no null placeholder for the omitted optional
        assert!(!staged.contains_key("level"));
    }

    #[tokio::test]
    async fn missing_required_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let err = stage_inputs(
            &echo_model(),
            &BTreeMap::new(),
            RunnerKind::Builtin,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_INVALID");
    }

    #[tokio::test]
    async fn unknown_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let mut submitted = BTreeMap::new();
        submitted.insert("message".to_string(), ExecuteValue::Literal(json!("x")));
        submitted.insert("bogus".to_string(), ExecuteValue::Literal(json!(1)));
        let err = stage_inputs(
            &echo_model(),
            &submitted,
            RunnerKind::Builtin,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_INVALID");
    }

    #[tokio::test]
    async fn literal_domain_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let mut model = echo_model();
        model.inputs[1].domains.push(LiteralDomain {
            allowed_values: vec![json!(1), json!(2)],
            ..Default::default()
        });

        let mut submitted = BTreeMap::new();
        submitted.insert("message".to_string(), ExecuteValue::Literal(json!("x")));
        submitted.insert("level".to_string(), ExecuteValue::Literal(json!(9)));
        let err = stage_inputs(
            &model,
            &submitted,
            RunnerKind::Builtin,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_INVALID");
    }

    #[tokio::test]
    async fn remote_runner_keeps_urls() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let mut model = ProcessModel::new("subset", ProcessKind::Application);
        let mut data = IoDescriptor::new("data", IoType::Complex { directory: false });
        data.formats.push(Format::new("application/x-netcdf").as_default());
        model.inputs.push(data);

        let mut submitted = BTreeMap::new();
        submitted.insert(
            "data".to_string(),
            ExecuteValue::Reference {
                href: "https://example.test/a.nc".into(),
                media_type: None,
                schema: None,
                encoding: None,
            },
        );
        let staged = stage_inputs(
            &model,
            &submitted,
            RunnerKind::Wps1,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(staged["data"], json!("https://example.test/a.nc"));
    }

    #[tokio::test]
    async fn directory_reference_requires_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let mut model = ProcessModel::new("pack", ProcessKind::Application);
        model
            .inputs
            .push(IoDescriptor::new("tiles", IoType::Complex { directory: true }));

        let mut submitted = BTreeMap::new();
        submitted.insert(
            "tiles".to_string(),
            ExecuteValue::Reference {
                href: "file:///data/tiles".into(),
                media_type: None,
                schema: None,
                encoding: None,
            },
        );
        let err = stage_inputs(
            &model,
            &submitted,
            RunnerKind::LocalCwl,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_INVALID");
    }

    #[tokio::test]
    async fn array_occurrence_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let fetcher = Fetcher::new(settings);
        let mut model = ProcessModel::new("merge", ProcessKind::Application);
        let mut files = IoDescriptor::new("levels", IoType::Literal(LiteralType::Integer));
        files.max_occurs = Occurrence::Finite(2);
        model.inputs.push(files);

        let mut submitted = BTreeMap::new();
        submitted.insert(
            "levels".to_string(),
            ExecuteValue::Array(vec![
                ExecuteValue::Literal(json!(1)),
                ExecuteValue::Literal(json!(2)),
                ExecuteValue::Literal(json!(3)),
            ]),
        );
        let err = stage_inputs(
            &model,
            &submitted,
            RunnerKind::LocalCwl,
            &fetcher,
            dir.path(),
            &AuthContext::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_INVALID");
    }

    #[tokio::test]
    async fn publish_inlines_small_text_and_links_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let job_id = Uuid::now_v7();

        let mut model = ProcessModel::new("subset", ProcessKind::Application);
        let mut out = IoDescriptor::new("report", IoType::Complex { directory: false });
        out.formats.push(Format::new("text/plain").as_default());
        model.outputs.push(out);
        let mut nc = IoDescriptor::new("data", IoType::Complex { directory: false });
        nc.formats.push(Format::new("application/x-netcdf").as_default());
        model.outputs.push(nc);

        let report = dir.path().join("report.txt");
        std::fs::write(&report, "all good").unwrap();
        let data = dir.path().join("out.nc");
        std::fs::write(&data, vec![0u8; 128]).unwrap();

        let mut collected = StepOutputs::new();
        collected.insert(
            "report".into(),
            vec![Artifact::File {
                path: report,
                media_type: "text/plain".into(),
            }],
        );
        collected.insert(
            "data".into(),
            vec![Artifact::File {
                path: data,
                media_type: "application/x-netcdf".into(),
            }],
        );

        let mut requests = BTreeMap::new();
        requests.insert(
            "data".to_string(),
            OutputRequest {
                transmission_mode: Some(TransmissionMode::Reference),
                format: None,
            },
        );
        requests.insert("report".to_string(), OutputRequest::default());

        let published = publish_outputs(
            &settings,
            &model,
            job_id,
            None,
            &collected,
            Some(&requests),
        )
        .await
        .unwrap();

        // small text with default value mode is inlined
        assert_eq!(published.results["report"]["value"], "all good");
        // explicit reference override yields an href under the job tree
        let href = published.results["data"]["href"].as_str().unwrap();
        assert!(href.contains(&job_id.to_string()));
        assert!(href.ends_with("/data/out.nc"));
        assert_eq!(published.total_bytes, 8 + 128);
        // file landed nested by output id
        assert!(settings
            .job_output_dir(None, job_id)
            .join("data")
            .join("out.nc")
            .exists());
    }

    #[tokio::test]
    async fn requested_subset_filters_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let job_id = Uuid::now_v7();
        let mut model = ProcessModel::new("p", ProcessKind::Application);
        let mut a = IoDescriptor::new("a", IoType::Complex { directory: false });
        a.formats.push(Format::new("text/plain").as_default());
        a.min_occurs = 0;
        model.outputs.push(a);
        let mut b = IoDescriptor::new("b", IoType::Complex { directory: false });
        b.formats.push(Format::new("text/plain").as_default());
        b.min_occurs = 0;
        model.outputs.push(b);

        let file = dir.path().join("a.txt");
        std::fs::write(&file, "A").unwrap();
        let mut collected = StepOutputs::new();
        collected.insert(
            "a".into(),
            vec![Artifact::File {
                path: file,
                media_type: "text/plain".into(),
            }],
        );

        let mut requests = BTreeMap::new();
        requests.insert("a".to_string(), OutputRequest::default());

        let published =
            publish_outputs(&settings, &model, job_id, None, &collected, Some(&requests))
                .await
                .unwrap();
        assert!(published.results.get("a").is_some());
        assert!(published.results.get("b").is_none());
    }
}
