// Deploy pipeline: resolve the execution unit (inline CWL, referenced CWL,
// remote OGC API process, remote WPS service), collect descriptor sources,
// run the merger, and persist the revision.

use std::sync::Arc;

use semver::Version;
use serde_json::{json, Value};

use weft_contracts::{DeployRequest, ProcessKind, Visibility};
use weft_core::config::Settings;
use weft_core::error::{Error, Result};
use weft_core::fetch::{FetchOptions, Fetcher};
use weft_core::model::merge::merge_sections;
use weft_core::model::{ogc_io, wps_io, IoDescriptor, ProcessModel};
use weft_core::package::{
    classify_reference, resolve_execution_unit, ExecutionUnit, Package,
};
use weft_storage::CreateProcess;

/// Content types accepted by the deploy endpoint that require a YAML parse.
pub const YAML_CONTENT_TYPES: &[&str] = &[
    "application/x-yaml",
    "application/cwl+yaml",
    "application/ogcapppkg+yaml",
];

pub fn is_yaml_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    YAML_CONTENT_TYPES.contains(&essence) || essence.ends_with("+yaml")
}

/// Deserialise the deploy body honoring the Content-Type.
pub fn parse_payload(raw: &[u8], content_type: Option<&str>) -> Result<Value> {
    let yaml = content_type.map(is_yaml_content_type).unwrap_or(false);
    if yaml {
        serde_yaml::from_slice(raw).map_err(|e| Error::schema(format!("invalid YAML body: {}", e)))
    } else {
        serde_json::from_slice(raw)
            .or_else(|_| serde_yaml::from_slice(raw))
            .map_err(|e| Error::schema(format!("invalid body: {}", e)))
    }
}

/// Inputs gathered from one descriptor source.
struct DescriptorSource {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    version: Option<String>,
    inputs: Vec<IoDescriptor>,
    outputs: Vec<IoDescriptor>,
}

#[derive(Debug)]
pub struct DeployOutcome {
    pub create: CreateProcess,
}

/// Build the stored process from a deploy payload.
pub async fn build_process(
    settings: &Arc<Settings>,
    fetcher: &Fetcher,
    payload: Value,
    version: Option<Version>,
    docker_token: Option<&str>,
) -> Result<DeployOutcome> {
    // a bare CWL document is accepted as its own execution unit
    let request: DeployRequest = if payload.get("class").is_some() {
        DeployRequest {
            execution_unit: Some(vec![weft_contracts::ExecutionUnitRef::Inline(
                payload.clone(),
            )]),
            ..Default::default()
        }
    } else {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::schema(format!("invalid deploy payload: {}", e)))?
    };

    let description = process_description(&request, &payload);
    let ows_href = request
        .ows_context
        .as_ref()
        .and_then(|ctx| ctx.pointer("/offering/content/href"))
        .and_then(Value::as_str)
        .map(String::from);

    let unit = match &request.execution_unit {
        Some(units) => resolve_execution_unit(units, ows_href.as_deref())?,
        None => match &ows_href {
            Some(href) => classify_reference(href, None),
            None => {
                // `process` may carry a remote OGC API URL directly
                match request
                    .process
                    .as_ref()
                    .and_then(Value::as_str)
                {
                    Some(href) => classify_reference(href, None),
                    None => return Err(Error::schema("deploy payload carries no execution unit")),
                }
            }
        },
    };

    // descriptor source from the execution unit
    let (unit_source, package, kind, resolved_unit) =
        resolve_unit_source(settings, fetcher, unit, &description).await?;

    // descriptor source from the submitted process description
    let payload_source = description_source(&description)?;

    let declared_kind = description
        .as_ref()
        .and_then(|d| d.get("type"))
        .and_then(Value::as_str);
    if declared_kind == Some("builtin") {
        return Err(Error::Forbidden(
            "builtin processes cannot be deployed externally".into(),
        ));
    }

    let id = payload_source
        .id
        .clone()
        .or_else(|| unit_source.id.clone())
        .ok_or_else(|| Error::schema("process id missing from payload and execution unit"))?;

    let mut model = ProcessModel::new(&id, kind);
    model.version = version
        .or_else(|| {
            payload_source
                .version
                .as_deref()
                .or(unit_source.version.as_deref())
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or_else(|| Version::new(1, 0, 0));
    model.title = payload_source
        .title
        .clone()
        .or_else(|| unit_source.title.clone());
    model.description = payload_source
        .description
        .clone()
        .or_else(|| unit_source.description.clone());

    if let Some(description) = &description {
        if let Some(keywords) = description.get("keywords").and_then(Value::as_array) {
            model.keywords = keywords
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }
        if let Some(metadata) = description.get("metadata") {
            model.metadata = serde_json::from_value(metadata.clone())
                .map_err(|e| Error::schema(format!("invalid metadata: {}", e)))?;
        }
        if let Some(options) = description.get("jobControlOptions") {
            model.job_control_options = serde_json::from_value(options.clone())
                .map_err(|e| Error::schema(format!("invalid jobControlOptions: {}", e)))?;
        }
        if let Some(transmission) = description.get("outputTransmission") {
            model.output_transmission = serde_json::from_value(transmission.clone())
                .map_err(|e| Error::schema(format!("invalid outputTransmission: {}", e)))?;
        }
        if let Some(visibility) = description.get("visibility") {
            model.visibility = serde_json::from_value(visibility.clone())
                .map_err(|e| Error::schema(format!("invalid visibility: {}", e)))?;
        }
    } else {
        model.visibility = Visibility::Private;
    }

    model.inputs = merge_sections(vec![unit_source.inputs, payload_source.inputs], false)?;
    model.outputs = merge_sections(vec![unit_source.outputs, payload_source.outputs], true)?;
    model.validate()?;

    // local packages get sanitised and value-guarded before storage
    let stored_package = match package {
        Some(package) => {
            let mut package = package.sanitise()?.inject_value_guards(&model.inputs);
            if let Some(token) = docker_token {
                if let Some(doc) = package.document.as_object_mut() {
                    let hints = doc
                        .entry("hints")
                        .or_insert_with(|| Value::Object(Default::default()));
                    if let Some(hints) = hints.as_object_mut() {
                        hints.insert("weft:DockerAuth".into(), json!({ "token": token }));
                    }
                }
            }
            Some(package.document)
        }
        None => None,
    };

    Ok(DeployOutcome {
        create: CreateProcess {
            model,
            execution_unit: resolved_unit,
            package: stored_package,
        },
    })
}

fn process_description(request: &DeployRequest, payload: &Value) -> Option<Value> {
    let description = request
        .process_description
        .clone()
        .or_else(|| payload.get("processDescription").cloned())?;
    // legacy payloads nest the description under a `process` key
    match description.get("process") {
        Some(nested) if nested.is_object() => Some(nested.clone()),
        _ => Some(description),
    }
}

fn description_source(description: &Option<Value>) -> Result<DescriptorSource> {
    let Some(description) = description else {
        return Ok(DescriptorSource {
            id: None,
            title: None,
            description: None,
            version: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
    };
    let inputs = match description.get("inputs") {
        Some(section) => ogc_io::parse_io_section(section, false)?,
        None => Vec::new(),
    };
    let outputs = match description.get("outputs") {
        Some(section) => ogc_io::parse_io_section(section, true)?,
        None => Vec::new(),
    };
    Ok(DescriptorSource {
        id: description
            .get("id")
            .and_then(Value::as_str)
            .map(String::from),
        title: description
            .get("title")
            .and_then(Value::as_str)
            .map(String::from),
        description: description
            .get("description")
            .or_else(|| description.get("abstract"))
            .and_then(Value::as_str)
            .map(String::from),
        version: description
            .get("version")
            .and_then(Value::as_str)
            .map(String::from),
        inputs,
        outputs,
    })
}

async fn resolve_unit_source(
    settings: &Arc<Settings>,
    fetcher: &Fetcher,
    unit: ExecutionUnit,
    description: &Option<Value>,
) -> Result<(DescriptorSource, Option<Package>, ProcessKind, ExecutionUnit)> {
    match unit {
        ExecutionUnit::Cwl(doc) => {
            let package = Package::from_value(doc)?;
            let source = package_source(&package)?;
            let kind = if package.is_workflow() {
                ProcessKind::Workflow
            } else {
                ProcessKind::Application
            };
            let unit = ExecutionUnit::Cwl(package.document.clone());
            Ok((source, Some(package), kind, unit))
        }
        ExecutionUnit::CwlRef(href) => {
            let dest = settings.wps_workdir.join("deploy").join(uuid::Uuid::now_v7().to_string());
            let fetched = fetcher.fetch(&href, &dest, &FetchOptions::default()).await?;
            let raw = tokio::fs::read_to_string(&fetched.local_path)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("read fetched CWL: {}", e)))?;
            // content sniffing for servers returning generic types
            let package = Package::from_text(&raw)?;
            let source = package_source(&package)?;
            let kind = if package.is_workflow() {
                ProcessKind::Workflow
            } else {
                ProcessKind::Application
            };
            Ok((source, Some(package), kind, ExecutionUnit::CwlRef(href)))
        }
        ExecutionUnit::OgcApi(href) => {
            let document: Value = fetcher_json(fetcher, &href).await?;
            let inputs = match document.get("inputs") {
                Some(section) => ogc_io::parse_io_section(section, false)?,
                None => Vec::new(),
            };
            let outputs = match document.get("outputs") {
                Some(section) => ogc_io::parse_io_section(section, true)?,
                None => Vec::new(),
            };
            let source = DescriptorSource {
                id: document
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or_else(|| href.rsplit('/').next().map(String::from)),
                title: document.get("title").and_then(Value::as_str).map(String::from),
                description: document
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                version: document
                    .get("version")
                    .and_then(Value::as_str)
                    .map(String::from),
                inputs,
                outputs,
            };
            Ok((source, None, ProcessKind::OgcApi, ExecutionUnit::OgcApi(href)))
        }
        ExecutionUnit::Wps(href) => {
            let url = describe_process_url(&href, description);
            let xml = fetcher_text(fetcher, &url).await?;
            let info = wps_io::parse_describe_process(&xml)?;
            let source = DescriptorSource {
                id: Some(info.id.clone()),
                title: info.title.clone(),
                description: info.abstract_.clone(),
                version: info.version.clone(),
                inputs: info.inputs,
                outputs: info.outputs,
            };
            Ok((source, None, ProcessKind::Wps1, ExecutionUnit::Wps(href)))
        }
    }
}

fn package_source(package: &Package) -> Result<DescriptorSource> {
    let (title, description) = package.metadata();
    Ok(DescriptorSource {
        id: package.id().map(String::from),
        title,
        description,
        version: package
            .document
            .get("s:softwareVersion")
            .and_then(Value::as_str)
            .map(String::from),
        inputs: package.inputs()?,
        outputs: package.outputs()?,
    })
}

/// Derive the DescribeProcess URL from a WPS reference that may be a bare
/// endpoint or a GetCapabilities URL.
fn describe_process_url(href: &str, description: &Option<Value>) -> String {
    let lowered = href.to_ascii_lowercase();
    if lowered.contains("request=describeprocess") {
        return href.to_string();
    }
    let id = description
        .as_ref()
        .and_then(|d| d.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("ALL");
    let base = href.split('?').next().unwrap_or(href);
    format!(
        "{}?service=WPS&version=1.0.0&request=DescribeProcess&identifier={}",
        base, id
    )
}

async fn fetcher_text(fetcher: &Fetcher, url: &str) -> Result<String> {
    let dest = std::env::temp_dir().join(format!("weft-deploy-{}", uuid::Uuid::now_v7()));
    let fetched = fetcher.fetch(url, &dest, &FetchOptions::default()).await?;
    tokio::fs::read_to_string(&fetched.local_path)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("read fetched document: {}", e)))
}

async fn fetcher_json(fetcher: &Fetcher, url: &str) -> Result<Value> {
    let raw = fetcher_text(fetcher, url).await?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::schema(format!("remote process description is not JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::config::{Configuration, RequestOptions};

    fn test_settings(dir: &std::path::Path) -> Arc<Settings> {
        Arc::new(Settings {
            configuration: Configuration::Default,
            url: "http://localhost:9000".into(),
            wps_output_dir: dir.join("outputs"),
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
            file_allowlist: vec![],
            cwl_engine: "cwltool".into(),
        })
    }

    fn echo_payload() -> Value {
        serde_json::json!({
            "processDescription": {
                "process": {
                    "id": "echo",
                    "title": "Echo",
                    "version": "1.0.0",
                    "visibility": "public"
                }
            },
            "executionUnit": [{
                "unit": {
                    "cwlVersion": "v1.2",
                    "class": "CommandLineTool",
                    "baseCommand": "echo",
                    "requirements": {"DockerRequirement": {"dockerPull": "debian:stable-slim"}},
                    "inputs": {"message": {"type": "string"}},
                    "outputs": {"echoed": {"type": "stdout"}}
                }
            }]
        })
    }

    #[test]
    fn yaml_content_types() {
        assert!(is_yaml_content_type("application/cwl+yaml"));
        assert!(is_yaml_content_type("application/x-yaml; charset=utf-8"));
        assert!(!is_yaml_content_type("application/json"));
    }

    #[test]
    fn payload_parses_yaml_fallback() {
        let value = parse_payload(b"class: CommandLineTool\n", None).unwrap();
        assert_eq!(value["class"], "CommandLineTool");
        assert!(parse_payload(b"{invalid", Some("application/json")).is_err());
    }

    #[tokio::test]
    async fn inline_cwl_deploy_builds_application() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let fetcher = Fetcher::new(settings.clone());
        let outcome = build_process(&settings, &fetcher, echo_payload(), None, None)
            .await
            .unwrap();
        let model = &outcome.create.model;
        assert_eq!(model.id, "echo");
        assert_eq!(model.kind, ProcessKind::Application);
        assert_eq!(model.version.to_string(), "1.0.0");
        assert_eq!(model.visibility, Visibility::Public);
        assert_eq!(model.inputs.len(), 1);
        assert!(matches!(
            outcome.create.execution_unit,
            ExecutionUnit::Cwl(_)
        ));
    }

    #[tokio::test]
    async fn builtin_deployments_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let fetcher = Fetcher::new(settings.clone());
        let mut payload = echo_payload();
        payload["processDescription"]["process"]["type"] = serde_json::json!("builtin");
        let err = build_process(&settings, &fetcher, payload, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn missing_execution_unit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let fetcher = Fetcher::new(settings.clone());
        let payload = serde_json::json!({
            "processDescription": {"process": {"id": "nothing"}}
        });
        let err = build_process(&settings, &fetcher, payload, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_INVALID");
    }

    #[tokio::test]
    async fn docker_token_lands_in_package_hints() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let fetcher = Fetcher::new(settings.clone());
        let outcome = build_process(&settings, &fetcher, echo_payload(), None, Some("tok-123"))
            .await
            .unwrap();
        let package = outcome.create.package.unwrap();
        assert_eq!(package["hints"]["weft:DockerAuth"]["token"], "tok-123");
    }

    #[test]
    fn describe_process_url_forms() {
        assert_eq!(
            describe_process_url("https://wps.example.test/ows", &None),
            "https://wps.example.test/ows?service=WPS&version=1.0.0&request=DescribeProcess&identifier=ALL"
        );
        let description = Some(serde_json::json!({"id": "subset"}));
        assert!(describe_process_url("https://wps.example.test/ows", &description)
            .ends_with("identifier=subset"));
        let passthrough =
            "https://wps.example.test/ows?service=WPS&request=DescribeProcess&identifier=x";
        assert_eq!(describe_process_url(passthrough, &None), passthrough);
    }
}
