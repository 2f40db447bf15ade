// Built-in processes: dispatched in-process, no container. Each one carries
// a fixed declared I/O description and a pure run over staged inputs.
// Reference handling goes through the Fetcher so allowlist and sanitisation
// rules hold here too.

pub mod metalink;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::Version;
use serde_json::Value;

use weft_contracts::{ProcessKind, Visibility};

use crate::error::{Error, Result};
use crate::fetch::{FetchOptions, Fetcher};
use crate::model::{Format, IoDescriptor, IoType, LiteralType, Occurrence, ProcessModel};

/// Execution context handed to a built-in run.
pub struct BuiltinContext<'a> {
    pub fetcher: &'a Fetcher,
    pub work_dir: &'a Path,
}

/// One produced output artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Literal(Value),
    File { path: PathBuf, media_type: String },
}

pub type BuiltinOutputs = BTreeMap<String, Vec<Artifact>>;

/// The fixed set of built-in processes registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Echo,
    File2StringArray,
    FileIndexSelector,
    JsonArray2Netcdf,
    Metalink2Netcdf,
}

impl Builtin {
    pub const ALL: [Builtin; 5] = [
        Builtin::Echo,
        Builtin::File2StringArray,
        Builtin::FileIndexSelector,
        Builtin::JsonArray2Netcdf,
        Builtin::Metalink2Netcdf,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Builtin::Echo => "echo",
            Builtin::File2StringArray => "file2string_array",
            Builtin::FileIndexSelector => "file_index_selector",
            Builtin::JsonArray2Netcdf => "jsonarray2netcdf",
            Builtin::Metalink2Netcdf => "metalink2netcdf",
        }
    }

    pub fn by_id(id: &str) -> Option<Builtin> {
        Builtin::ALL.iter().copied().find(|b| b.id() == id)
    }

    /// Implementation version; bumped only when behaviour changes.
    pub fn version(self) -> Version {
        match self {
            Builtin::Echo => Version::new(1, 0, 0),
            Builtin::File2StringArray => Version::new(1, 0, 0),
            Builtin::FileIndexSelector => Version::new(1, 1, 0),
            Builtin::JsonArray2Netcdf => Version::new(1, 2, 0),
            Builtin::Metalink2Netcdf => Version::new(1, 1, 0),
        }
    }

    /// Declared I/O description.
    pub fn model(self) -> ProcessModel {
        let mut model = ProcessModel::new(self.id(), ProcessKind::Builtin);
        model.version = self.version();
        model.visibility = Visibility::Public;
        match self {
            Builtin::Echo => {
                model.title = Some("Echo".into());
                model.description = Some("Returns its message input unchanged.".into());
                model
                    .inputs
                    .push(IoDescriptor::new("message", IoType::Literal(LiteralType::String)));
                model
                    .outputs
                    .push(IoDescriptor::new("echoed", IoType::Literal(LiteralType::String)));
            }
            Builtin::File2StringArray => {
                model.title = Some("File to string array".into());
                model.description =
                    Some("Wraps the input file reference in a JSON string array.".into());
                let mut input = IoDescriptor::new("input", IoType::Complex { directory: false });
                input.formats = vec![Format::new("application/octet-stream").as_default()];
                model.inputs.push(input);
                let mut output = IoDescriptor::new("output", IoType::Complex { directory: false });
                output.formats = vec![Format::new("application/json").as_default()];
                model.outputs.push(output);
            }
            Builtin::FileIndexSelector => {
                model.title = Some("File index selector".into());
                model.description = Some("Selects one file out of an input file array.".into());
                let mut files = IoDescriptor::new("files", IoType::Complex { directory: false });
                files.max_occurs = Occurrence::Unbounded;
                files.formats = vec![Format::new("application/octet-stream").as_default()];
                model.inputs.push(files);
                model
                    .inputs
                    .push(IoDescriptor::new("index", IoType::Literal(LiteralType::Integer)));
                let mut output = IoDescriptor::new("output", IoType::Complex { directory: false });
                output.formats = vec![Format::new("application/octet-stream").as_default()];
                model.outputs.push(output);
            }
            Builtin::JsonArray2Netcdf => {
                model.title = Some("JSON array to NetCDF".into());
                model.description = Some(
                    "Fetches every NetCDF file referenced by the input JSON array.".into(),
                );
                let mut input = IoDescriptor::new("input", IoType::Complex { directory: false });
                input.formats = vec![Format::new("application/json").as_default()];
                model.inputs.push(input);
                let mut output = IoDescriptor::new("output", IoType::Complex { directory: false });
                output.max_occurs = Occurrence::Unbounded;
                output.formats = vec![Format::new("application/x-netcdf").as_default()];
                model.outputs.push(output);
            }
            Builtin::Metalink2Netcdf => {
                model.title = Some("Metalink to NetCDF".into());
                model.description =
                    Some("Fetches the indexed NetCDF file out of a Metalink document.".into());
                let mut input = IoDescriptor::new("input", IoType::Complex { directory: false });
                input.formats = vec![
                    Format::new("application/metalink4+xml").as_default(),
                    Format::new("application/metalink+xml"),
                ];
                model.inputs.push(input);
                model
                    .inputs
                    .push(IoDescriptor::new("index", IoType::Literal(LiteralType::Integer)));
                let mut output = IoDescriptor::new("output", IoType::Complex { directory: false });
                output.formats = vec![Format::new("application/x-netcdf").as_default()];
                model.outputs.push(output);
            }
        }
        model
    }

    /// Run over staged inputs. File inputs arrive as local path strings.
    pub async fn run(
        self,
        ctx: &BuiltinContext<'_>,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<BuiltinOutputs> {
        match self {
            Builtin::Echo => run_echo(inputs),
            Builtin::File2StringArray => run_file2string_array(ctx, inputs).await,
            Builtin::FileIndexSelector => run_file_index_selector(ctx, inputs).await,
            Builtin::JsonArray2Netcdf => run_jsonarray2netcdf(ctx, inputs).await,
            Builtin::Metalink2Netcdf => run_metalink2netcdf(ctx, inputs).await,
        }
    }
}

fn required_str<'a>(inputs: &'a BTreeMap<String, Value>, id: &str) -> Result<&'a str> {
    inputs
        .get(id)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::schema(format!("missing or non-string input '{}'", id)))
}

fn required_int(inputs: &BTreeMap<String, Value>, id: &str) -> Result<i64> {
    inputs
        .get(id)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::schema(format!("missing or non-integer input '{}'", id)))
}

/// NetCDF check on the final path segment of a URL or path.
fn requires_netcdf_extension(reference: &str) -> Result<()> {
    let path_part = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    if path_part.to_ascii_lowercase().ends_with(".nc") {
        Ok(())
    } else {
        Err(Error::unprocessable(format!(
            "'{}' does not reference a NetCDF (.nc) file",
            reference
        )))
    }
}

fn run_echo(inputs: &BTreeMap<String, Value>) -> Result<BuiltinOutputs> {
    let message = required_str(inputs, "message")?;
    let mut outputs = BuiltinOutputs::new();
    outputs.insert(
        "echoed".into(),
        vec![Artifact::Literal(Value::String(message.to_string()))],
    );
    Ok(outputs)
}

async fn run_file2string_array(
    ctx: &BuiltinContext<'_>,
    inputs: &BTreeMap<String, Value>,
) -> Result<BuiltinOutputs> {
    let input = required_str(inputs, "input")?;
    let dest = ctx.work_dir.join("output.txt");
    let body = serde_json::to_string(&vec![input])
        .map_err(|e| Error::Internal(anyhow::anyhow!("serialize array: {}", e)))?;
    tokio::fs::write(&dest, body)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("write {}: {}", dest.display(), e)))?;
    let mut outputs = BuiltinOutputs::new();
    outputs.insert(
        "output".into(),
        vec![Artifact::File {
            path: dest,
            media_type: "application/json".into(),
        }],
    );
    Ok(outputs)
}

async fn run_file_index_selector(
    ctx: &BuiltinContext<'_>,
    inputs: &BTreeMap<String, Value>,
) -> Result<BuiltinOutputs> {
    let files = inputs
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::schema("missing or non-array input 'files'"))?;
    let index = required_int(inputs, "index")?;
    let selected = files
        .get(usize::try_from(index).map_err(|_| Error::schema("negative index"))?)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::unprocessable(format!("index {} out of bounds for {} files", index, files.len()))
        })?;
    let source = PathBuf::from(selected);
    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::schema(format!("'{}' has no filename", selected)))?;
    let dest = ctx.work_dir.join(filename);
    if source != dest {
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("copy {}: {}", source.display(), e)))?;
    }
    let media_type = mime_guess::from_path(&dest)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();
    let mut outputs = BuiltinOutputs::new();
    outputs.insert(
        "output".into(),
        vec![Artifact::File {
            path: dest,
            media_type,
        }],
    );
    Ok(outputs)
}

async fn run_jsonarray2netcdf(
    ctx: &BuiltinContext<'_>,
    inputs: &BTreeMap<String, Value>,
) -> Result<BuiltinOutputs> {
    let input = required_str(inputs, "input")?;
    let raw = tokio::fs::read_to_string(input)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("read {}: {}", input, e)))?;
    let references: Vec<String> = serde_json::from_str(&raw)
        .map_err(|e| Error::schema(format!("input is not a JSON string array: {}", e)))?;
    if references.is_empty() {
        return Err(Error::schema("input JSON array is empty"));
    }
    for reference in &references {
        requires_netcdf_extension(reference)?;
    }

    let out_dir = ctx.work_dir.join("output");
    tokio::fs::create_dir_all(&out_dir)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("create {}: {}", out_dir.display(), e)))?;

    let mut artifacts = Vec::with_capacity(references.len());
    for reference in &references {
        let fetched = ctx
            .fetcher
            .fetch(reference, &out_dir, &FetchOptions::default())
            .await?;
        artifacts.push(Artifact::File {
            path: fetched.local_path,
            media_type: "application/x-netcdf".into(),
        });
    }
    let mut outputs = BuiltinOutputs::new();
    outputs.insert("output".into(), artifacts);
    Ok(outputs)
}

async fn run_metalink2netcdf(
    ctx: &BuiltinContext<'_>,
    inputs: &BTreeMap<String, Value>,
) -> Result<BuiltinOutputs> {
    let input = required_str(inputs, "input")?;
    let index = required_int(inputs, "index")?;
    let raw = tokio::fs::read_to_string(input)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("read {}: {}", input, e)))?;
    let files = metalink::parse_metalink(&raw)?;
    // Metalink indices are 1-based
    let entry = usize::try_from(index - 1)
        .ok()
        .and_then(|i| files.get(i))
        .ok_or_else(|| {
            Error::unprocessable(format!(
                "index {} out of bounds for {} metalink entries",
                index,
                files.len()
            ))
        })?;
    let reference = entry
        .urls
        .first()
        .ok_or_else(|| Error::unprocessable(format!("metalink entry '{}' has no URL", entry.name)))?;
    requires_netcdf_extension(reference)?;

    let fetched = ctx
        .fetcher
        .fetch(reference, ctx.work_dir, &FetchOptions::default())
        .await?;
    let mut outputs = BuiltinOutputs::new();
    outputs.insert(
        "output".into(),
        vec![Artifact::File {
            path: fetched.local_path,
            media_type: "application/x-netcdf".into(),
        }],
    );
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, RequestOptions, Settings};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_fetcher(dir: &Path) -> Fetcher {
        Fetcher::new(Arc::new(Settings {
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
            file_allowlist: vec![dir.to_path_buf()],
            cwl_engine: "cwltool".into(),
        }))
    }

    #[test]
    fn registry_models_validate() {
        for builtin in Builtin::ALL {
            let model = builtin.model();
            model.validate().expect(builtin.id());
            assert_eq!(model.kind, ProcessKind::Builtin);
        }
    }

    #[test]
    fn lookup_by_id() {
        assert_eq!(Builtin::by_id("echo"), Some(Builtin::Echo));
        assert_eq!(Builtin::by_id("jsonarray2netcdf"), Some(Builtin::JsonArray2Netcdf));
        assert_eq!(Builtin::by_id("nope"), None);
    }

    #[tokio::test]
    async fn echo_round_trips_message() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path());
        let ctx = BuiltinContext {
            fetcher: &fetcher,
            work_dir: dir.path(),
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("message".to_string(), Value::String("hello".into()));
        let outputs = Builtin::Echo.run(&ctx, &inputs).await.unwrap();
        assert_eq!(
            outputs["echoed"],
            vec![Artifact::Literal(Value::String("hello".into()))]
        );
    }

    #[tokio::test]
    async fn file2string_array_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path());
        let ctx = BuiltinContext {
            fetcher: &fetcher,
            work_dir: dir.path(),
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("input".to_string(), Value::String("/data/file.nc".into()));
        let outputs = Builtin::File2StringArray.run(&ctx, &inputs).await.unwrap();
        let Artifact::File { path, media_type } = &outputs["output"][0] else {
            panic!("expected file artifact");
        };
        assert_eq!(media_type, "application/json");
        let body: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(body, vec!["/data/file.nc"]);
    }

    #[tokio::test]
    async fn jsonarray2netcdf_fetches_each_entry() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        for name in ["a.nc", "b.nc"] {
            Mock::given(method("GET"))
                .and(path(format!("/{}", name)))
                .respond_with(ResponseTemplate::new(200).set_body_string("CDF"))
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let arr = dir.path().join("arr.json");
        std::fs::write(
            &arr,
            serde_json::to_string(&vec![
                format!("{}/a.nc", server.uri()),
                format!("{}/b.nc", server.uri()),
            ])
            .unwrap(),
        )
        .unwrap();

        let fetcher = test_fetcher(dir.path());
        let ctx = BuiltinContext {
            fetcher: &fetcher,
            work_dir: dir.path(),
        };
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "input".to_string(),
            Value::String(arr.display().to_string()),
        );
        let outputs = Builtin::JsonArray2Netcdf.run(&ctx, &inputs).await.unwrap();
        let artifacts = &outputs["output"];
        assert_eq!(artifacts.len(), 2);
        for artifact in artifacts {
            let Artifact::File { path, media_type } = artifact else {
                panic!("expected file artifact");
            };
            assert_eq!(media_type, "application/x-netcdf");
            assert!(path.starts_with(dir.path().join("output")));
        }
    }

    #[tokio::test]
    async fn jsonarray2netcdf_rejects_non_netcdf_urls() {
        let dir = tempfile::tempdir().unwrap();
        let arr = dir.path().join("arr.json");
        std::fs::write(&arr, r#"["https://example.test/evil.sh"]"#).unwrap();

        let fetcher = test_fetcher(dir.path());
        let ctx = BuiltinContext {
            fetcher: &fetcher,
            work_dir: dir.path(),
        };
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "input".to_string(),
            Value::String(arr.display().to_string()),
        );
        let err = Builtin::JsonArray2Netcdf.run(&ctx, &inputs).await.unwrap_err();
        assert_eq!(err.code(), "UNPROCESSABLE");
    }

    #[tokio::test]
    async fn metalink2netcdf_selects_by_one_based_index() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.nc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("CDF"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("files.meta4");
        std::fs::write(
            &meta,
            format!(
                r#"<metalink xmlns="urn:ietf:params:xml:ns:metalink">
                     <file name="a.nc"><url>{0}/a.nc</url></file>
                     <file name="b.nc"><url>{0}/b.nc</url></file>
                   </metalink>"#,
                server.uri()
            ),
        )
        .unwrap();

        let fetcher = test_fetcher(dir.path());
        let ctx = BuiltinContext {
            fetcher: &fetcher,
            work_dir: dir.path(),
        };
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "input".to_string(),
            Value::String(meta.display().to_string()),
        );
        inputs.insert("index".to_string(), Value::from(2));
        let outputs = Builtin::Metalink2Netcdf.run(&ctx, &inputs).await.unwrap();
        let Artifact::File { path, .. } = &outputs["output"][0] else {
            panic!("expected file artifact");
        };
        assert_eq!(path.file_name().unwrap(), "b.nc");
    }
}
