// CWL application package handling: loading (JSON or YAML, single-element
// $graph), requirement classification for the step dispatcher, reserved
// namespace enforcement, and the synthesised descriptor sources used by the
// merger.

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::model::{cwl_io, IoDescriptor, IoType, LiteralType};

/// Namespaces with reserved meaning inside requirement/hint classes.
pub const RESERVED_NAMESPACES: &[&str] = &["cwltool:", "weft:", "s:", "schema.org"];

/// Requirement classes the engine executes natively; anything else is moved
/// to hints so the engine does not reject the package.
const NATIVE_REQUIREMENTS: &[&str] = &[
    "DockerRequirement",
    "InlineJavascriptRequirement",
    "InitialWorkDirRequirement",
    "NetworkAccess",
    "ResourceRequirement",
    "ScatterFeatureRequirement",
    "SubworkflowFeatureRequirement",
    "MultipleInputFeatureRequirement",
    "StepInputExpressionRequirement",
    "EnvVarRequirement",
    "ShellCommandRequirement",
    "cwltool:CUDARequirement",
    "cwltool:Secrets",
];

/// The execution source resolved for a process.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionUnit {
    /// Inline CWL document (tool or workflow).
    Cwl(Value),
    /// URL of a CWL document.
    CwlRef(String),
    /// URL of a remote OGC API process.
    OgcApi(String),
    /// URL of a remote WPS 1.0/2.0 service (GetCapabilities or
    /// DescribeProcess).
    Wps(String),
}

/// Dispatch requirement of a step or tool.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRequirement {
    /// Plain container execution under the local engine.
    Docker { image: Option<String> },
    /// Local engine with GPU enablement.
    Cuda,
    /// Remote WPS 1.0/2.0 process.
    Wps1 { provider: String, process: String },
    /// Remote OGC API process.
    OgcApi { process_url: String },
    /// ESGF compute service (WPS dialect with API key auth).
    EsgfCwt { provider: String, process: String },
    /// In-process implementation.
    Builtin { process: String },
}

impl StepRequirement {
    fn from_class(class: &str, body: &Value) -> Option<StepRequirement> {
        match class {
            "DockerRequirement" => Some(StepRequirement::Docker {
                image: body
                    .get("dockerPull")
                    .and_then(Value::as_str)
                    .map(String::from),
            }),
            "cwltool:CUDARequirement" => Some(StepRequirement::Cuda),
            "weft:WPS1Requirement" => Some(StepRequirement::Wps1 {
                provider: body
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                process: body
                    .get("process")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "weft:OGCAPIRequirement" => Some(StepRequirement::OgcApi {
                process_url: body
                    .get("process")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "weft:ESGF-CWTRequirement" => Some(StepRequirement::EsgfCwt {
                provider: body
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                process: body
                    .get("process")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "weft:BuiltinRequirement" => Some(StepRequirement::Builtin {
                process: body
                    .get("process")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => None,
        }
    }

    /// Whether this requirement is executed by the local engine rather than
    /// dispatched to a remote runner.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            StepRequirement::Docker { .. } | StepRequirement::Cuda | StepRequirement::Builtin { .. }
        )
    }
}

/// One step of a CWL workflow.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: String,
    /// Embedded run document or a `#fragment` / URL reference.
    pub run: Value,
    pub requirement: StepRequirement,
}

/// A loaded CWL document.
#[derive(Debug, Clone)]
pub struct Package {
    pub document: Value,
}

impl Package {
    /// Load from raw text, accepting JSON first and YAML otherwise.
    pub fn from_text(raw: &str) -> Result<Package> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => serde_yaml::from_str(raw)
                .map_err(|e| Error::schema(format!("CWL is neither JSON nor YAML: {}", e)))?,
        };
        Self::from_value(value)
    }

    /// Wrap a parsed document, unwrapping a single-element `$graph`.
    pub fn from_value(mut value: Value) -> Result<Package> {
        if let Some(graph) = value.get("$graph") {
            let graph = graph
                .as_array()
                .ok_or_else(|| Error::schema("$graph must be a list"))?;
            match graph.len() {
                1 => value = graph[0].clone(),
                n => {
                    return Err(Error::schema(format!(
                        "$graph with {} elements; only single-element graphs are supported",
                        n
                    )))
                }
            }
        }
        if !value.is_object() {
            return Err(Error::schema("CWL document must be a mapping"));
        }
        let package = Package { document: value };
        if package.class().is_none() {
            return Err(Error::schema("CWL document without class"));
        }
        Ok(package)
    }

    pub fn class(&self) -> Option<&str> {
        self.document.get("class").and_then(Value::as_str)
    }

    pub fn is_workflow(&self) -> bool {
        self.class() == Some("Workflow")
    }

    pub fn id(&self) -> Option<&str> {
        self.document
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id.trim_start_matches('#'))
            .map(|id| id.rsplit('/').next().unwrap_or(id))
    }

    pub fn inputs(&self) -> Result<Vec<IoDescriptor>> {
        cwl_io::parse_io_section(
            self.document.get("inputs").unwrap_or(&Value::Null),
            false,
        )
    }

    pub fn outputs(&self) -> Result<Vec<IoDescriptor>> {
        cwl_io::parse_io_section(
            self.document.get("outputs").unwrap_or(&Value::Null),
            true,
        )
    }

    /// Glob pattern declared for an output, when present.
    pub fn output_glob(&self, output_id: &str) -> Option<String> {
        let outputs = self.document.get("outputs")?;
        let entry = match outputs {
            Value::Object(map) => map.get(output_id),
            Value::Array(list) => list.iter().find(|e| {
                e.get("id")
                    .and_then(Value::as_str)
                    .map(|id| id.rsplit('/').next().unwrap_or(id) == output_id)
                    .unwrap_or(false)
            }),
            _ => None,
        }?;
        entry
            .get("outputBinding")
            .and_then(|b| b.get("glob"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn requirement_entries(section: Option<&Value>) -> Vec<(String, Value)> {
        let mut entries = Vec::new();
        match section {
            Some(Value::Object(map)) => {
                for (class, body) in map {
                    entries.push((class.clone(), body.clone()));
                }
            }
            Some(Value::Array(list)) => {
                for entry in list {
                    if let Some(class) = entry.get("class").and_then(Value::as_str) {
                        entries.push((class.to_string(), entry.clone()));
                    }
                }
            }
            _ => {}
        }
        entries
    }

    /// All requirement and hint classes of the root document.
    pub fn requirements(&self) -> Vec<(String, Value)> {
        let mut entries = Self::requirement_entries(self.document.get("requirements"));
        entries.extend(Self::requirement_entries(self.document.get("hints")));
        entries
    }

    /// Dispatch requirement of the root document. Defaults to plain Docker
    /// execution when nothing more specific is declared.
    pub fn dispatch_requirement(&self) -> StepRequirement {
        for (class, body) in self.requirements() {
            if let Some(req) = StepRequirement::from_class(&class, &body) {
                if !matches!(req, StepRequirement::Docker { .. }) {
                    return req;
                }
            }
        }
        for (class, body) in self.requirements() {
            if let Some(req) = StepRequirement::from_class(&class, &body) {
                return req;
            }
        }
        StepRequirement::Docker { image: None }
    }

    /// Workflow steps with their resolved dispatch requirements.
    pub fn steps(&self) -> Result<Vec<WorkflowStep>> {
        let Some(steps) = self.document.get("steps") else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut push = |id: &str, body: &Value| -> Result<()> {
            let run = body.get("run").cloned().unwrap_or(Value::Null);
            let requirement = match &run {
                Value::Object(_) => Package::from_value(run.clone())?.dispatch_requirement(),
                _ => {
                    // reference runs inherit step-level requirements
                    let entries = Self::requirement_entries(body.get("requirements"))
                        .into_iter()
                        .chain(Self::requirement_entries(body.get("hints")));
                    entries
                        .filter_map(|(class, body)| StepRequirement::from_class(&class, &body))
                        .next()
                        .unwrap_or(StepRequirement::Docker { image: None })
                }
            };
            out.push(WorkflowStep {
                id: id.rsplit('/').next().unwrap_or(id).to_string(),
                run,
                requirement,
            });
            Ok(())
        };
        match steps {
            Value::Object(map) => {
                for (id, body) in map {
                    push(id, body)?;
                }
            }
            Value::Array(list) => {
                for body in list {
                    let id = body
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::schema("workflow step without id"))?;
                    push(id, body)?;
                }
            }
            _ => return Err(Error::schema("steps must be a mapping or list")),
        }
        Ok(out)
    }

    /// Enforce reserved namespaces and relocate unrecognised requirement
    /// classes to hints. Returns the sanitised package.
    pub fn sanitise(mut self) -> Result<Package> {
        let doc = self
            .document
            .as_object_mut()
            .expect("document checked at load");

        // $namespaces must not rebind the reserved prefixes
        if let Some(Value::Object(namespaces)) = doc.get("$namespaces") {
            for (prefix, uri) in namespaces {
                let uri = uri.as_str().unwrap_or_default();
                if prefix == "cwltool" && !uri.contains("commonwl.org") {
                    return Err(Error::schema(format!(
                        "namespace '{}' rebinds a reserved prefix to {}",
                        prefix, uri
                    )));
                }
                if prefix == "s" && !uri.contains("schema.org") {
                    return Err(Error::schema(format!(
                        "namespace '{}' rebinds a reserved prefix to {}",
                        prefix, uri
                    )));
                }
            }
        }

        let requirements = Self::requirement_entries(doc.get("requirements"));
        let mut kept = Map::new();
        let mut moved = Map::new();
        for (class, body) in requirements {
            let body = if body.get("class").is_some() {
                let mut body = body.clone();
                body.as_object_mut().map(|o| o.remove("class"));
                body
            } else {
                body
            };
            let recognised = NATIVE_REQUIREMENTS.contains(&class.as_str())
                || StepRequirement::from_class(&class, &body).is_some();
            if recognised {
                kept.insert(class, body);
            } else {
                moved.insert(class, body);
            }
        }
        if !moved.is_empty() {
            let hints = doc
                .entry("hints")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(hints) = hints.as_object_mut() {
                for (class, body) in moved {
                    hints.entry(class).or_insert(body);
                }
            }
        }
        if kept.is_empty() {
            doc.remove("requirements");
        } else {
            doc.insert("requirements".into(), Value::Object(kept));
        }
        Ok(self)
    }

    /// Inject JavaScript guards for non-string literal inputs constrained by
    /// allowed values, which the native CWL type system cannot express.
    /// Requires InlineJavascriptRequirement on the document.
    pub fn inject_value_guards(mut self, inputs: &[IoDescriptor]) -> Package {
        let mut guards: Vec<(String, String)> = Vec::new();
        for input in inputs {
            let IoType::Literal(lit) = input.io_type else {
                continue;
            };
            if lit == LiteralType::String {
                continue;
            }
            let allowed: Vec<&Value> = input
                .domains
                .iter()
                .flat_map(|d| d.allowed_values.iter())
                .collect();
            if allowed.is_empty() {
                continue;
            }
            let list = serde_json::to_string(&allowed).expect("values serialize");
            guards.push((
                input.id.clone(),
                format!(
                    "${{ if (self !== null && {}.indexOf(self) < 0) {{ throw 'value of {} not in allowed set'; }} return self; }}",
                    list, input.id
                ),
            ));
        }
        if guards.is_empty() {
            return self;
        }

        let doc = self
            .document
            .as_object_mut()
            .expect("document checked at load");
        let requirements = doc
            .entry("requirements")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(reqs) = requirements.as_object_mut() {
            reqs.entry("InlineJavascriptRequirement".to_string())
                .or_insert(json!({}));
        }
        if let Some(Value::Object(inputs_map)) = doc.get_mut("inputs") {
            for (id, guard) in guards {
                if let Some(entry) = inputs_map.get_mut(&id) {
                    if let Some(obj) = entry.as_object_mut() {
                        obj.insert("inputBinding".into(), json!({ "valueFrom": guard }));
                    }
                }
            }
        }
        self
    }

    /// Synthesised process-level metadata when no WPS source exists.
    pub fn metadata(&self) -> (Option<String>, Option<String>) {
        let title = self
            .document
            .get("label")
            .and_then(Value::as_str)
            .map(String::from);
        let description = self
            .document
            .get("doc")
            .and_then(Value::as_str)
            .map(String::from);
        (title, description)
    }
}

/// Pick the execution source from a deploy payload by precedence:
/// inline CWL > referenced CWL > remote OGC API > remote WPS.
pub fn resolve_execution_unit(
    units: &[weft_contracts::ExecutionUnitRef],
    ows_context_href: Option<&str>,
) -> Result<ExecutionUnit> {
    use weft_contracts::ExecutionUnitRef;
    if units.len() > 1 {
        return Err(Error::schema(
            "executionUnit lists with more than one element are not supported",
        ));
    }
    if let Some(unit) = units.first() {
        return match unit {
            ExecutionUnitRef::Unit { unit } => Ok(ExecutionUnit::Cwl(unit.clone())),
            ExecutionUnitRef::Inline(value) => {
                if value.get("class").is_some() || value.get("$graph").is_some() {
                    Ok(ExecutionUnit::Cwl(value.clone()))
                } else {
                    Err(Error::schema("inline execution unit is not a CWL document"))
                }
            }
            ExecutionUnitRef::Reference { href, media_type } => {
                Ok(classify_reference(href, media_type.as_deref()))
            }
        };
    }
    if let Some(href) = ows_context_href {
        return Ok(classify_reference(href, None));
    }
    Err(Error::schema("deploy payload carries no execution unit"))
}

/// Classify a reference URL by media type hints, extension, and WPS markers.
pub fn classify_reference(href: &str, media_type: Option<&str>) -> ExecutionUnit {
    let lowered = href.to_ascii_lowercase();
    if let Some(media_type) = media_type {
        let media_type = media_type.to_ascii_lowercase();
        if media_type.contains("cwl") || media_type.contains("yaml") {
            return ExecutionUnit::CwlRef(href.to_string());
        }
        if media_type.contains("xml") {
            return ExecutionUnit::Wps(href.to_string());
        }
    }
    if lowered.ends_with(".cwl") || lowered.ends_with(".yml") || lowered.ends_with(".yaml") {
        return ExecutionUnit::CwlRef(href.to_string());
    }
    if lowered.contains("service=wps") || lowered.contains("/wps") {
        return ExecutionUnit::Wps(href.to_string());
    }
    ExecutionUnit::OgcApi(href.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_contracts::ExecutionUnitRef;

    const TOOL_YAML: &str = r#"
cwlVersion: v1.2
class: CommandLineTool
id: echo
label: Echo
doc: Echoes its message input.
baseCommand: echo
requirements:
  DockerRequirement:
    dockerPull: debian:stable-slim
inputs:
  message:
    type: string
    inputBinding:
      position: 1
outputs:
  echoed:
    type: stdout
"#;

    #[test]
    fn loads_yaml_and_json() {
        let from_yaml = Package::from_text("cwlVersion: v1.2\nclass: CommandLineTool\ninputs: {}\noutputs: {}\n").unwrap();
        assert_eq!(from_yaml.class(), Some("CommandLineTool"));

        let from_json =
            Package::from_text(r#"{"cwlVersion": "v1.2", "class": "Workflow"}"#).unwrap();
        assert!(from_json.is_workflow());
    }

    #[test]
    fn single_element_graph_unwraps() {
        let package = Package::from_text(
            r##"{"$graph": [{"class": "CommandLineTool", "id": "#main"}]}"##,
        )
        .unwrap();
        assert_eq!(package.class(), Some("CommandLineTool"));
        assert_eq!(package.id(), Some("main"));
    }

    #[test]
    fn multi_element_graph_rejected() {
        let err = Package::from_text(
            r#"{"$graph": [{"class": "Workflow"}, {"class": "CommandLineTool"}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn docker_requirement_detected() {
        let package = Package::from_text(TOOL_YAML).unwrap();
        assert_eq!(
            package.dispatch_requirement(),
            StepRequirement::Docker {
                image: Some("debian:stable-slim".into())
            }
        );
    }

    #[test]
    fn weft_requirements_win_over_docker() {
        let package = Package::from_text(
            r#"{"class": "CommandLineTool",
                "hints": {
                  "DockerRequirement": {"dockerPull": "debian"},
                  "weft:WPS1Requirement": {"provider": "https://wps.example.test", "process": "subset"}
                }}"#,
        )
        .unwrap();
        assert_eq!(
            package.dispatch_requirement(),
            StepRequirement::Wps1 {
                provider: "https://wps.example.test".into(),
                process: "subset".into()
            }
        );
    }

    #[test]
    fn unrecognised_requirements_move_to_hints() {
        let package = Package::from_text(
            r#"{"class": "CommandLineTool",
                "requirements": {
                  "DockerRequirement": {"dockerPull": "debian"},
                  "VendorSpecialRequirement": {"x": 1}
                }}"#,
        )
        .unwrap()
        .sanitise()
        .unwrap();
        let doc = &package.document;
        assert!(doc["requirements"].get("DockerRequirement").is_some());
        assert!(doc["requirements"].get("VendorSpecialRequirement").is_none());
        assert!(doc["hints"].get("VendorSpecialRequirement").is_some());
    }

    #[test]
    fn reserved_namespace_rebind_rejected() {
        let err = Package::from_text(
            r#"{"class": "CommandLineTool", "$namespaces": {"s": "https://evil.example.test/"}}"#,
        )
        .unwrap()
        .sanitise();
        assert!(err.is_err());
    }

    #[test]
    fn value_guard_injection_adds_js_requirement() {
        let mut inputs = cwl_io::parse_io_section(
            &serde_json::json!({"level": {"type": "int"}}),
            false,
        )
        .unwrap();
        inputs[0].domains.push(crate::model::LiteralDomain {
            allowed_values: vec![serde_json::json!(1), serde_json::json!(2)],
            ..Default::default()
        });
        let package = Package::from_text(
            r#"{"class": "CommandLineTool", "inputs": {"level": {"type": "int"}}, "outputs": {}}"#,
        )
        .unwrap()
        .inject_value_guards(&inputs);
        assert!(package.document["requirements"]
            .get("InlineJavascriptRequirement")
            .is_some());
        let guard = package.document["inputs"]["level"]["inputBinding"]["valueFrom"]
            .as_str()
            .unwrap();
        assert!(guard.contains("indexOf"));
    }

    #[test]
    fn string_inputs_never_get_guards() {
        let inputs = cwl_io::parse_io_section(
            &serde_json::json!({"name": {"type": "string"}}),
            false,
        )
        .unwrap();
        let package = Package::from_text(
            r#"{"class": "CommandLineTool", "inputs": {"name": {"type": "string"}}, "outputs": {}}"#,
        )
        .unwrap()
        .inject_value_guards(&inputs);
        assert!(package.document.get("requirements").is_none());
    }

    #[test]
    fn execution_unit_precedence() {
        let inline = vec![ExecutionUnitRef::Unit {
            unit: serde_json::json!({"class": "CommandLineTool"}),
        }];
        assert!(matches!(
            resolve_execution_unit(&inline, None).unwrap(),
            ExecutionUnit::Cwl(_)
        ));

        let reference = vec![ExecutionUnitRef::Reference {
            href: "https://example.test/pkg.cwl".into(),
            media_type: None,
        }];
        assert_eq!(
            resolve_execution_unit(&reference, None).unwrap(),
            ExecutionUnit::CwlRef("https://example.test/pkg.cwl".into())
        );

        assert_eq!(
            resolve_execution_unit(&[], Some("https://example.test/wps?service=WPS&request=DescribeProcess")).unwrap(),
            ExecutionUnit::Wps("https://example.test/wps?service=WPS&request=DescribeProcess".into())
        );
    }

    #[test]
    fn two_execution_units_rejected() {
        let units = vec![
            ExecutionUnitRef::Reference {
                href: "https://example.test/a.cwl".into(),
                media_type: None,
            },
            ExecutionUnitRef::Reference {
                href: "https://example.test/b.cwl".into(),
                media_type: None,
            },
        ];
        assert!(resolve_execution_unit(&units, None).is_err());
    }

    #[test]
    fn reference_classification() {
        assert_eq!(
            classify_reference("https://example.test/processes/subset", None),
            ExecutionUnit::OgcApi("https://example.test/processes/subset".into())
        );
        assert_eq!(
            classify_reference("https://example.test/ows?service=WPS&request=GetCapabilities", None),
            ExecutionUnit::Wps("https://example.test/ows?service=WPS&request=GetCapabilities".into())
        );
        assert_eq!(
            classify_reference("https://example.test/pkg", Some("application/cwl+yaml")),
            ExecutionUnit::CwlRef("https://example.test/pkg".into())
        );
    }

    #[test]
    fn workflow_steps_classify_runners() {
        let package = Package::from_text(
            r##"{"class": "Workflow",
                "steps": {
                  "local": {"run": {"class": "CommandLineTool", "requirements": {"DockerRequirement": {"dockerPull": "debian"}}}},
                  "remote": {"run": "#remote.cwl", "hints": {"weft:WPS1Requirement": {"provider": "https://wps.example.test", "process": "b"}}}
                }}"##,
        )
        .unwrap();
        let steps = package.steps().unwrap();
        assert_eq!(steps.len(), 2);
        let local = steps.iter().find(|s| s.id == "local").unwrap();
        assert!(local.requirement.is_local());
        let remote = steps.iter().find(|s| s.id == "remote").unwrap();
        assert!(!remote.requirement.is_local());
    }
}
