// Process DTOs (descriptions, deployment payloads, listings)
// Note: the canonical in-memory model lives in weft-core; these types carry
// the wire shape only. Input/output descriptors are rendered by the core and
// travel as JSON values here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::Link;

/// How a job for this process may be controlled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub enum JobControlOption {
    #[serde(rename = "sync-execute")]
    SyncExecute,
    #[serde(rename = "async-execute")]
    AsyncExecute,
    #[serde(rename = "dismiss")]
    Dismiss,
}

/// Whether a result is emitted inline or as a reference link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    #[default]
    Value,
    Reference,
}

/// Process visibility to unauthenticated listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

/// What kind of execution unit backs the process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessKind {
    Application,
    Workflow,
    Builtin,
    #[serde(rename = "wps-1")]
    Wps1,
    OgcApi,
    EsgfCwt,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessKind::Application => "application",
            ProcessKind::Workflow => "workflow",
            ProcessKind::Builtin => "builtin",
            ProcessKind::Wps1 => "wps-1",
            ProcessKind::OgcApi => "ogc-api",
            ProcessKind::EsgfCwt => "esgf-cwt",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application" => Ok(ProcessKind::Application),
            "workflow" => Ok(ProcessKind::Workflow),
            "builtin" => Ok(ProcessKind::Builtin),
            "wps-1" | "wps" => Ok(ProcessKind::Wps1),
            "ogc-api" => Ok(ProcessKind::OgcApi),
            "esgf-cwt" => Ok(ProcessKind::EsgfCwt),
            other => Err(format!("unknown process kind: {}", other)),
        }
    }
}

/// Metadata entry attached to a process: either a typed link or a
/// role/value pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(untagged)]
pub enum Metadata {
    Link {
        href: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rel: Option<String>,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Value {
        role: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        value: Value,
    },
}

/// Short form returned by process listings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProcessSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(rename = "jobControlOptions")]
    pub job_control_options: Vec<JobControlOption>,
    #[serde(rename = "outputTransmission")]
    pub output_transmission: Vec<TransmissionMode>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProcessKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

/// Full process description in the OGC API mapping form.
/// `inputs` and `outputs` are rendered descriptor maps keyed by I/O id.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProcessDescription {
    #[serde(flatten)]
    pub summary: ProcessSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[schema(value_type = Object)]
    pub inputs: serde_json::Map<String, Value>,
    #[schema(value_type = Object)]
    pub outputs: serde_json::Map<String, Value>,
}

/// Process listing response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProcessList {
    pub processes: Vec<ProcessSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// One element of a deploy payload's `executionUnit`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum ExecutionUnitRef {
    /// Reference to a CWL document, remote OGC API process or WPS service.
    Reference {
        href: String,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    /// Inline CWL document (tool or workflow).
    Unit { unit: Value },
    /// Bare inline CWL mapping (legacy shorthand).
    Inline(Value),
}

/// `processDescription` section of a deploy payload. Either nested under
/// a `process` key (legacy) or flattened at the top level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DeployProcessInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(
        rename = "jobControlOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub job_control_options: Option<Vec<JobControlOption>>,
    #[serde(
        rename = "outputTransmission",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_transmission: Option<Vec<TransmissionMode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

/// Deploy request payload (POST /processes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DeployRequest {
    #[serde(rename = "processDescription", skip_serializing_if = "Option::is_none")]
    pub process_description: Option<Value>,
    #[serde(rename = "executionUnit", skip_serializing_if = "Option::is_none")]
    pub execution_unit: Option<Vec<ExecutionUnitRef>>,
    #[serde(rename = "owsContext", skip_serializing_if = "Option::is_none")]
    pub ows_context: Option<Value>,
    #[serde(rename = "deploymentProfileName", skip_serializing_if = "Option::is_none")]
    pub deployment_profile_name: Option<String>,
    /// Direct OGC application package form: a process description with an
    /// inline `process` URL or CWL at the top level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Value>,
}

/// PATCH /processes/{id} payload: documentation metadata and job control
/// options only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateProcessRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<Metadata>>,
    #[serde(
        rename = "jobControlOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub job_control_options: Option<Vec<JobControlOption>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

/// Result of a successful deployment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeploymentResult {
    pub id: String,
    pub version: String,
    #[serde(rename = "revisionId")]
    pub revision_id: Uuid,
    #[serde(rename = "processSummary")]
    pub summary: ProcessSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_control_options_use_kebab_names() {
        let json = serde_json::to_value([
            JobControlOption::SyncExecute,
            JobControlOption::AsyncExecute,
            JobControlOption::Dismiss,
        ])
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!(["sync-execute", "async-execute", "dismiss"])
        );
    }

    #[test]
    fn process_kind_round_trips_through_display() {
        for kind in [
            ProcessKind::Application,
            ProcessKind::Workflow,
            ProcessKind::Builtin,
            ProcessKind::Wps1,
            ProcessKind::OgcApi,
            ProcessKind::EsgfCwt,
        ] {
            let parsed: ProcessKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn execution_unit_accepts_href_and_inline_forms() {
        let href: ExecutionUnitRef =
            serde_json::from_value(serde_json::json!({"href": "https://example.test/pkg.cwl"}))
                .unwrap();
        assert!(matches!(href, ExecutionUnitRef::Reference { .. }));

        let unit: ExecutionUnitRef = serde_json::from_value(
            serde_json::json!({"unit": {"cwlVersion": "v1.2", "class": "CommandLineTool"}}),
        )
        .unwrap();
        assert!(matches!(unit, ExecutionUnitRef::Unit { .. }));

        let inline: ExecutionUnitRef = serde_json::from_value(
            serde_json::json!({"cwlVersion": "v1.2", "class": "CommandLineTool"}),
        )
        .unwrap();
        assert!(matches!(inline, ExecutionUnitRef::Inline(_)));
    }

    #[test]
    fn metadata_distinguishes_links_from_role_values() {
        let link: Metadata = serde_json::from_value(
            serde_json::json!({"href": "https://example.test/doc", "rel": "about"}),
        )
        .unwrap();
        assert!(matches!(link, Metadata::Link { .. }));

        let role: Metadata = serde_json::from_value(
            serde_json::json!({"role": "https://schema.org/author", "value": "weft"}),
        )
        .unwrap();
        assert!(matches!(role, Metadata::Value { .. }));
    }
}
