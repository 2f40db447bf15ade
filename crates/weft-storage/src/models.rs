// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use weft_contracts::{JobKind, JobStatus, LogEntry, ProcessKind};
use weft_core::model::ProcessModel;
use weft_core::package::ExecutionUnit;

// ============================================
// Process models (revisioned)
// ============================================

/// One stored process revision.
#[derive(Debug, Clone, FromRow)]
pub struct ProcessRow {
    pub revision_id: Uuid,
    pub process_id: String,
    pub version: String,
    pub latest: bool,
    pub kind: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub metadata: Value,
    pub inputs: Value,
    pub outputs: Value,
    pub job_control_options: Vec<String>,
    pub output_transmission: Vec<String>,
    pub visibility: String,
    pub execution_unit: Value,
    pub package: Option<Value>,
    pub tombstoned: bool,
    pub created_at: DateTime<Utc>,
}

impl ProcessRow {
    /// Rehydrate the canonical model from this row.
    pub fn to_model(&self) -> anyhow::Result<ProcessModel> {
        let mut model = ProcessModel::new(
            &self.process_id,
            self.kind
                .parse::<ProcessKind>()
                .map_err(|e| anyhow::anyhow!(e))?,
        );
        model.revision_id = self.revision_id;
        model.version = self.version.parse()?;
        model.title = self.title.clone();
        model.description = self.description.clone();
        model.keywords = self.keywords.clone();
        model.metadata = serde_json::from_value(self.metadata.clone())?;
        model.inputs = serde_json::from_value(self.inputs.clone())?;
        model.outputs = serde_json::from_value(self.outputs.clone())?;
        model.job_control_options = self
            .job_control_options
            .iter()
            .map(|o| serde_json::from_value(Value::String(o.clone())))
            .collect::<Result<_, _>>()?;
        model.output_transmission = self
            .output_transmission
            .iter()
            .map(|o| serde_json::from_value(Value::String(o.clone())))
            .collect::<Result<_, _>>()?;
        model.visibility = serde_json::from_value(Value::String(self.visibility.clone()))?;
        Ok(model)
    }

    /// Stored execution unit.
    pub fn execution_unit(&self) -> anyhow::Result<ExecutionUnit> {
        let unit = self
            .execution_unit
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("execution unit must be an object"))?;
        if let Some(cwl) = unit.get("cwl") {
            return Ok(ExecutionUnit::Cwl(cwl.clone()));
        }
        if let Some(href) = unit.get("cwlRef").and_then(Value::as_str) {
            return Ok(ExecutionUnit::CwlRef(href.to_string()));
        }
        if let Some(href) = unit.get("ogcApi").and_then(Value::as_str) {
            return Ok(ExecutionUnit::OgcApi(href.to_string()));
        }
        if let Some(href) = unit.get("wps").and_then(Value::as_str) {
            return Ok(ExecutionUnit::Wps(href.to_string()));
        }
        Err(anyhow::anyhow!("unknown execution unit shape"))
    }
}

/// Input for storing a new process revision.
#[derive(Debug, Clone)]
pub struct CreateProcess {
    pub model: ProcessModel,
    pub execution_unit: ExecutionUnit,
    /// Sanitised CWL document for local execution.
    pub package: Option<Value>,
}

impl CreateProcess {
    pub fn execution_unit_value(&self) -> Value {
        match &self.execution_unit {
            ExecutionUnit::Cwl(doc) => serde_json::json!({ "cwl": doc }),
            ExecutionUnit::CwlRef(href) => serde_json::json!({ "cwlRef": href }),
            ExecutionUnit::OgcApi(href) => serde_json::json!({ "ogcApi": href }),
            ExecutionUnit::Wps(href) => serde_json::json!({ "wps": href }),
        }
    }
}

/// PATCH-style revision input: documentation metadata and job control only.
#[derive(Debug, Clone, Default)]
pub struct ReviseProcess {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub metadata: Option<Value>,
    pub job_control_options: Option<Vec<String>>,
    pub visibility: Option<String>,
}

/// Filters for process listings.
#[derive(Debug, Clone, Default)]
pub struct ProcessQuery {
    pub limit: i64,
    pub page: i64,
    /// Include historical revisions, not just the latest.
    pub revisions: bool,
    pub version: Option<String>,
    pub sort: Option<String>,
    pub public_only: bool,
}

// ============================================
// Job models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub process_id: String,
    pub process_version: Option<String>,
    pub provider_id: Option<String>,
    pub kind: String,
    pub status: String,
    pub progress: i32,
    pub message: Option<String>,
    pub inputs: Value,
    pub outputs_request: Option<Value>,
    pub results: Option<Value>,
    pub exceptions: Value,
    pub logs: Value,
    pub statistics: Option<Value>,
    pub subscribers_encrypted: Option<Vec<u8>>,
    pub auth_encrypted: Option<Vec<u8>>,
    pub execution_mode: String,
    pub response_form: String,
    pub output_context: Option<String>,
    pub tags: Vec<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Accepted)
    }

    /// Status document rendering under the given profile.
    pub fn to_status_info(&self, profile: weft_contracts::StatusProfile) -> weft_contracts::StatusInfo {
        weft_contracts::StatusInfo {
            job_id: self.id,
            process_id: Some(match &self.process_version {
                Some(version) => format!("{}:{}", self.process_id, version),
                None => self.process_id.clone(),
            }),
            provider_id: self.provider_id.clone(),
            kind: self.kind(),
            status: self.status().external_name(profile).to_string(),
            message: self.message.clone(),
            created: self.created_at,
            started: self.started_at,
            finished: self.finished_at,
            updated: self.updated_at,
            progress: self.progress.clamp(0, 100) as u8,
            tags: self.tags.clone(),
            links: Vec::new(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind.parse().unwrap_or(JobKind::Process)
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        serde_json::from_value(self.logs.clone()).unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct CreateJob {
    pub id: Uuid,
    pub process_id: String,
    pub process_version: Option<String>,
    pub provider_id: Option<String>,
    pub kind: JobKind,
    /// `created` for on-trigger jobs, `accepted` otherwise.
    pub status: JobStatus,
    pub inputs: Value,
    pub outputs_request: Option<Value>,
    pub subscribers_encrypted: Option<Vec<u8>>,
    pub auth_encrypted: Option<Vec<u8>>,
    pub execution_mode: String,
    pub response_form: String,
    pub output_context: Option<String>,
    pub tags: Vec<String>,
}

/// Compare-and-set update on a job row. `expected_updated_at` guards
/// against lost updates from parallel writers.
#[derive(Debug, Clone, Default)]
pub struct UpdateJob {
    pub status: Option<JobStatus>,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub results: Option<Value>,
    pub statistics: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: Option<bool>,
    pub inputs: Option<Value>,
    pub outputs_request: Option<Value>,
    pub subscribers_encrypted: Option<Vec<u8>>,
    pub tags: Option<Vec<String>>,
}

/// Filters for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<String>,
    pub process_id: Option<String>,
    pub provider_id: Option<String>,
    pub kind: Option<String>,
    pub tags: Vec<String>,
    pub min_duration_secs: Option<i64>,
    pub max_duration_secs: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort: Option<String>,
    pub limit: i64,
    pub page: i64,
}

// ============================================
// Provider models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ProviderRow {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub public: bool,
    pub kind: String,
    pub credentials: Option<String>,
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateProvider {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub public: bool,
    pub kind: String,
    pub credentials: Option<String>,
    pub diagnostic: Option<String>,
}

// ============================================
// Vault models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct VaultRow {
    pub id: Uuid,
    pub file_path: String,
    pub media_type: String,
    pub filename: String,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}
