// Job DTOs (status documents, logs, statistics, results)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::Link;
use crate::process::TransmissionMode;

/// Job lifecycle status.
///
/// `Created` is only reachable for on-trigger jobs (submitted with
/// `status: create`); every other job starts at `Accepted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Accepted,
    Started,
    Running,
    Successful,
    Failed,
    Dismissed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Dismissed
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Accepted)
                | (Created, Dismissed)
                | (Accepted, Started)
                | (Accepted, Dismissed)
                | (Started, Running)
                | (Started, Dismissed)
                | (Running, Successful)
                | (Running, Failed)
                | (Running, Dismissed)
        )
    }

    /// External name under the given profile. The public profile collapses
    /// `started` into `running` and uses `successful`; the wps/openEO
    /// profile keeps the legacy `succeeded` and exposes `started`.
    pub fn external_name(self, profile: StatusProfile) -> &'static str {
        match (self, profile) {
            (JobStatus::Successful, StatusProfile::Wps | StatusProfile::OpenEo) => "succeeded",
            (JobStatus::Started, StatusProfile::Ogc | StatusProfile::OpenEo) => "running",
            (JobStatus::Created, _) => "created",
            (JobStatus::Accepted, _) => "accepted",
            (JobStatus::Started, _) => "started",
            (JobStatus::Running, _) => "running",
            (JobStatus::Successful, _) => "successful",
            (JobStatus::Failed, _) => "failed",
            (JobStatus::Dismissed, _) => "dismissed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.external_name(StatusProfile::Internal))
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "accepted" => Ok(JobStatus::Accepted),
            "started" => Ok(JobStatus::Started),
            "running" => Ok(JobStatus::Running),
            "successful" | "succeeded" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "dismissed" => Ok(JobStatus::Dismissed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Status rendering profile selected by `profile=` or `Accept` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusProfile {
    /// OGC API - Processes public names.
    #[default]
    Ogc,
    /// Legacy WPS names (succeeded, exposes started).
    Wps,
    /// openEO names (succeeded, collapses started).
    OpenEo,
    /// Internal names, used for persistence.
    Internal,
}

/// What the job executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    Process,
    Provider,
    Workflow,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Process => write!(f, "process"),
            JobKind::Provider => write!(f, "provider"),
            JobKind::Workflow => write!(f, "workflow"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(JobKind::Process),
            "provider" => Ok(JobKind::Provider),
            "workflow" => Ok(JobKind::Workflow),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// OGC status document (GET /jobs/{id}).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusInfo {
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    #[serde(rename = "processID", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

/// Job listing response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobList {
    pub jobs: Vec<StatusInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Single log entry. Messages are capped at persistence time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Exception recorded against a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobException {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    pub text: String,
}

/// Statistics captured when a job terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct JobStatistics {
    #[serde(rename = "durationSeconds", skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(rename = "stepDurations", default, skip_serializing_if = "Vec::is_empty")]
    pub step_durations: Vec<StepDuration>,
    #[serde(rename = "peakMemoryBytes", skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
    #[serde(rename = "outputsSizeBytes", skip_serializing_if = "Option::is_none")]
    pub outputs_size_bytes: Option<u64>,
}

/// Wall-clock duration of a single workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StepDuration {
    pub step: String,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: f64,
}

/// One entry of the results document: inline value or reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(untagged)]
pub enum ResultValue {
    Reference {
        href: String,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    Inline {
        value: Value,
        #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl ResultValue {
    pub fn transmission(&self) -> TransmissionMode {
        match self {
            ResultValue::Reference { .. } => TransmissionMode::Reference,
            ResultValue::Inline { .. } => TransmissionMode::Value,
        }
    }
}

/// PATCH /jobs/{id} payload for on-trigger jobs. Only these four fields are
/// mutable while the job is in `created`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateJobRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// DELETE /jobs body for batch dismissal.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchDismissRequest {
    pub jobs: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Successful.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Dismissed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Accepted.is_terminal());
    }

    #[test]
    fn legal_transition_chain() {
        let chain = [
            JobStatus::Accepted,
            JobStatus::Started,
            JobStatus::Running,
            JobStatus::Successful,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(!JobStatus::Accepted.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Successful.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Dismissed.can_transition_to(JobStatus::Accepted));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Accepted));
    }

    #[test]
    fn dismiss_reachable_from_every_live_state() {
        for status in [
            JobStatus::Created,
            JobStatus::Accepted,
            JobStatus::Started,
            JobStatus::Running,
        ] {
            assert!(status.can_transition_to(JobStatus::Dismissed));
        }
    }

    #[test]
    fn succeeded_is_a_parse_synonym() {
        assert_eq!(
            "succeeded".parse::<JobStatus>().unwrap(),
            JobStatus::Successful
        );
    }

    #[test]
    fn profile_names() {
        assert_eq!(
            JobStatus::Successful.external_name(StatusProfile::Ogc),
            "successful"
        );
        assert_eq!(
            JobStatus::Successful.external_name(StatusProfile::Wps),
            "succeeded"
        );
        // started is only externalised under the wps profile
        assert_eq!(
            JobStatus::Started.external_name(StatusProfile::Ogc),
            "running"
        );
        assert_eq!(
            JobStatus::Started.external_name(StatusProfile::Wps),
            "started"
        );
    }

    #[test]
    fn result_value_shapes() {
        let r: ResultValue = serde_json::from_value(
            serde_json::json!({"href": "https://example.test/out.nc", "type": "application/x-netcdf"}),
        )
        .unwrap();
        assert_eq!(r.transmission(), TransmissionMode::Reference);

        let v: ResultValue = serde_json::from_value(serde_json::json!({"value": "hello"})).unwrap();
        assert_eq!(v.transmission(), TransmissionMode::Value);
    }
}
