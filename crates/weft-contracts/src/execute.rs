// Execution request DTOs (POST /processes/{id}/execution)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::process::TransmissionMode;

/// Requested execution mode. `Auto` lets the server decide based on the
/// process `jobControlOptions` and Prefer headers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sync,
    Async,
    #[default]
    Auto,
}

/// Requested response form: a results document or the raw output bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResponseForm {
    #[default]
    Document,
    Raw,
}

/// A single submitted input value.
///
/// Accepted shapes, in untagged order: a reference (`{"href": …}`), a
/// qualified value (`{"value": …, "mediaType": …}`), an array of values, or
/// a bare JSON literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(untagged)]
pub enum ExecuteValue {
    Reference {
        href: String,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },
    Qualified {
        value: Value,
        #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    Array(Vec<ExecuteValue>),
    Literal(Value),
}

impl ExecuteValue {
    /// Reference href, if this value is one.
    pub fn href(&self) -> Option<&str> {
        match self {
            ExecuteValue::Reference { href, .. } => Some(href),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ExecuteValue::Array(_))
    }
}

/// Per-output request filter and transmission override.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct OutputRequest {
    #[serde(rename = "transmissionMode", skip_serializing_if = "Option::is_none")]
    pub transmission_mode: Option<TransmissionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
}

/// Requested output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct OutputFormat {
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Callbacks to notify on status changes. Emails are encrypted at rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Subscribers {
    #[serde(rename = "successUri", skip_serializing_if = "Option::is_none")]
    pub success_uri: Option<String>,
    #[serde(rename = "failedUri", skip_serializing_if = "Option::is_none")]
    pub failed_uri: Option<String>,
    #[serde(rename = "inProgressUri", skip_serializing_if = "Option::is_none")]
    pub in_progress_uri: Option<String>,
    #[serde(rename = "successEmail", skip_serializing_if = "Option::is_none")]
    pub success_email: Option<String>,
    #[serde(rename = "failedEmail", skip_serializing_if = "Option::is_none")]
    pub failed_email: Option<String>,
    #[serde(rename = "inProgressEmail", skip_serializing_if = "Option::is_none")]
    pub in_progress_email: Option<String>,
}

impl Subscribers {
    pub fn is_empty(&self) -> bool {
        self.success_uri.is_none()
            && self.failed_uri.is_none()
            && self.in_progress_uri.is_none()
            && self.success_email.is_none()
            && self.failed_email.is_none()
            && self.in_progress_email.is_none()
    }
}

/// Job submission body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: BTreeMap<String, ExecuteValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, OutputRequest>>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub response: ResponseForm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<Subscribers>,
    /// Deprecated; folded into `subscribers` on submission.
    #[serde(rename = "notification_email", skip_serializing_if = "Option::is_none")]
    pub notification_email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// `create` requests an on-trigger job (status `created` until
    /// POST /jobs/{id}/results).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_shapes_parse_in_expected_order() {
        let href: ExecuteValue = serde_json::from_value(
            serde_json::json!({"href": "s3://bucket/key.nc", "type": "application/x-netcdf"}),
        )
        .unwrap();
        assert_eq!(href.href(), Some("s3://bucket/key.nc"));

        let qualified: ExecuteValue =
            serde_json::from_value(serde_json::json!({"value": 42, "mediaType": "text/plain"}))
                .unwrap();
        assert!(matches!(qualified, ExecuteValue::Qualified { .. }));

        let array: ExecuteValue =
            serde_json::from_value(serde_json::json!([{"href": "file:///a"}, {"href": "file:///b"}]))
                .unwrap();
        assert!(array.is_array());

        let literal: ExecuteValue = serde_json::from_value(serde_json::json!("hello")).unwrap();
        assert!(matches!(literal, ExecuteValue::Literal(_)));
    }

    #[test]
    fn execute_request_defaults() {
        let req: ExecuteRequest =
            serde_json::from_value(serde_json::json!({"inputs": {"message": "hello"}})).unwrap();
        assert_eq!(req.mode, ExecutionMode::Auto);
        assert_eq!(req.response, ResponseForm::Document);
        assert!(req.outputs.is_none());
        assert!(req.subscribers.is_none());
    }

    #[test]
    fn subscribers_empty_check() {
        assert!(Subscribers::default().is_empty());
        let subs = Subscribers {
            success_uri: Some("https://example.test/cb".into()),
            ..Default::default()
        };
        assert!(!subs.is_empty());
    }
}
