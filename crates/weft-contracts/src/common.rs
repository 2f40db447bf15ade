// Common DTOs shared across API endpoints

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Typed link as used by landing pages, process descriptions and job status
/// documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Link {
    pub href: String,
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hreflang: Option<String>,
}

impl Link {
    pub fn new(href: impl Into<String>, rel: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            rel: rel.into(),
            media_type: None,
            title: None,
            hreflang: None,
        }
    }

    pub fn with_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Error body returned on every non-2xx response.
/// Shape follows RFC 7807 with a stable machine-readable `code`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Stable error code, e.g. "SCHEMA_INVALID" or "REF_UNREACHABLE".
    pub code: String,
    /// HTTP status code.
    pub status: u16,
    /// Short human-readable summary.
    pub title: String,
    /// Longer description of what went wrong.
    pub description: String,
    /// Underlying cause, when one exists and is safe to expose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Landing page document.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LandingPage {
    pub title: String,
    pub description: String,
    pub links: Vec<Link>,
}

/// Conformance class listing.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conformance {
    #[serde(rename = "conformsTo")]
    pub conforms_to: Vec<String>,
}

/// Pagination metadata attached to list responses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Paging {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_builder_sets_fields() {
        let link = Link::new("https://example.test/jobs/1", "monitor")
            .with_type("application/json")
            .with_title("job status");
        assert_eq!(link.rel, "monitor");
        assert_eq!(link.media_type.as_deref(), Some("application/json"));
        assert_eq!(link.title.as_deref(), Some("job status"));
    }

    #[test]
    fn error_body_omits_absent_cause() {
        let body = ErrorBody {
            code: "NOT_FOUND".into(),
            status: 404,
            title: "Not found".into(),
            description: "no such process".into(),
            cause: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("cause").is_none());
        assert_eq!(json["code"], "NOT_FOUND");
    }
}
