// Shared API plumbing: error responses and Prefer header resolution.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use weft_contracts::ErrorBody;
use weft_core::error::Error;

/// API-facing error: wraps the core taxonomy and renders the RFC-7807-ish
/// body with the stable `code` field.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError(Error::NotFound(msg.into()))
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        ApiError(Error::SchemaInvalid(msg.into()))
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        ApiError(Error::Gone(msg.into()))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError(Error::Internal(anyhow::anyhow!("{}", err)))
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(Error::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.code().to_string(),
            status: status.as_u16(),
            title: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            description: self.0.to_string(),
            cause: None,
        };
        (status, Json(body)).into_response()
    }
}

/// Resolution of the Prefer request header (RFC 7240 subset).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    pub respond_async: bool,
    pub wait: Option<u64>,
    pub minimal: bool,
}

pub fn parse_prefer(headers: &HeaderMap) -> Preferences {
    let mut preferences = Preferences::default();
    for value in headers.get_all("prefer") {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(&[',', ';'][..]) {
            let token = token.trim();
            if token.eq_ignore_ascii_case("respond-async") {
                preferences.respond_async = true;
            } else if let Some(wait) = token.strip_prefix("wait=") {
                preferences.wait = wait.trim().parse().ok();
            } else if token.eq_ignore_ascii_case("return=minimal") {
                preferences.minimal = true;
            }
        }
    }
    preferences
}

/// `X-WPS-Output-Context` header, sanitised to a relative sub-path.
pub fn output_context(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-wps-output-context")?.to_str().ok()?;
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed.contains("..") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Split an `{id}:{version}` process reference.
pub fn split_process_ref(reference: &str) -> (String, Option<String>) {
    match reference.rsplit_once(':') {
        Some((id, version)) if semver::Version::parse(version).is_ok() => {
            (id.to_string(), Some(version.to_string()))
        }
        _ => (reference.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefer_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "respond-async, wait=10".parse().unwrap());
        let prefs = parse_prefer(&headers);
        assert!(prefs.respond_async);
        assert_eq!(prefs.wait, Some(10));
        assert!(!prefs.minimal);
    }

    #[test]
    fn prefer_return_minimal() {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "return=minimal".parse().unwrap());
        assert!(parse_prefer(&headers).minimal);
    }

    #[test]
    fn output_context_sanitised() {
        let mut headers = HeaderMap::new();
        headers.insert("x-wps-output-context", "proj/a/".parse().unwrap());
        assert_eq!(output_context(&headers).as_deref(), Some("proj/a"));

        headers.insert("x-wps-output-context", "../escape".parse().unwrap());
        assert_eq!(output_context(&headers), None);
    }

    #[test]
    fn process_ref_splitting() {
        assert_eq!(
            split_process_ref("echo:1.2.0"),
            ("echo".into(), Some("1.2.0".into()))
        );
        assert_eq!(split_process_ref("echo"), ("echo".into(), None));
        // colons that are not version separators stay in the id
        assert_eq!(split_process_ref("ns:echo"), ("ns:echo".into(), None));
    }
}
