// Error taxonomy. Every variant carries a stable `code` string surfaced in
// API error bodies and job exception reports.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the execution core.
#[derive(Debug, Error)]
pub enum Error {
    /// Submitted body or CWL failed schema checks
    #[error("schema validation failed: {0}")]
    SchemaInvalid(String),

    /// Merger found contradictions between descriptor sources
    #[error("descriptor mismatch for '{id}': {detail}")]
    DescriptionMismatch { id: String, detail: String },

    /// Unknown scheme or forbidden path in a reference
    #[error("invalid reference '{reference}': {detail}")]
    RefInvalid { reference: String, detail: String },

    /// Reference could not be resolved after retries. `permanent` marks
    /// definite failures (a 404) that no retry will recover.
    #[error("unreachable reference '{reference}': {detail}")]
    RefUnreachable {
        reference: String,
        detail: String,
        permanent: bool,
    },

    /// Reference requires credentials that were not supplied
    #[error("reference '{0}' requires authorization")]
    RefAuthRequired(String),

    /// Extension or content contradicts the declared media type
    #[error("reference '{reference}' does not match declared format: {detail}")]
    RefFormatMismatch { reference: String, detail: String },

    /// Vault record consumed, expired or missing
    #[error("vault record {0} is gone")]
    VaultGone(uuid::Uuid),

    /// Vault token mismatch
    #[error("vault access denied for record {0}")]
    VaultDenied(uuid::Uuid),

    /// Application exited non-zero
    #[error("runner failed: {detail}")]
    RunnerFailed { detail: String, stderr_tail: String },

    /// Runner exceeded its wall-clock budget
    #[error("runner timed out after {0} s")]
    RunnerTimeout(u64),

    /// Remote step returned an unrecoverable error
    #[error("step '{step}' failed: {detail}")]
    StepFailed { step: String, detail: String },

    /// Docker pull or remote fetch needs credentials
    #[error("package requires authorization: {0}")]
    PackageAuthRequired(String),

    /// Undeploy blocked by running jobs
    #[error("process '{0}' is referenced by running jobs")]
    ConflictInUse(String),

    /// Dismissed or consumed resource
    #[error("resource is gone: {0}")]
    Gone(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SchemaInvalid(_) => "SCHEMA_INVALID",
            Error::DescriptionMismatch { .. } => "DESCRIPTION_MISMATCH",
            Error::RefInvalid { .. } => "REF_INVALID",
            Error::RefUnreachable { .. } => "REF_UNREACHABLE",
            Error::RefAuthRequired(_) => "REF_AUTH_REQUIRED",
            Error::RefFormatMismatch { .. } => "REF_FORMAT_MISMATCH",
            Error::VaultGone(_) => "VAULT_GONE",
            Error::VaultDenied(_) => "VAULT_DENIED",
            Error::RunnerFailed { .. } => "RUNNER_FAILED",
            Error::RunnerTimeout(_) => "RUNNER_TIMEOUT",
            Error::StepFailed { .. } => "STEP_FAILED",
            Error::PackageAuthRequired(_) => "PACKAGE_AUTH_REQUIRED",
            Error::ConflictInUse(_) => "CONFLICT_IN_USE",
            Error::Gone(_) => "GONE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Unprocessable(_) => "UNPROCESSABLE",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::SchemaInvalid(_)
            | Error::DescriptionMismatch { .. }
            | Error::RefInvalid { .. }
            | Error::RefFormatMismatch { .. } => 400,
            Error::RefAuthRequired(_) | Error::PackageAuthRequired(_) => 401,
            Error::Forbidden(_) | Error::VaultDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::ConflictInUse(_) => 409,
            Error::Gone(_) | Error::VaultGone(_) => 410,
            Error::Unprocessable(_) | Error::RefUnreachable { .. } => 422,
            Error::RunnerFailed { .. }
            | Error::RunnerTimeout(_)
            | Error::StepFailed { .. }
            | Error::Internal(_) => 500,
        }
    }

    /// Whether a step-level retry may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RefUnreachable { permanent: false, .. }
                | Error::StepFailed { .. }
                | Error::RunnerTimeout(_)
        )
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Error::SchemaInvalid(msg.into())
    }

    pub fn mismatch(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::DescriptionMismatch {
            id: id.into(),
            detail: detail.into(),
        }
    }

    pub fn ref_invalid(reference: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::RefInvalid {
            reference: reference.into(),
            detail: detail.into(),
        }
    }

    pub fn ref_unreachable(reference: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::RefUnreachable {
            reference: reference.into(),
            detail: detail.into(),
            permanent: false,
        }
    }

    /// Unreachable reference that no amount of retrying will resolve.
    pub fn ref_unreachable_permanent(
        reference: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Error::RefUnreachable {
            reference: reference.into(),
            detail: detail.into(),
            permanent: true,
        }
    }

    pub fn step(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::StepFailed {
            step: step.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Error::Unprocessable(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::schema("x").code(), "SCHEMA_INVALID");
        assert_eq!(Error::VaultGone(uuid::Uuid::nil()).code(), "VAULT_GONE");
        assert_eq!(Error::ConflictInUse("p".into()).code(), "CONFLICT_IN_USE");
        assert_eq!(Error::step("b", "boom").code(), "STEP_FAILED");
    }

    #[test]
    fn http_mapping() {
        assert_eq!(Error::schema("x").http_status(), 400);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::ConflictInUse("p".into()).http_status(), 409);
        assert_eq!(Error::Gone("j".into()).http_status(), 410);
        assert_eq!(Error::ref_unreachable("u", "d").http_status(), 422);
    }

    #[test]
    fn recoverable_whitelist() {
        assert!(Error::ref_unreachable("u", "503").is_recoverable());
        assert!(Error::step("b", "timeout").is_recoverable());
        assert!(!Error::schema("bad").is_recoverable());
        assert!(!Error::Forbidden("no".into()).is_recoverable());
    }

    #[test]
    fn permanent_unreachable_is_not_retried() {
        let err = Error::ref_unreachable_permanent("u", "HTTP 404");
        assert_eq!(err.code(), "REF_UNREACHABLE");
        assert!(!err.is_recoverable());
    }
}
