// Provider DTOs (remote WPS / OGC API services)

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::common::Link;
use crate::process::ProcessSummary;

/// Remote service kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Wps,
    OgcApi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Wps => write!(f, "wps"),
            ProviderKind::OgcApi => write!(f, "ogc-api"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wps" => Ok(ProviderKind::Wps),
            "ogc-api" => Ok(ProviderKind::OgcApi),
            other => Err(format!("unknown provider kind: {}", other)),
        }
    }
}

/// Registered provider as returned by listings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderSummary {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub public: bool,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Diagnostic recorded when the registration capabilities probe failed
    /// but the provider was stored anyway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

/// POST /providers payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterProviderRequest {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProviderKind>,
    /// Opaque reference to stored credentials forwarded on provider calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Provider listing response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderList {
    pub providers: Vec<ProviderSummary>,
}

/// Processes materialised from one provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderProcessList {
    pub provider: String,
    pub processes: Vec<ProcessSummary>,
}

/// POST /vault response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VaultUploadResponse {
    pub id: uuid::Uuid,
    pub access_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_both_kinds() {
        assert_eq!("wps".parse::<ProviderKind>().unwrap(), ProviderKind::Wps);
        assert_eq!(
            "ogc-api".parse::<ProviderKind>().unwrap(),
            ProviderKind::OgcApi
        );
        assert!("grpc".parse::<ProviderKind>().is_err());
    }
}
