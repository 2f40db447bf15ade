// Landing page, conformance classes and health.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use weft_contracts::{Conformance, LandingPage, Link};
use weft_core::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/conformance", get(conformance))
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub configuration: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        configuration: format!("{:?}", state.settings.configuration),
    })
}

/// GET / - landing page with links by rel
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Landing page", body = LandingPage)),
    tag = "capabilities"
)]
async fn landing(State(state): State<AppState>) -> Json<LandingPage> {
    let base = state.settings.url.trim_end_matches('/');
    Json(LandingPage {
        title: "Weft".into(),
        description: "OGC API - Processes execution orchestrator".into(),
        links: vec![
            Link::new(format!("{}/", base), "self").with_type("application/json"),
            Link::new(format!("{}/conformance", base), "http://www.opengis.net/def/rel/ogc/1.0/conformance")
                .with_type("application/json"),
            Link::new(format!("{}/processes", base), "http://www.opengis.net/def/rel/ogc/1.0/processes")
                .with_type("application/json")
                .with_title("Deployed processes"),
            Link::new(format!("{}/jobs", base), "http://www.opengis.net/def/rel/ogc/1.0/job-list")
                .with_type("application/json")
                .with_title("Job monitoring"),
            Link::new(format!("{}/providers", base), "providers")
                .with_type("application/json")
                .with_title("Registered remote providers"),
            Link::new(format!("{}/api", base), "service-desc")
                .with_type("application/vnd.oai.openapi+json;version=3.0"),
        ],
    })
}

#[derive(Debug, Deserialize)]
struct ConformanceParams {
    category: Option<String>,
}

const CONFORMANCE_CORE: &[&str] = &[
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/core",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/ogc-process-description",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/json",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/oas30",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/job-list",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/dismiss",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/conf/callback",
    "http://www.opengis.net/spec/ogcapi-processes-2/1.0/conf/deploy-replace-undeploy",
    "http://www.opengis.net/spec/ogcapi-processes-2/1.0/conf/ogcapppkg",
    "http://www.opengis.net/spec/ogcapi-processes-2/1.0/conf/cwl",
    "http://www.opengis.net/spec/ogcapi-processes-3/0.0/conf/workflows",
    "http://www.opengis.net/spec/ogcapi-processes-4/1.0/conf/job-management",
];

const CONFORMANCE_RECOMMENDATIONS: &[&str] = &[
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/rec/core/job-status",
    "http://www.opengis.net/spec/ogcapi-processes-1/1.0/rec/core/api-definition-oas",
];

/// GET /conformance
#[utoipa::path(
    get,
    path = "/conformance",
    params(("category" = Option<String>, Query, description = "conf|rec|req|per|all")),
    responses((status = 200, description = "Conformance classes", body = Conformance)),
    tag = "capabilities"
)]
async fn conformance(Query(params): Query<ConformanceParams>) -> Json<Conformance> {
    let mut conforms_to: Vec<String> = Vec::new();
    let category = params.category.as_deref().unwrap_or("conf");
    if matches!(category, "conf" | "all") {
        conforms_to.extend(CONFORMANCE_CORE.iter().map(|s| s.to_string()));
    }
    if matches!(category, "rec" | "all") {
        conforms_to.extend(CONFORMANCE_RECOMMENDATIONS.iter().map(|s| s.to_string()));
    }
    if conforms_to.is_empty() {
        conforms_to.extend(CONFORMANCE_CORE.iter().map(|s| s.to_string()));
    }
    Json(Conformance { conforms_to })
}
