// Weft API server

mod common;
mod deploy;
mod jobs;
mod landing;
mod processes;
mod providers;
mod startup;
mod submission;
mod vault;
mod wps;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use weft_core::config::Settings;
use weft_core::fetch::Fetcher;
use weft_core::vault::VaultCrypto;
use weft_storage::{Database, Queue, VaultStore};

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        processes::list_processes,
        processes::deploy_process,
        processes::describe_process,
        processes::patch_process,
        processes::put_process,
        processes::undeploy_process,
        processes::get_package,
        processes::execute_process,
        jobs::list_jobs,
        jobs::get_job,
        jobs::patch_job,
        jobs::trigger_job,
        jobs::get_inputs,
        jobs::get_outputs,
        jobs::get_results,
        jobs::get_exceptions,
        jobs::get_logs,
        jobs::get_statistics,
        jobs::get_prov,
        jobs::get_prov_section,
        jobs::dismiss_job,
        jobs::batch_dismiss,
        providers::list_providers,
        providers::register_provider,
        providers::get_provider,
        providers::unregister_provider,
        providers::list_provider_processes,
        providers::describe_provider_process,
        providers::execute_provider_process,
        vault::upload,
    ),
    components(
        schemas(
            weft_contracts::Link,
            weft_contracts::Metadata,
            weft_contracts::ProcessKind,
            weft_contracts::JobControlOption,
            weft_contracts::TransmissionMode,
            weft_contracts::Visibility,
            weft_contracts::ProcessSummary,
            weft_contracts::ProcessList,
            weft_contracts::DeploymentResult,
            weft_contracts::UpdateProcessRequest,
            weft_contracts::ExecutionUnitRef,
            weft_contracts::DeployProcessInfo,
            weft_contracts::DeployRequest,
            weft_contracts::ExecutionMode,
            weft_contracts::ResponseForm,
            weft_contracts::ExecuteValue,
            weft_contracts::OutputRequest,
            weft_contracts::OutputFormat,
            weft_contracts::Subscribers,
            weft_contracts::ExecuteRequest,
            weft_contracts::JobKind,
            weft_contracts::StatusInfo,
            weft_contracts::JobList,
            weft_contracts::LogEntry,
            weft_contracts::JobException,
            weft_contracts::JobStatistics,
            weft_contracts::StepDuration,
            weft_contracts::ResultValue,
            weft_contracts::UpdateJobRequest,
            weft_contracts::BatchDismissRequest,
            weft_contracts::ProviderKind,
            weft_contracts::ProviderSummary,
            weft_contracts::ProviderList,
            weft_contracts::ProviderProcessList,
            weft_contracts::RegisterProviderRequest,
            weft_contracts::VaultUploadResponse,
            weft_contracts::LandingPage,
            weft_contracts::Conformance,
            weft_contracts::ErrorBody,
        )
    ),
    tags(
        (name = "capabilities", description = "Landing page and conformance"),
        (name = "processes", description = "Process deployment and description"),
        (name = "jobs", description = "Job execution and monitoring"),
        (name = "providers", description = "Remote provider registry"),
        (name = "vault", description = "One-shot file uploads")
    ),
    info(
        title = "Weft API",
        description = "OGC API - Processes execution orchestrator",
        license(name = "Apache-2.0")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("weft-api starting...");

    let settings = Arc::new(Settings::from_env().context("failed to resolve settings")?);
    tracing::info!(configuration = ?settings.configuration, "operating mode");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let db = Database::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    let queue = Queue::new(db.pool().clone());

    let crypto = settings.vault_secret.as_ref().map(VaultCrypto::new);
    let vault_store = crypto.as_ref().map(|crypto| {
        VaultStore::new(db.clone(), crypto.clone(), settings.vault_dir.clone())
    });
    if crypto.is_none() {
        tracing::warn!("WEFT_VAULT_SECRET not set; vault uploads and subscribers disabled");
    }

    let mut fetcher = Fetcher::new(settings.clone());
    if let Some(vault) = &vault_store {
        fetcher = fetcher.with_vault(Arc::new(vault.clone()));
    }
    let fetcher = Arc::new(fetcher);

    startup::register_builtins(&db)
        .await
        .context("builtin registration failed")?;
    startup::register_cwl_directory(&db, &settings, &fetcher)
        .await
        .context("preloaded CWL registration failed")?;

    let landing_state = landing::AppState {
        settings: settings.clone(),
    };
    let processes_state = processes::AppState {
        db: db.clone(),
        queue: queue.clone(),
        settings: settings.clone(),
        fetcher: fetcher.clone(),
        crypto: crypto.clone(),
        client: reqwest::Client::new(),
    };
    let jobs_state = jobs::AppState {
        db: db.clone(),
        queue: queue.clone(),
        settings: settings.clone(),
    };
    let providers_state = providers::AppState {
        db: db.clone(),
        queue: queue.clone(),
        settings: settings.clone(),
        crypto: crypto.clone(),
        client: reqwest::Client::new(),
        capabilities: Arc::new(Mutex::new(HashMap::new())),
    };
    let vault_state = vault::AppState {
        settings: settings.clone(),
        vault: vault_store,
    };
    let wps_state = wps::AppState {
        db: db.clone(),
        queue: queue.clone(),
        settings: settings.clone(),
        crypto: crypto.clone(),
    };

    let app = Router::new()
        .route(
            "/health",
            get(landing::health).with_state(landing_state.clone()),
        )
        .merge(landing::routes(landing_state))
        .merge(processes::routes(processes_state))
        .merge(jobs::routes(jobs_state))
        .merge(providers::routes(providers_state))
        .merge(vault::routes(vault_state))
        .merge(wps::routes(wps_state))
        .merge(SwaggerUi::new("/api").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("WEFT_BIND").unwrap_or_else(|_| "0.0.0.0:9000".into());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
