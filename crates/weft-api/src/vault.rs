// Vault upload endpoint: multipart file upload, encrypted at rest, answered
// with the record id and its one-shot access token.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use weft_contracts::VaultUploadResponse;
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::fetch::sanitise_filename;
use weft_storage::VaultStore;

use crate::common::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub vault: Option<VaultStore>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/vault", post(upload))
        .with_state(state)
}

/// POST /vault - upload one file, consumed on first read
#[utoipa::path(
    post,
    path = "/vault",
    responses(
        (status = 201, description = "File stored", body = VaultUploadResponse),
        (status = 400, description = "No file part in the upload"),
        (status = 422, description = "Vault is not configured")
    ),
    tag = "vault"
)]
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<VaultUploadResponse>), ApiError> {
    let vault = state
        .vault
        .as_ref()
        .ok_or_else(|| ApiError(Error::unprocessable("vault secret is not configured")))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::schema(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }
        let filename = field
            .file_name()
            .and_then(sanitise_filename)
            .unwrap_or_else(|| "upload.bin".to_string());
        let media_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::schema(format!("failed to read upload: {}", e)))?;
        if bytes.len() as u64 > state.settings.wps_max_request_size {
            return Err(ApiError(Error::unprocessable("uploaded file too large")));
        }

        let (id, access_token) = vault.put(&bytes, &media_type, &filename).await?;
        tracing::info!(vault_id = %id, filename, "vault upload stored");
        return Ok((
            StatusCode::CREATED,
            Json(VaultUploadResponse { id, access_token }),
        ));
    }

    Err(ApiError::schema("multipart body carries no file part"))
}
