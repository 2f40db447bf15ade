// Vault record storage: encrypted files on disk, bookkeeping rows in
// Postgres, one-shot retrieval through the core VaultAccess trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use weft_core::error::{Error, Result};
use weft_core::fetch::{Fetched, VaultAccess};
use weft_core::vault::VaultCrypto;

use crate::models::VaultRow;
use crate::repositories::Database;

#[derive(Clone)]
pub struct VaultStore {
    db: Database,
    crypto: VaultCrypto,
    dir: PathBuf,
    /// Records older than this are gone even if unconsumed.
    expiry: Duration,
}

impl VaultStore {
    pub fn new(db: Database, crypto: VaultCrypto, dir: PathBuf) -> Self {
        Self {
            db,
            crypto,
            dir,
            expiry: Duration::hours(24),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Encrypt and store an uploaded file. Returns the record id and its
    /// one-shot access token.
    pub async fn put(
        &self,
        bytes: &[u8],
        media_type: &str,
        filename: &str,
    ) -> Result<(Uuid, String)> {
        let id = Uuid::now_v7();
        let sealed = self.crypto.seal(bytes)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create vault dir: {}", e)))?;
        let path = self.dir.join(format!("{}.bin", id));
        tokio::fs::write(&path, &sealed.bytes)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write vault file: {}", e)))?;

        let expires_at = Utc::now() + self.expiry;
        sqlx::query(
            r#"
            INSERT INTO vault_records (id, file_path, media_type, filename, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(path.display().to_string())
        .bind(media_type)
        .bind(filename)
        .bind(expires_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("insert vault record: {}", e)))?;

        Ok((id, self.crypto.token(id)))
    }

    async fn load_row(&self, id: Uuid) -> Result<VaultRow> {
        let row = sqlx::query_as::<_, VaultRow>(
            "SELECT id, file_path, media_type, filename, consumed, created_at, expires_at FROM vault_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("load vault record: {}", e)))?;
        row.ok_or(Error::VaultGone(id))
    }

    /// Atomically flip the consumed flag; loses the race exactly once.
    async fn mark_consumed(&self, id: Uuid) -> Result<()> {
        let result =
            sqlx::query("UPDATE vault_records SET consumed = TRUE WHERE id = $1 AND NOT consumed")
                .bind(id)
                .execute(self.db.pool())
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("consume vault record: {}", e)))?;
        if result.rows_affected() == 0 {
            return Err(Error::VaultGone(id));
        }
        Ok(())
    }

    /// One-shot retrieval: token check, decrypt into `dest_dir`, mark
    /// consumed, remove the ciphertext.
    pub async fn get(&self, id: Uuid, token: &str, dest_dir: &Path) -> Result<Fetched> {
        self.crypto.verify_token(id, token)?;
        let row = self.load_row(id).await?;
        if row.consumed {
            return Err(Error::VaultGone(id));
        }
        if let Some(expires_at) = row.expires_at {
            if expires_at < Utc::now() {
                return Err(Error::VaultGone(id));
            }
        }

        let sealed = tokio::fs::read(&row.file_path)
            .await
            .map_err(|_| Error::VaultGone(id))?;
        let plaintext = self.crypto.open(id, &sealed)?;

        self.mark_consumed(id).await?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create dest dir: {}", e)))?;
        let dest = dest_dir.join(&row.filename);
        tokio::fs::write(&dest, &plaintext)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write plaintext: {}", e)))?;
        if let Err(e) = tokio::fs::remove_file(&row.file_path).await {
            tracing::warn!(vault_id = %id, error = %e, "failed to remove consumed ciphertext");
        }

        Ok(Fetched {
            local_path: dest,
            media_type: Some(row.media_type),
            filename: row.filename,
        })
    }

    /// Drop expired records and their ciphertext files. Run periodically.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let rows = sqlx::query_as::<_, VaultRow>(
            r#"
            DELETE FROM vault_records
            WHERE consumed OR (expires_at IS NOT NULL AND expires_at < NOW())
            RETURNING id, file_path, media_type, filename, consumed, created_at, expires_at
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("vault cleanup: {}", e)))?;
        let count = rows.len() as u64;
        for row in rows {
            let _ = tokio::fs::remove_file(&row.file_path).await;
        }
        Ok(count)
    }
}

#[async_trait]
impl VaultAccess for VaultStore {
    async fn retrieve(&self, id: Uuid, token: &str, dest: &Path) -> Result<Fetched> {
        self.get(id, token, dest).await
    }
}
