// Repository layer for database operations.
// Process revisions are immutable rows; job writes go through a
// compare-and-set on updated_at so parallel writers (worker progress vs API
// dismissal) never lose updates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use weft_contracts::{JobStatus, LogEntry};

use crate::models::*;

/// Cap applied to individual log messages before persistence.
const LOG_MESSAGE_CAP: usize = 1024;
const LOG_TRUNCATION_MARK: &str = "…[truncated]";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL and apply migrations.
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============================================
    // Processes
    // ============================================

    const PROCESS_COLUMNS: &'static str = "revision_id, process_id, version, latest, kind, title, \
         description, keywords, metadata, inputs, outputs, job_control_options, \
         output_transmission, visibility, execution_unit, package, tombstoned, created_at";

    /// Insert a new revision and mark it latest. Fails when the same
    /// (id, version) already exists.
    pub async fn create_process(&self, input: CreateProcess) -> Result<ProcessRow> {
        let model = &input.model;
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE processes SET latest = FALSE WHERE process_id = $1 AND latest")
            .bind(&model.id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, ProcessRow>(&format!(
            r#"
            INSERT INTO processes (revision_id, process_id, version, latest, kind, title,
                description, keywords, metadata, inputs, outputs, job_control_options,
                output_transmission, visibility, execution_unit, package)
            VALUES ($1, $2, $3, TRUE, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {}
            "#,
            Self::PROCESS_COLUMNS
        ))
        .bind(model.revision_id)
        .bind(&model.id)
        .bind(model.version.to_string())
        .bind(model.kind.to_string())
        .bind(&model.title)
        .bind(&model.description)
        .bind(&model.keywords)
        .bind(serde_json::to_value(&model.metadata)?)
        .bind(serde_json::to_value(&model.inputs)?)
        .bind(serde_json::to_value(&model.outputs)?)
        .bind(
            model
                .job_control_options
                .iter()
                .map(|o| {
                    serde_json::to_value(o)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>(),
        )
        .bind(
            model
                .output_transmission
                .iter()
                .map(|o| {
                    serde_json::to_value(o)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>(),
        )
        .bind(
            serde_json::to_value(model.visibility)?
                .as_str()
                .unwrap_or("private")
                .to_string(),
        )
        .bind(input.execution_unit_value())
        .bind(&input.package)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Idempotent upsert for built-in registration: replaces the stored
    /// revision only when the version changed.
    pub async fn upsert_builtin(&self, input: CreateProcess) -> Result<ProcessRow> {
        let existing = self.get_process(&input.model.id, None).await?;
        if let Some(existing) = existing {
            if existing.version == input.model.version.to_string() {
                return Ok(existing);
            }
        }
        self.create_process(input).await
    }

    /// Latest revision by id, or an exact revision when `version` is given.
    pub async fn get_process(
        &self,
        process_id: &str,
        version: Option<&str>,
    ) -> Result<Option<ProcessRow>> {
        let row = match version {
            Some(version) => {
                sqlx::query_as::<_, ProcessRow>(&format!(
                    "SELECT {} FROM processes WHERE process_id = $1 AND version = $2 AND NOT tombstoned",
                    Self::PROCESS_COLUMNS
                ))
                .bind(process_id)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ProcessRow>(&format!(
                    "SELECT {} FROM processes WHERE process_id = $1 AND latest AND NOT tombstoned",
                    Self::PROCESS_COLUMNS
                ))
                .bind(process_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row)
    }

    pub async fn list_processes(&self, query: &ProcessQuery) -> Result<(Vec<ProcessRow>, i64)> {
        let mut conditions = vec!["NOT tombstoned".to_string()];
        if !query.revisions {
            conditions.push("latest".into());
        }
        if query.version.is_some() {
            conditions.push("version = $3".into());
        }
        if query.public_only {
            conditions.push("visibility = 'public'".into());
        }
        let where_clause = conditions.join(" AND ");
        let order = match query.sort.as_deref() {
            Some("id") | None => "process_id ASC, version ASC",
            Some("created") => "created_at ASC",
            Some("-created") => "created_at DESC",
            Some("version") => "process_id ASC, version ASC",
            Some(_) => "process_id ASC, version ASC",
        };

        let sql = format!(
            "SELECT {} FROM processes WHERE {} ORDER BY {} LIMIT $1 OFFSET $2",
            Self::PROCESS_COLUMNS,
            where_clause,
            order
        );
        let offset = query.page * query.limit;
        let rows = if let Some(version) = &query.version {
            sqlx::query_as::<_, ProcessRow>(&sql)
                .bind(query.limit)
                .bind(offset)
                .bind(version)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as::<_, ProcessRow>(&sql)
                .bind(query.limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
        };

        let count_sql = format!("SELECT COUNT(*) FROM processes WHERE {}", where_clause);
        let total: i64 = if let Some(version) = &query.version {
            sqlx::query_scalar(&count_sql.replace("$3", "$1"))
                .bind(version)
                .fetch_one(&self.pool)
                .await?
        } else {
            sqlx::query_scalar(&count_sql).fetch_one(&self.pool).await?
        };
        Ok((rows, total))
    }

    /// All stored revisions of one process, oldest first.
    pub async fn list_process_revisions(&self, process_id: &str) -> Result<Vec<ProcessRow>> {
        let rows = sqlx::query_as::<_, ProcessRow>(&format!(
            "SELECT {} FROM processes WHERE process_id = $1 AND NOT tombstoned ORDER BY created_at ASC",
            Self::PROCESS_COLUMNS
        ))
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Tombstone every revision of a process.
    pub async fn tombstone_process(&self, process_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE processes SET tombstoned = TRUE WHERE process_id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count of non-terminal jobs referencing a process.
    pub async fn count_active_jobs_for_process(&self, process_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE process_id = $1
              AND status NOT IN ('successful', 'failed', 'dismissed')
            "#,
        )
        .bind(process_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ============================================
    // Jobs
    // ============================================

    const JOB_COLUMNS: &'static str = "id, process_id, process_version, provider_id, kind, status, \
         progress, message, inputs, outputs_request, results, exceptions, logs, statistics, \
         subscribers_encrypted, auth_encrypted, execution_mode, response_form, output_context, tags, \
         cancel_requested, created_at, started_at, finished_at, updated_at";

    pub async fn create_job(&self, input: CreateJob) -> Result<JobRow> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (id, process_id, process_version, provider_id, kind, status,
                inputs, outputs_request, subscribers_encrypted, auth_encrypted, execution_mode,
                response_form, output_context, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {}
            "#,
            Self::JOB_COLUMNS
        ))
        .bind(input.id)
        .bind(&input.process_id)
        .bind(&input.process_version)
        .bind(&input.provider_id)
        .bind(input.kind.to_string())
        .bind(input.status.to_string())
        .bind(&input.inputs)
        .bind(&input.outputs_request)
        .bind(&input.subscribers_encrypted)
        .bind(&input.auth_encrypted)
        .bind(&input.execution_mode)
        .bind(&input.response_form)
        .bind(&input.output_context)
        .bind(&input.tags)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            Self::JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Compare-and-set update. Returns None when the guard missed; the
    /// caller re-reads and retries.
    pub async fn update_job(
        &self,
        id: Uuid,
        expected_updated_at: DateTime<Utc>,
        update: UpdateJob,
    ) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs SET
                status = COALESCE($3, status),
                progress = GREATEST(progress, COALESCE($4, progress)),
                message = COALESCE($5, message),
                results = COALESCE($6, results),
                statistics = COALESCE($7, statistics),
                started_at = COALESCE($8, started_at),
                finished_at = COALESCE($9, finished_at),
                cancel_requested = COALESCE($10, cancel_requested),
                inputs = COALESCE($11, inputs),
                outputs_request = COALESCE($12, outputs_request),
                subscribers_encrypted = COALESCE($13, subscribers_encrypted),
                tags = COALESCE($14, tags),
                updated_at = NOW()
            WHERE id = $1 AND updated_at = $2
            RETURNING {}
            "#,
            Self::JOB_COLUMNS
        ))
        .bind(id)
        .bind(expected_updated_at)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.progress)
        .bind(update.message)
        .bind(update.results)
        .bind(update.statistics)
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(update.cancel_requested)
        .bind(update.inputs)
        .bind(update.outputs_request)
        .bind(update.subscribers_encrypted)
        .bind(update.tags)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Retrying wrapper around the CAS update with legal-transition check.
    pub async fn transition_job(
        &self,
        id: Uuid,
        next: JobStatus,
        mut update: UpdateJob,
    ) -> Result<JobRow> {
        update.status = Some(next);
        for _ in 0..8 {
            let Some(current) = self.get_job(id).await? else {
                anyhow::bail!("job {} not found", id);
            };
            let status = current.status();
            if status == next {
                return Ok(current);
            }
            if !status.can_transition_to(next) {
                anyhow::bail!("illegal transition {} -> {} for job {}", status, next, id);
            }
            if let Some(row) = self
                .update_job(id, current.updated_at, update.clone())
                .await?
            {
                return Ok(row);
            }
            tracing::debug!(job_id = %id, "job update guard missed, retrying");
        }
        anyhow::bail!("job {} update contended beyond retry budget", id)
    }

    /// Append a log entry; messages are capped. Logs are append-only so
    /// this bypasses the CAS guard (jsonb concatenation is atomic).
    pub async fn append_job_log(&self, id: Uuid, level: &str, message: &str) -> Result<()> {
        let message = if message.len() > LOG_MESSAGE_CAP {
            let mut capped: String = message.chars().take(LOG_MESSAGE_CAP).collect();
            capped.push_str(LOG_TRUNCATION_MARK);
            capped
        } else {
            message.to_string()
        };
        let entry = serde_json::to_value(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message,
        })?;
        sqlx::query("UPDATE jobs SET logs = logs || $2::jsonb WHERE id = $1")
            .bind(id)
            .bind(serde_json::json!([entry]))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record an exception against a job.
    pub async fn append_job_exception(&self, id: Uuid, exception: Value) -> Result<()> {
        sqlx::query("UPDATE jobs SET exceptions = exceptions || $2::jsonb WHERE id = $1")
            .bind(id)
            .bind(serde_json::json!([exception]))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_jobs(&self, query: &JobQuery) -> Result<(Vec<JobRow>, i64)> {
        let mut conditions: Vec<String> = Vec::new();
        let mut idx = 2; // $1 and $2 are limit/offset
        let mut push = |conditions: &mut Vec<String>, fragment: &str| {
            idx += 1;
            conditions.push(fragment.replace("$n", &format!("${}", idx)));
            idx
        };

        let mut binds: Vec<JobBind> = Vec::new();
        if let Some(status) = &query.status {
            push(&mut conditions, "status = $n");
            binds.push(JobBind::Text(status.clone()));
        }
        if let Some(process_id) = &query.process_id {
            push(&mut conditions, "process_id = $n");
            binds.push(JobBind::Text(process_id.clone()));
        }
        if let Some(provider_id) = &query.provider_id {
            push(&mut conditions, "provider_id = $n");
            binds.push(JobBind::Text(provider_id.clone()));
        }
        if let Some(kind) = &query.kind {
            push(&mut conditions, "kind = $n");
            binds.push(JobBind::Text(kind.clone()));
        }
        if !query.tags.is_empty() {
            push(&mut conditions, "tags @> $n");
            binds.push(JobBind::TextArray(query.tags.clone()));
        }
        if let Some(min) = query.min_duration_secs {
            push(
                &mut conditions,
                "EXTRACT(EPOCH FROM (COALESCE(finished_at, NOW()) - COALESCE(started_at, created_at))) >= $n",
            );
            binds.push(JobBind::Int(min));
        }
        if let Some(max) = query.max_duration_secs {
            push(
                &mut conditions,
                "EXTRACT(EPOCH FROM (COALESCE(finished_at, NOW()) - COALESCE(started_at, created_at))) <= $n",
            );
            binds.push(JobBind::Int(max));
        }
        if let Some(after) = query.created_after {
            push(&mut conditions, "created_at >= $n");
            binds.push(JobBind::Time(after));
        }
        if let Some(before) = query.created_before {
            push(&mut conditions, "created_at <= $n");
            binds.push(JobBind::Time(before));
        }

        let where_clause = if conditions.is_empty() {
            "TRUE".to_string()
        } else {
            conditions.join(" AND ")
        };
        let order = match query.sort.as_deref() {
            Some("created") => "created_at ASC",
            Some("-created") | None => "created_at DESC",
            Some("status") => "status ASC, created_at DESC",
            Some("process") => "process_id ASC, created_at DESC",
            Some(_) => "created_at DESC",
        };
        let sql = format!(
            "SELECT {} FROM jobs WHERE {} ORDER BY {} LIMIT $1 OFFSET $2",
            Self::JOB_COLUMNS,
            where_clause,
            order
        );

        let mut jobs_query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(query.limit)
            .bind(query.page * query.limit);
        for bind in &binds {
            jobs_query = match bind {
                JobBind::Text(v) => jobs_query.bind(v.clone()),
                JobBind::TextArray(v) => jobs_query.bind(v.clone()),
                JobBind::Int(v) => jobs_query.bind(*v),
                JobBind::Time(v) => jobs_query.bind(*v),
            };
        }
        let rows = jobs_query.fetch_all(&self.pool).await?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE {}",
            shift_placeholders(&where_clause, 2)
        );
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for bind in &binds {
            count_query = match bind {
                JobBind::Text(v) => count_query.bind(v.clone()),
                JobBind::TextArray(v) => count_query.bind(v.clone()),
                JobBind::Int(v) => count_query.bind(*v),
                JobBind::Time(v) => count_query.bind(*v),
            };
        }
        let total = count_query.fetch_one(&self.pool).await?;

        Ok((rows, total))
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Providers
    // ============================================

    pub async fn create_provider(&self, input: CreateProvider) -> Result<ProviderRow> {
        let row = sqlx::query_as::<_, ProviderRow>(
            r#"
            INSERT INTO providers (id, url, title, public, kind, credentials, diagnostic)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, url, title, description, public, kind, credentials, diagnostic, created_at
            "#,
        )
        .bind(&input.id)
        .bind(&input.url)
        .bind(&input.title)
        .bind(input.public)
        .bind(&input.kind)
        .bind(&input.credentials)
        .bind(&input.diagnostic)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_provider(&self, id: &str) -> Result<Option<ProviderRow>> {
        let row = sqlx::query_as::<_, ProviderRow>(
            "SELECT id, url, title, description, public, kind, credentials, diagnostic, created_at FROM providers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_providers(&self) -> Result<Vec<ProviderRow>> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            "SELECT id, url, title, description, public, kind, credentials, diagnostic, created_at FROM providers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_provider(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM providers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

enum JobBind {
    Text(String),
    TextArray(Vec<String>),
    Int(i64),
    Time(DateTime<Utc>),
}

/// Rewrite `$3..` placeholders down by `by` for the count query, which has
/// no limit/offset binds.
fn shift_placeholders(clause: &str, by: usize) -> String {
    let mut out = String::with_capacity(clause.len());
    let mut chars = clause.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut number = String::new();
            while let Some(d) = chars.peek() {
                if d.is_ascii_digit() {
                    number.push(*d);
                    chars.next();
                } else {
                    break;
                }
            }
            let shifted = number.parse::<usize>().unwrap_or(0).saturating_sub(by);
            out.push('$');
            out.push_str(&shifted.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_shift() {
        assert_eq!(
            shift_placeholders("status = $3 AND kind = $4", 2),
            "status = $1 AND kind = $2"
        );
        assert_eq!(shift_placeholders("TRUE", 2), "TRUE");
    }
}
