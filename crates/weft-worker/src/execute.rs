// Job execution workflow: claim transitions, staging, dispatch, result
// publication, statistics, provenance and notifications. Dismissal is
// observed at staging and step boundaries; a dismissed job has its staged
// inputs and produced outputs removed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use weft_contracts::{
    ExecuteRequest, ExecuteValue, JobStatistics, JobStatus, OutputRequest, StepDuration,
    Subscribers,
};
use weft_core::auth::AuthContext;
use weft_core::config::Settings;
use weft_core::error::Error;
use weft_core::fetch::{FetchOptions, Fetcher};
use weft_core::package::{ExecutionUnit, Package, StepRequirement};
use weft_core::prov::ProvDocument;
use weft_core::vault::VaultCrypto;
use weft_storage::{Database, JobRow, Queue, UpdateJob};

use crate::dispatch::{execute_workflow, ExecutionHooks};
use crate::notify;
use crate::runner::{
    run_step_with_retries, RunnerKind, RunnerRegistry, StepContext, StepOutputs,
};
use crate::staging;

/// Wall-clock budget for a single step.
const STEP_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct JobExecutor {
    db: Database,
    queue: Queue,
    settings: Arc<Settings>,
    fetcher: Arc<Fetcher>,
    registry: Arc<RunnerRegistry>,
    crypto: Option<VaultCrypto>,
}

struct JobHooks {
    db: Database,
    job_id: Uuid,
    steps: Mutex<Vec<StepDuration>>,
    prov: Mutex<Option<ProvDocument>>,
}

#[async_trait]
impl ExecutionHooks for JobHooks {
    async fn log(&self, level: &str, message: &str) {
        if let Err(e) = self.db.append_job_log(self.job_id, level, message).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to append job log");
        }
    }

    async fn is_cancelled(&self) -> bool {
        match self.db.get_job(self.job_id).await {
            Ok(Some(job)) => job.cancel_requested || job.status() == JobStatus::Dismissed,
            _ => false,
        }
    }

    async fn progress(&self, percent: u8) {
        if let Ok(Some(job)) = self.db.get_job(self.job_id).await {
            let update = UpdateJob {
                progress: Some(percent as i32),
                ..Default::default()
            };
            if let Err(e) = self.db.update_job(self.job_id, job.updated_at, update).await {
                tracing::warn!(job_id = %self.job_id, error = %e, "progress update failed");
            }
        }
    }

    async fn step_finished(&self, step_id: &str, duration: Duration) {
        self.steps.lock().await.push(StepDuration {
            step: step_id.to_string(),
            duration_seconds: duration.as_secs_f64(),
        });
        if let Some(prov) = self.prov.lock().await.as_mut() {
            let ended = Utc::now();
            let started = ended
                - chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            prov.add_step(step_id, started, Some(ended));
        }
    }
}

impl JobExecutor {
    pub fn new(
        db: Database,
        queue: Queue,
        settings: Arc<Settings>,
        fetcher: Arc<Fetcher>,
        crypto: Option<VaultCrypto>,
    ) -> Self {
        let registry = Arc::new(RunnerRegistry::new(settings.clone()));
        Self {
            db,
            queue,
            settings,
            fetcher,
            registry,
            crypto,
        }
    }

    /// Execute one claimed job to a terminal state. Never returns an error
    /// for job-level failures; those end up on the job record.
    pub async fn execute(&self, job_id: Uuid) {
        let job = match self.db.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "queued job no longer exists");
                let _ = self.queue.remove(job_id).await;
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to load job");
                return;
            }
        };
        if job.is_terminal() {
            let _ = self.queue.remove(job_id).await;
            return;
        }

        let result = self.run(&job).await;
        let _ = self.queue.remove(job_id).await;

        match result {
            Ok(()) => {}
            Err(err) if matches!(err, Error::Gone(_)) => {
                self.finish_dismissed(&job).await;
            }
            Err(err) => {
                self.finish_failed(&job, &err).await;
            }
        }

        if let Ok(Some(job)) = self.db.get_job(job_id).await {
            if job.status() != JobStatus::Dismissed {
                crate::status_doc::write(&self.settings, &job).await;
            }
            self.notify_subscribers(&job).await;
        }
    }

    async fn run(&self, job: &JobRow) -> weft_core::error::Result<()> {
        let job_id = job.id;

        // claim
        self.db
            .transition_job(
                job_id,
                JobStatus::Started,
                UpdateJob {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::Internal)?;
        self.db
            .append_job_log(job_id, "INFO", "job claimed by worker")
            .await
            .map_err(Error::Internal)?;

        // provider jobs have no stored process; the unit is derived from
        // the registered service
        let (model, unit) = if let Some(provider_id) = &job.provider_id {
            let provider = self
                .db
                .get_provider(provider_id)
                .await
                .map_err(Error::Internal)?
                .ok_or_else(|| Error::not_found(format!("provider {}", provider_id)))?;
            let unit = match provider.kind.as_str() {
                "ogc-api" => ExecutionUnit::OgcApi(format!(
                    "{}/processes/{}",
                    provider.url.trim_end_matches('/'),
                    job.process_id
                )),
                _ => ExecutionUnit::Wps(provider.url.clone()),
            };
            let mut model = weft_core::model::ProcessModel::new(
                &job.process_id,
                weft_contracts::ProcessKind::OgcApi,
            );
            model.visibility = weft_contracts::Visibility::Public;
            (model, unit)
        } else {
            let process = self
                .db
                .get_process(&job.process_id, job.process_version.as_deref())
                .await
                .map_err(Error::Internal)?
                .ok_or_else(|| Error::not_found(format!("process {}", job.process_id)))?;
            let unit = process.execution_unit().map_err(Error::Internal)?;
            (process.to_model().map_err(Error::Internal)?, unit)
        };

        let running = self
            .db
            .transition_job(job_id, JobStatus::Running, UpdateJob::default())
            .await
            .map_err(Error::Internal)?;
        self.db
            .append_job_log(job_id, "INFO", "execution started")
            .await
            .map_err(Error::Internal)?;
        crate::status_doc::write(&self.settings, &running).await;

        let request: ExecuteRequest =
            serde_json::from_value(job.inputs.clone()).map_err(|e| {
                Error::schema(format!("stored job inputs failed to parse: {}", e))
            })?;
        let outputs_request: Option<BTreeMap<String, OutputRequest>> = job
            .outputs_request
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::schema(format!("stored output request failed to parse: {}", e)))?;

        let work_dir = self.settings.wps_workdir.join(job_id.to_string());
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create workdir: {}", e)))?;

        // forwarded credentials travel encrypted on the job record
        let auth = match (&job.auth_encrypted, &self.crypto) {
            (Some(sealed), Some(crypto)) => crypto
                .open(job_id, sealed)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                .unwrap_or_default(),
            _ => AuthContext::default(),
        };
        let hooks = JobHooks {
            db: self.db.clone(),
            job_id,
            steps: Mutex::new(Vec::new()),
            prov: Mutex::new(if self.settings.cwl_prov {
                let mut doc = ProvDocument::new(job_id, &model.id, model.version.to_string());
                doc.job.started = Some(Utc::now());
                for (id, value) in &request.inputs {
                    doc.add_input(id, reference_of(value));
                }
                Some(doc)
            } else {
                None
            }),
        };

        // cancellation checkpoint before staging
        if hooks.is_cancelled().await {
            return Err(Error::Gone("job was dismissed".into()));
        }

        let started = tokio::time::Instant::now();
        let collected = self
            .dispatch(job, &unit, &model, &request, &work_dir, &auth, &hooks)
            .await?;

        // cancellation checkpoint before publication
        if hooks.is_cancelled().await {
            return Err(Error::Gone("job was dismissed".into()));
        }

        // provider jobs carry no declared outputs; synthesise descriptors
        // from what was actually collected
        let mut publish_model = model.clone();
        if publish_model.outputs.is_empty() {
            for id in collected.keys() {
                let mut descriptor = weft_core::model::IoDescriptor::new(
                    id,
                    weft_core::model::IoType::Complex { directory: false },
                );
                descriptor.min_occurs = 0;
                descriptor.formats = vec![
                    weft_core::model::Format::new("application/octet-stream").as_default(),
                ];
                publish_model.outputs.push(descriptor);
            }
        }
        let published = staging::publish_outputs(
            &self.settings,
            &publish_model,
            job_id,
            job.output_context.as_deref(),
            &collected,
            outputs_request.as_ref(),
        )
        .await?;

        let statistics = JobStatistics {
            duration_seconds: Some(started.elapsed().as_secs_f64()),
            step_durations: hooks.steps.lock().await.clone(),
            peak_memory_bytes: None,
            outputs_size_bytes: Some(published.total_bytes),
        };

        if let Some(prov) = hooks.prov.lock().await.as_mut() {
            prov.job.ended = Some(Utc::now());
            if let Some(results) = published.results.as_object() {
                for (id, entry) in results {
                    prov.add_output(id, entry.get("href").and_then(Value::as_str).map(String::from));
                }
            }
            if let ExecutionUnit::Cwl(doc) = &unit {
                prov.cwl = Some(doc.clone());
            }
            self.write_prov(job, prov).await?;
        }

        self.db
            .transition_job(
                job_id,
                JobStatus::Successful,
                UpdateJob {
                    progress: Some(100),
                    results: Some(published.results),
                    statistics: Some(
                        serde_json::to_value(&statistics)
                            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?,
                    ),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::Internal)?;
        self.db
            .append_job_log(job_id, "INFO", "job completed")
            .await
            .map_err(Error::Internal)?;
        tracing::info!(job_id = %job_id, "job completed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        job: &JobRow,
        unit: &ExecutionUnit,
        model: &weft_core::model::ProcessModel,
        request: &ExecuteRequest,
        work_dir: &PathBuf,
        auth: &AuthContext,
        hooks: &JobHooks,
    ) -> weft_core::error::Result<StepOutputs> {
        // resolve the package for CWL-backed processes
        let package = match unit {
            ExecutionUnit::Cwl(doc) => Some(Package::from_value(doc.clone())?),
            ExecutionUnit::CwlRef(href) => {
                let fetched = self
                    .fetcher
                    .fetch(href, &work_dir.join("package"), &FetchOptions::default())
                    .await?;
                let raw = tokio::fs::read_to_string(&fetched.local_path)
                    .await
                    .map_err(|e| Error::Internal(anyhow::anyhow!("read package: {}", e)))?;
                Some(Package::from_text(&raw)?)
            }
            _ => None,
        };

        let requirement = match (unit, &package) {
            (ExecutionUnit::OgcApi(url), _) => StepRequirement::OgcApi {
                process_url: url.clone(),
            },
            (ExecutionUnit::Wps(url), _) => StepRequirement::Wps1 {
                provider: url.clone(),
                process: job.process_id.clone(),
            },
            (_, Some(package)) => package.dispatch_requirement(),
            _ => StepRequirement::Docker { image: None },
        };
        let kind = RunnerKind::for_requirement(&requirement);

        if kind.wants_local_files() && !self.settings.configuration.allows_local_execution() {
            return Err(Error::unprocessable(
                "local execution refused in EMS mode",
            ));
        }
        if !kind.wants_local_files() && !self.settings.configuration.allows_remote_dispatch() {
            return Err(Error::unprocessable(
                "remote dispatch refused in ADES mode",
            ));
        }

        // provider jobs carry no declared descriptors; their inputs pass
        // through untouched (references stay URLs for the remote runner)
        let staged = if job.provider_id.is_some() {
            passthrough_inputs(&request.inputs)
        } else {
            staging::stage_inputs(model, &request.inputs, kind, &self.fetcher, work_dir, auth)
                .await?
        };
        hooks.progress(10).await;

        // workflows run step by step under the dispatcher
        if let Some(package) = &package {
            if package.is_workflow() {
                return execute_workflow(
                    package,
                    &staged,
                    &self.registry,
                    &self.settings,
                    &self.fetcher,
                    auth,
                    work_dir,
                    STEP_TIMEOUT,
                    hooks,
                )
                .await;
            }
        }

        let mut output_globs = BTreeMap::new();
        if let Some(package) = &package {
            for output in &model.outputs {
                output_globs.insert(output.id.clone(), package.output_glob(&output.id));
            }
        }

        let ctx = StepContext {
            step_id: job.process_id.clone(),
            requirement: requirement.clone(),
            document: package
                .as_ref()
                .map(|p| p.document.clone())
                .unwrap_or(Value::Null),
            inputs: staged,
            output_globs,
            work_dir: work_dir.clone(),
            auth: auth.clone(),
            settings: self.settings.clone(),
            fetcher: self.fetcher.clone(),
            timeout: STEP_TIMEOUT,
        };
        let runner = self.registry.for_requirement(&requirement);

        let mut notices = Vec::new();
        let result = run_step_with_retries(runner.as_ref(), &ctx, |attempt, err| {
            notices.push(format!(
                "retrying step {} after attempt {}: {}",
                ctx.step_id, attempt, err
            ));
        })
        .await;
        for notice in notices {
            hooks.log("WARNING", &notice).await;
        }
        let outputs = result?;
        hooks
            .step_finished(&job.process_id, Duration::from_secs(0))
            .await;
        hooks.progress(90).await;
        Ok(outputs)
    }

    async fn write_prov(
        &self,
        job: &JobRow,
        prov: &ProvDocument,
    ) -> weft_core::error::Result<()> {
        let dir = self
            .settings
            .job_output_dir(job.output_context.as_deref(), job.id)
            .join("prov");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create prov dir: {}", e)))?;
        let model = serde_json::to_vec_pretty(prov)
            .map_err(|e| Error::Internal(anyhow::anyhow!("serialize prov: {}", e)))?;
        tokio::fs::write(dir.join("model.json"), model)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write prov: {}", e)))?;
        Ok(())
    }

    async fn finish_failed(&self, job: &JobRow, err: &Error) {
        // a racing dismissal keeps its terminal state
        if let Ok(Some(current)) = self.db.get_job(job.id).await {
            if current.is_terminal() {
                tracing::debug!(job_id = %job.id, "job reached a terminal state concurrently");
                return;
            }
        }
        tracing::warn!(job_id = %job.id, error = %err, "job failed");
        let exception = json!({
            "code": err.code(),
            "locator": job.process_id,
            "text": err.to_string(),
        });
        let _ = self.db.append_job_exception(job.id, exception).await;
        let _ = self
            .db
            .append_job_log(job.id, "ERROR", &format!("job failed: {}", err))
            .await;
        // progress stays frozen at its last real value
        let result = self
            .db
            .transition_job(
                job.id,
                JobStatus::Failed,
                UpdateJob {
                    message: Some(err.to_string()),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            tracing::error!(job_id = %job.id, error = %e, "failed to mark job failed");
        }
    }

    /// Dismissal cleanup: remove staged inputs and any published outputs.
    async fn finish_dismissed(&self, job: &JobRow) {
        tracing::info!(job_id = %job.id, "job dismissed mid-run, cleaning up");
        let work_dir = self.settings.wps_workdir.join(job.id.to_string());
        let _ = tokio::fs::remove_dir_all(&work_dir).await;
        let out_dir = self
            .settings
            .job_output_dir(job.output_context.as_deref(), job.id);
        let _ = tokio::fs::remove_dir_all(&out_dir).await;
        let result = self
            .db
            .transition_job(
                job.id,
                JobStatus::Dismissed,
                UpdateJob {
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            tracing::debug!(job_id = %job.id, error = %e, "job already terminal during dismissal");
        }
        let _ = self
            .db
            .append_job_log(job.id, "INFO", "job dismissed")
            .await;
    }

    async fn notify_subscribers(&self, job: &JobRow) {
        let Some(encrypted) = &job.subscribers_encrypted else {
            return;
        };
        let Some(crypto) = &self.crypto else {
            tracing::debug!(job_id = %job.id, "subscribers present but no crypto configured");
            return;
        };
        let subscribers: Subscribers = match crypto
            .open(job.id, encrypted)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(subscribers) => subscribers,
            None => {
                tracing::warn!(job_id = %job.id, "failed to decode job subscribers");
                return;
            }
        };
        notify::notify(&self.settings, job, &subscribers).await;
    }
}

fn reference_of(value: &ExecuteValue) -> Option<String> {
    value.href().map(String::from)
}

/// Untyped input mapping for provider jobs: references become URL strings,
/// qualified values unwrap, arrays recurse.
fn passthrough_inputs(inputs: &BTreeMap<String, ExecuteValue>) -> BTreeMap<String, Value> {
    fn convert(value: &ExecuteValue) -> Value {
        match value {
            ExecuteValue::Reference { href, .. } => Value::String(href.clone()),
            ExecuteValue::Qualified { value, .. } => value.clone(),
            ExecuteValue::Array(items) => Value::Array(items.iter().map(convert).collect()),
            ExecuteValue::Literal(raw) => raw.clone(),
        }
    }
    inputs
        .iter()
        .map(|(id, value)| (id.clone(), convert(value)))
        .collect()
}
