// Runner registry: one runner per requirement class, all implementing the
// same submit/monitor/collect contract. Step-level retries wrap the whole
// contract for errors on the recoverable whitelist.

pub mod builtin;
pub mod esgf;
pub mod local;
pub mod ogcapi;
pub mod wps1;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weft_core::auth::AuthContext;
use weft_core::builtin::Artifact;
use weft_core::config::Settings;
use weft_core::error::{Error, Result};
use weft_core::fetch::Fetcher;
use weft_core::package::StepRequirement;

/// Outputs collected from one step: output id to produced artifacts.
pub type StepOutputs = BTreeMap<String, Vec<Artifact>>;

/// Everything a runner needs to execute one step.
#[derive(Clone)]
pub struct StepContext {
    /// Step identifier (the process id itself for single-tool jobs).
    pub step_id: String,
    /// The requirement that selected the runner; carries remote endpoints.
    pub requirement: StepRequirement,
    /// CWL run document for local execution; Null for remote dialects.
    pub document: Value,
    /// Resolved inputs: literals as values, staged files as path strings
    /// for local runners or URLs for remote ones.
    pub inputs: BTreeMap<String, Value>,
    /// Declared output ids with their collection globs, when known.
    pub output_globs: BTreeMap<String, Option<String>>,
    pub work_dir: PathBuf,
    pub auth: AuthContext,
    pub settings: Arc<Settings>,
    pub fetcher: Arc<Fetcher>,
    /// Wall-clock budget for the whole step.
    pub timeout: Duration,
}

/// Which runner executes a step. Mirrors the requirement classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    LocalCwl,
    LocalCwlGpu,
    Wps1,
    OgcApi,
    EsgfCwt,
    Builtin,
}

impl RunnerKind {
    pub fn for_requirement(requirement: &StepRequirement) -> RunnerKind {
        match requirement {
            StepRequirement::Docker { .. } => RunnerKind::LocalCwl,
            StepRequirement::Cuda => RunnerKind::LocalCwlGpu,
            StepRequirement::Wps1 { .. } => RunnerKind::Wps1,
            StepRequirement::OgcApi { .. } => RunnerKind::OgcApi,
            StepRequirement::EsgfCwt { .. } => RunnerKind::EsgfCwt,
            StepRequirement::Builtin { .. } => RunnerKind::Builtin,
        }
    }

    /// Local runners need staged files; remote ones can take URLs.
    pub fn wants_local_files(self) -> bool {
        matches!(
            self,
            RunnerKind::LocalCwl | RunnerKind::LocalCwlGpu | RunnerKind::Builtin
        )
    }
}

/// Contract every runner implements.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Submit the step and drive it to completion, returning its outputs.
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs>;

    /// Best-effort cancellation of an in-flight submission.
    async fn cancel(&self, ctx: &StepContext) -> Result<()> {
        tracing::debug!(step = %ctx.step_id, "runner has no cancel hook");
        Ok(())
    }
}

/// Registry mapping requirement classes to runners.
pub struct RunnerRegistry {
    local: Arc<local::LocalCwlRunner>,
    wps1: Arc<wps1::Wps1Runner>,
    ogc: Arc<ogcapi::OgcApiRunner>,
    esgf: Arc<esgf::EsgfCwtRunner>,
    builtin: Arc<builtin::BuiltinRunner>,
}

impl RunnerRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction is infallible here");
        Self {
            local: Arc::new(local::LocalCwlRunner::new(settings.clone(), false)),
            wps1: Arc::new(wps1::Wps1Runner::new(client.clone())),
            ogc: Arc::new(ogcapi::OgcApiRunner::new(client.clone())),
            esgf: Arc::new(esgf::EsgfCwtRunner::new(client)),
            builtin: Arc::new(builtin::BuiltinRunner::new()),
        }
    }

    pub fn for_requirement(&self, requirement: &StepRequirement) -> Arc<dyn StepRunner> {
        match RunnerKind::for_requirement(requirement) {
            RunnerKind::LocalCwl => self.local.clone(),
            RunnerKind::LocalCwlGpu => {
                Arc::new(local::LocalCwlRunner::new(self.local.settings(), true))
            }
            RunnerKind::Wps1 => self.wps1.clone(),
            RunnerKind::OgcApi => self.ogc.clone(),
            RunnerKind::EsgfCwt => self.esgf.clone(),
            RunnerKind::Builtin => self.builtin.clone(),
        }
    }
}

/// Number of attempts for steps failing with recoverable errors.
pub const STEP_RETRY_ATTEMPTS: u32 = 3;

/// Run a step with step-scoped retries on the recoverable whitelist.
pub async fn run_step_with_retries(
    runner: &dyn StepRunner,
    ctx: &StepContext,
    mut on_retry: impl FnMut(u32, &Error) + Send,
) -> Result<StepOutputs> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match runner.execute(ctx).await {
            Ok(outputs) => return Ok(outputs),
            Err(err) if err.is_recoverable() && attempt < STEP_RETRY_ATTEMPTS => {
                on_retry(attempt, &err);
                let delay = Duration::from_millis(500) * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay.min(Duration::from_secs(30))).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_kind_mapping() {
        assert_eq!(
            RunnerKind::for_requirement(&StepRequirement::Docker { image: None }),
            RunnerKind::LocalCwl
        );
        assert_eq!(
            RunnerKind::for_requirement(&StepRequirement::Cuda),
            RunnerKind::LocalCwlGpu
        );
        assert_eq!(
            RunnerKind::for_requirement(&StepRequirement::Builtin {
                process: "echo".into()
            }),
            RunnerKind::Builtin
        );
    }

    #[test]
    fn locality_per_kind() {
        assert!(RunnerKind::LocalCwl.wants_local_files());
        assert!(RunnerKind::Builtin.wants_local_files());
        assert!(!RunnerKind::Wps1.wants_local_files());
        assert!(!RunnerKind::OgcApi.wants_local_files());
    }

    struct FlakyRunner {
        failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl StepRunner for FlakyRunner {
        async fn execute(&self, _ctx: &StepContext) -> Result<StepOutputs> {
            use std::sync::atomic::Ordering;
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if f > 0 {
                    Some(f - 1)
                } else {
                    None
                }
            }).is_ok()
            {
                return Err(Error::step("flaky", "503 from upstream"));
            }
            Ok(StepOutputs::new())
        }
    }

    fn test_ctx() -> StepContext {
        let settings = Arc::new(test_settings());
        StepContext {
            step_id: "flaky".into(),
            requirement: StepRequirement::Docker { image: None },
            document: Value::Null,
            inputs: BTreeMap::new(),
            output_globs: BTreeMap::new(),
            work_dir: std::env::temp_dir(),
            auth: AuthContext::default(),
            settings: settings.clone(),
            fetcher: Arc::new(Fetcher::new(settings)),
            timeout: Duration::from_secs(5),
        }
    }

    fn test_settings() -> Settings {
        use weft_core::config::{Configuration, RequestOptions};
        Settings {
            configuration: Configuration::Default,
            url: "http://localhost:9000".into(),
            wps_output_dir: std::env::temp_dir(),
            wps_output_url: "http://localhost:9000/wpsoutputs".into(),
            wps_output_s3_bucket: None,
            wps_output_s3_region: None,
            wps_output_context: None,
            wps_workdir: std::env::temp_dir(),
            cwl_euid: None,
            cwl_egid: None,
            execute_sync_max_wait: 20,
            wps_max_request_size: 30 * 1024 * 1024,
            wps_max_single_input_size: 3 * 1024 * 1024 * 1024,
            request_options: RequestOptions::empty(),
            cwl_processes_dir: None,
            cwl_processes_register_error: false,
            cwl_prov: true,
            schema_url: String::new(),
            wps_email_notify_timeout: 10,
            vault_dir: std::env::temp_dir(),
            vault_secret: None,
            file_allowlist: vec![],
            cwl_engine: "cwltool".into(),
        }
    }

    #[tokio::test]
    async fn recoverable_failures_are_retried() {
        let runner = FlakyRunner {
            failures: std::sync::atomic::AtomicU32::new(1),
        };
        let mut retries = Vec::new();
        let outputs = run_step_with_retries(&runner, &test_ctx(), |attempt, err| {
            retries.push((attempt, err.code()));
        })
        .await
        .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(retries, vec![(1, "STEP_FAILED")]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let runner = FlakyRunner {
            failures: std::sync::atomic::AtomicU32::new(10),
        };
        let err = run_step_with_retries(&runner, &test_ctx(), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STEP_FAILED");
    }
}
