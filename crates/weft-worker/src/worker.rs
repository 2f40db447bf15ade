// Worker pool: polls the queue, runs one job per slot, and owns the
// periodic cleanup of stale claims, finished queue rows and expired vault
// records.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;

use weft_core::config::Settings;
use weft_core::fetch::Fetcher;
use weft_core::vault::VaultCrypto;
use weft_storage::{Database, Queue, VaultStore};

use crate::execute::JobExecutor;

const POLL_IDLE: Duration = Duration::from_millis(500);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const STALE_CLAIM_AFTER: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent job slots in this process; each slot runs one job.
    pub slots: usize,
    /// Stable identifier recorded on claims.
    pub worker_id: String,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let slots = std::env::var("WEFT_WORKER_SLOTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        let worker_id = std::env::var("WEFT_WORKER_ID")
            .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::now_v7()));
        Self { slots, worker_id }
    }
}

pub struct Worker {
    config: WorkerConfig,
    queue: Queue,
    executor: Arc<JobExecutor>,
    vault: Option<VaultStore>,
}

impl Worker {
    pub fn new(db: Database, settings: Arc<Settings>, config: WorkerConfig) -> Self {
        let queue = Queue::new(db.pool().clone());
        let crypto = settings
            .vault_secret
            .as_ref()
            .map(|secret| VaultCrypto::new(secret));
        let vault = crypto.as_ref().map(|crypto| {
            VaultStore::new(db.clone(), crypto.clone(), settings.vault_dir.clone())
        });
        let mut fetcher = Fetcher::new(settings.clone());
        if let Some(vault) = &vault {
            fetcher = fetcher.with_vault(Arc::new(vault.clone()));
        }
        let executor = Arc::new(JobExecutor::new(
            db,
            queue.clone(),
            settings,
            Arc::new(fetcher),
            crypto,
        ));
        Self {
            config,
            queue,
            executor,
            vault,
        }
    }

    /// Run until the process is stopped. Spawns the cleanup loop and
    /// consumes the queue with bounded concurrency.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            worker_id = %self.config.worker_id,
            slots = self.config.slots,
            "worker started"
        );

        let cleanup_queue = self.queue.clone();
        let cleanup_vault = self.vault.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                match cleanup_queue.requeue_stale(STALE_CLAIM_AFTER).await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!(count = n, "re-queued stale claims"),
                    Err(e) => tracing::warn!(error = %e, "stale claim sweep failed"),
                }
                if let Err(e) = cleanup_queue.cleanup_finished().await {
                    tracing::warn!(error = %e, "queue cleanup failed");
                }
                if let Some(vault) = &cleanup_vault {
                    match vault.cleanup_expired().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(count = n, "expired vault records removed"),
                        Err(e) => tracing::warn!(error = %e, "vault cleanup failed"),
                    }
                }
            }
        });

        let slots = Arc::new(Semaphore::new(self.config.slots));
        loop {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closes");
            match self.queue.claim(&self.config.worker_id).await {
                Ok(Some(job_id)) => {
                    tracing::info!(job_id = %job_id, "claimed job");
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        executor.execute(job_id).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(POLL_IDLE).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "queue claim failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
