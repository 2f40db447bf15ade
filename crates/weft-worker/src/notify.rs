// Subscriber notification: callback URLs receive the status document,
// email delivery is recorded as intent only (the transport lives outside
// the core). Failures are logged and never alter job state.

use std::sync::Arc;
use std::time::Duration;

use weft_contracts::{JobStatus, StatusProfile, Subscribers};
use weft_core::config::Settings;
use weft_storage::JobRow;

pub async fn notify(settings: &Arc<Settings>, job: &JobRow, subscribers: &Subscribers) {
    let status = job.status();
    let (uri, email) = match status {
        JobStatus::Successful => (
            subscribers.success_uri.as_deref(),
            subscribers.success_email.as_deref(),
        ),
        JobStatus::Failed | JobStatus::Dismissed => (
            subscribers.failed_uri.as_deref(),
            subscribers.failed_email.as_deref(),
        ),
        JobStatus::Running | JobStatus::Started => (
            subscribers.in_progress_uri.as_deref(),
            subscribers.in_progress_email.as_deref(),
        ),
        _ => (None, None),
    };

    if let Some(uri) = uri {
        let body = job.to_status_info(StatusProfile::Ogc);
        let timeout = Duration::from_secs(settings.wps_email_notify_timeout.max(5));
        let client = reqwest::Client::new();
        match client.post(uri).json(&body).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(job_id = %job.id, uri, "subscriber callback delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    job_id = %job.id,
                    uri,
                    status = %response.status(),
                    "subscriber callback rejected"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, uri, error = %e, "subscriber callback failed");
            }
        }
    }

    if let Some(email) = email {
        // transport is out of scope; record the intent
        tracing::info!(
            job_id = %job.id,
            email,
            status = %status,
            "email notification requested"
        );
    }
}
