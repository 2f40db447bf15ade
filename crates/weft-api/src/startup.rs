// Startup registration: built-in processes via idempotent upsert, plus a
// configurable directory of preloaded CWL processes.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use weft_core::builtin::Builtin;
use weft_core::config::Settings;
use weft_core::fetch::Fetcher;
use weft_core::package::{ExecutionUnit, Package};
use weft_storage::{CreateProcess, Database};

use crate::deploy;

/// Register every built-in. Versions only move when implementations change,
/// so repeated startups are no-ops.
pub async fn register_builtins(db: &Database) -> Result<()> {
    for builtin in Builtin::ALL {
        let model = builtin.model();
        let id = model.id.clone();
        let version = model.version.clone();
        db.upsert_builtin(CreateProcess {
            model,
            execution_unit: ExecutionUnit::Cwl(builtin_unit(builtin)),
            package: Some(builtin_unit(builtin)),
        })
        .await
        .with_context(|| format!("failed to register builtin '{}'", id))?;
        tracing::debug!(process_id = %id, version = %version, "builtin registered");
    }
    tracing::info!(count = Builtin::ALL.len(), "builtins registered");
    Ok(())
}

/// Minimal CWL document routing a builtin through the dispatcher.
fn builtin_unit(builtin: Builtin) -> Value {
    serde_json::json!({
        "cwlVersion": "v1.2",
        "class": "CommandLineTool",
        "id": builtin.id(),
        "hints": {
            "weft:BuiltinRequirement": { "process": builtin.id() }
        },
        "inputs": {},
        "outputs": {}
    })
}

/// Register the preloaded CWL processes directory, when configured.
/// Failures abort startup only with the fail-fast toggle set.
pub async fn register_cwl_directory(
    db: &Database,
    settings: &Arc<Settings>,
    fetcher: &Fetcher,
) -> Result<()> {
    let Some(dir) = &settings.cwl_processes_dir else {
        return Ok(());
    };
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;
    let mut registered = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !matches!(extension, "cwl" | "json" | "yml" | "yaml") {
            continue;
        }
        let result = register_one(db, settings, fetcher, &path).await;
        match result {
            Ok(id) => {
                registered += 1;
                tracing::info!(process_id = %id, path = %path.display(), "preloaded CWL process");
            }
            Err(e) if settings.cwl_processes_register_error => {
                return Err(e.context(format!("failed to register {}", path.display())));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping preloaded CWL process");
            }
        }
    }
    if registered > 0 {
        tracing::info!(count = registered, "preloaded CWL processes registered");
    }
    Ok(())
}

async fn register_one(
    db: &Database,
    settings: &Arc<Settings>,
    fetcher: &Fetcher,
    path: &std::path::Path,
) -> Result<String> {
    let raw = tokio::fs::read_to_string(path).await?;
    let package = Package::from_text(&raw).map_err(|e| anyhow::anyhow!(e))?;
    let id = package
        .id()
        .map(String::from)
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(String::from)
        })
        .context("CWL document without id")?;

    if db.get_process(&id, None).await?.is_some() {
        return Ok(id);
    }

    let mut document = package.document.clone();
    if document.get("id").is_none() {
        if let Some(object) = document.as_object_mut() {
            object.insert("id".into(), Value::String(id.clone()));
        }
    }
    let payload = serde_json::json!({
        "processDescription": { "process": { "id": id, "visibility": "public" } },
        "executionUnit": [{ "unit": document }]
    });
    let outcome = deploy::build_process(settings, fetcher, payload, None, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    db.create_process(outcome.create).await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::package::StepRequirement;

    #[test]
    fn builtin_units_route_through_dispatcher() {
        for builtin in Builtin::ALL {
            let unit = builtin_unit(builtin);
            let package = Package::from_value(unit).unwrap();
            assert_eq!(
                package.dispatch_requirement(),
                StepRequirement::Builtin {
                    process: builtin.id().to_string()
                }
            );
        }
    }
}
