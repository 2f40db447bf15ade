// End-to-end dispatcher test: a two-step workflow whose first step runs the
// in-process echo builtin and whose second step targets a WPS 1.0 server
// that fails once with 503 before succeeding.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

use weft_core::auth::AuthContext;
use weft_core::builtin::Artifact;
use weft_core::config::{Configuration, RequestOptions, Settings};
use weft_core::fetch::Fetcher;
use weft_core::package::Package;
use weft_worker::dispatch::{execute_workflow, ExecutionHooks};
use weft_worker::RunnerRegistry;

struct RecordingHooks {
    logs: Mutex<Vec<String>>,
    progress: Mutex<Vec<u8>>,
}

#[async_trait]
impl ExecutionHooks for RecordingHooks {
    async fn log(&self, _level: &str, message: &str) {
        self.logs.lock().await.push(message.to_string());
    }

    async fn is_cancelled(&self) -> bool {
        false
    }

    async fn progress(&self, percent: u8) {
        self.progress.lock().await.push(percent);
    }

    async fn step_finished(&self, _step_id: &str, _duration: Duration) {}
}

fn settings(dir: &Path) -> Arc<Settings> {
    Arc::new(Settings {
        configuration: Configuration::Hybrid,
        url: "http://localhost:9000".into(),
        wps_output_dir: dir.join("outputs"),
        wps_output_url: "http://localhost:9000/wpsoutputs".into(),
        wps_output_s3_bucket: None,
        wps_output_s3_region: None,
        wps_output_context: None,
        wps_workdir: dir.to_path_buf(),
        cwl_euid: None,
        cwl_egid: None,
        execute_sync_max_wait: 20,
        wps_max_request_size: 30 * 1024 * 1024,
        wps_max_single_input_size: 1024 * 1024,
        request_options: RequestOptions::empty(),
        cwl_processes_dir: None,
        cwl_processes_register_error: false,
        cwl_prov: true,
        schema_url: String::new(),
        wps_email_notify_timeout: 10,
        vault_dir: dir.join("vault"),
        vault_secret: None,
        file_allowlist: vec![dir.to_path_buf()],
        cwl_engine: "cwltool".into(),
    })
}

/// Responds 503 on the first call and a succeeded ExecuteResponse after.
struct FlakyWps {
    calls: std::sync::atomic::AtomicU32,
    output_url: String,
}

impl Respond for FlakyWps {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let call = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call == 0 {
            ResponseTemplate::new(503)
        } else {
            ResponseTemplate::new(200).set_body_string(format!(
                r#"<ExecuteResponse>
                     <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
                     <ProcessOutputs>
                       <Output>
                         <Identifier>out</Identifier>
                         <Reference href="{}" mimeType="text/plain"/>
                       </Output>
                     </ProcessOutputs>
                   </ExecuteResponse>"#,
                self.output_url
            ))
        }
    }
}

fn workflow(provider: &str) -> Package {
    Package::from_value(json!({
        "cwlVersion": "v1.2",
        "class": "Workflow",
        "inputs": {"message": "string"},
        "outputs": {
            "final": {"type": "File", "outputSource": "remote/out"}
        },
        "steps": {
            "local": {
                "run": {
                    "cwlVersion": "v1.2",
                    "class": "CommandLineTool",
                    "hints": {"weft:BuiltinRequirement": {"process": "echo"}},
                    "inputs": {"message": "string"},
                    "outputs": {"echoed": "string"}
                },
                "in": {"message": {"source": "message"}},
                "out": ["echoed"]
            },
            "remote": {
                "run": "remote.cwl",
                "hints": {"weft:WPS1Requirement": {"provider": provider, "process": "passthrough"}},
                "in": {"text": {"source": "local/echoed"}},
                "out": ["out"]
            }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn workflow_retries_remote_step_and_collects_outputs() {
    let server = MockServer::start().await;
    // the produced artifact the remote step points back at
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("remote result"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(FlakyWps {
            calls: std::sync::atomic::AtomicU32::new(0),
            output_url: format!("{}/out.txt", server.uri()),
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let fetcher = Arc::new(Fetcher::new(settings.clone()));
    let registry = RunnerRegistry::new(settings.clone());
    let hooks = RecordingHooks {
        logs: Mutex::new(Vec::new()),
        progress: Mutex::new(Vec::new()),
    };

    let mut inputs = BTreeMap::new();
    inputs.insert("message".to_string(), json!("hello"));

    let package = workflow(&server.uri());
    let outputs = execute_workflow(
        &package,
        &inputs,
        &registry,
        &settings,
        &fetcher,
        &AuthContext::default(),
        dir.path(),
        Duration::from_secs(30),
        &hooks,
    )
    .await
    .unwrap();

    // the workflow output resolves to the relocated remote artifact
    let artifacts = outputs.get("final").expect("final output collected");
    assert_eq!(artifacts.len(), 1);
    let Artifact::File { path, .. } = &artifacts[0] else {
        panic!("expected a file artifact");
    };
    assert!(path.starts_with(dir.path().join("remote").join("out")));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "remote result");

    let logs = hooks.logs.lock().await;
    assert!(
        logs.iter().any(|m| m.contains("retrying step remote")),
        "logs: {:?}",
        logs
    );
    assert!(logs.iter().any(|m| m.contains("step remote completed")));

    // progress only moves forward
    let progress = hooks.progress.lock().await;
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}
